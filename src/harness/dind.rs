//! Docker-in-Docker harness.
//!
//! Two containers share a dedicated network: a privileged daemon running a
//! dind image, and the sandbox running the caller's test image with its
//! engine pointed at the daemon over TLS. Client certificates are pulled
//! out of the daemon once it reports healthy and copied into the sandbox,
//! together with a registry auth blob and the daemon configuration.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Command, Harness};
use crate::content::{untar_files, Content};
use crate::engine::{ContainerRequest, ContainerResponse, Engine, Healthcheck};
use crate::error::{Error, Result};
use crate::registry::auth::Keychain;
use crate::registry::Reference;
use crate::teardown::TeardownStack;

/// Where the daemon keeps its TLS material
const CERT_DIR: &str = "/certs";
/// Client certificate directory inside both containers
const CLIENT_CERT_DIR: &str = "/certs/client";
/// The three client credentials the sandbox needs
const CLIENT_CERT_FILES: [&str; 3] = ["ca.pem", "cert.pem", "key.pem"];
/// Daemon TLS port
const DAEMON_PORT: u16 = 2376;
/// Address pool handed to the inner daemon, non-overlapping with the outer
const DEFAULT_ADDRESS_POOL: &str = "base=172.30.0.0/16,size=24";

/// Configuration for a Docker-in-Docker harness
#[derive(Debug, Clone)]
pub struct DindConfig {
    /// Test image run as the sandbox
    pub image: Reference,
    /// Image for the inner daemon
    pub dind_image: Reference,
    /// Registry mirrors configured on the inner daemon
    pub mirrors: Vec<String>,
    /// Registries whose credentials are materialized in the sandbox
    pub auth_registries: Vec<String>,
    /// Healthcheck on the sandbox container; watched while commands run
    pub sandbox_healthcheck: Option<Healthcheck>,
}

impl DindConfig {
    /// Configuration with the stock dind image
    pub fn new(image: Reference) -> Result<Self> {
        Ok(Self {
            image,
            dind_image: Reference::parse("docker:dind")?,
            mirrors: Vec::new(),
            auth_registries: Vec::new(),
            sandbox_healthcheck: None,
        })
    }
}

/// Render the inner daemon's configuration document.
fn daemon_json(mirrors: &[String]) -> String {
    json!({
        "registry-mirrors": mirrors,
        "default-address-pool": DEFAULT_ADDRESS_POOL,
    })
    .to_string()
}

/// A harness running the payload against a private engine daemon.
pub struct DindHarness {
    engine: Arc<Engine>,
    config: DindConfig,
    keychain: Keychain,
    stack: TeardownStack,
    sandbox: Mutex<Option<ContainerResponse>>,
}

impl DindHarness {
    /// Create a harness over the given engine
    pub fn new(engine: Arc<Engine>, config: DindConfig) -> Result<Self> {
        Ok(Self {
            engine,
            config,
            keychain: Keychain::default_keychain()?,
            stack: TeardownStack::new(),
            sandbox: Mutex::new(None),
        })
    }

    /// Replace the keychain used for the sandbox auth blob
    #[must_use]
    pub fn with_keychain(mut self, keychain: Keychain) -> Self {
        self.keychain = keychain;
        self
    }

    async fn sandbox_id(&self) -> Result<String> {
        self.sandbox
            .lock()
            .await
            .as_ref()
            .map(|response| response.id.clone())
            .ok_or_else(|| Error::invalid_config("harness has not been created"))
    }

    async fn start_daemon(
        &self,
        network: crate::engine::NetworkAttachment,
        cancel: &CancellationToken,
    ) -> Result<ContainerResponse> {
        let name = self.engine.generate_name("dind");
        let healthcheck = Healthcheck {
            test: vec!["CMD".into(), "docker".into(), "info".into()],
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            retries: 5,
            start_period: Duration::from_secs(1),
        };
        let request = ContainerRequest::new(self.config.dind_image.clone())
            .name(name)
            .privileged()
            .network(network)
            .env("DOCKER_TLS_CERTDIR", CERT_DIR)
            .healthcheck(healthcheck)
            .content(Content::from_string(
                daemon_json(&self.config.mirrors),
                "/etc/docker/daemon.json",
            )?);

        let response = self.engine.start(request, cancel).await?;
        debug!(container = %response.id, "dind daemon healthy");

        let engine = Arc::clone(&self.engine);
        let release = response.clone();
        self.stack.add(
            format!("remove dind daemon {}", release.name),
            async move { engine.remove(&release).await },
        )?;
        Ok(response)
    }

    /// Read the client credentials out of the daemon's cert directory.
    ///
    /// Exactly `ca.pem`, `cert.pem`, and `key.pem` are selected; a missing
    /// file is fatal.
    async fn extract_client_certs(&self, daemon: &ContainerResponse) -> Result<Vec<(String, Vec<u8>)>> {
        let archive = self.engine.copy_out(&daemon.id, CLIENT_CERT_DIR).await?;
        let files = untar_files(&archive)?;
        let mut certs = Vec::with_capacity(CLIENT_CERT_FILES.len());
        for wanted in CLIENT_CERT_FILES {
            let found = files.iter().find_map(|(path, data)| {
                (path.rsplit('/').next() == Some(wanted)).then(|| data.clone())
            });
            match found {
                Some(data) => certs.push((wanted.to_string(), data)),
                None => {
                    return Err(Error::invalid_config(format!(
                        "daemon cert directory is missing {wanted}"
                    )))
                }
            }
        }
        Ok(certs)
    }

    async fn start_sandbox(
        &self,
        network: crate::engine::NetworkAttachment,
        daemon: &ContainerResponse,
        certs: Vec<(String, Vec<u8>)>,
        cancel: &CancellationToken,
    ) -> Result<ContainerResponse> {
        let auth_blob = self
            .keychain
            .render_config_json(&self.config.auth_registries)?;

        let mut request = ContainerRequest::new(self.config.image.clone())
            .name(self.engine.generate_name("sandbox"))
            .network(network)
            .entrypoint(vec!["/bin/sh".to_string(), "-c".to_string()])
            .cmd(vec!["tail -f /dev/null".to_string()])
            .env("DOCKER_HOST", format!("tcp://{}:{DAEMON_PORT}", daemon.name))
            .env("DOCKER_TLS_VERIFY", "1")
            .env("DOCKER_CERT_PATH", CLIENT_CERT_DIR)
            .content(Content::from_string(auth_blob, "/root/.docker/config.json")?);
        if let Some(healthcheck) = &self.config.sandbox_healthcheck {
            request = request.healthcheck(healthcheck.clone());
        }
        for (name, data) in certs {
            request = request.content(Content::from_bytes(
                data,
                format!("{CLIENT_CERT_DIR}/{name}"),
            )?);
        }

        let response = self.engine.start(request, cancel).await?;
        debug!(container = %response.id, "dind sandbox running");

        let engine = Arc::clone(&self.engine);
        let release = response.clone();
        self.stack.add(
            format!("remove dind sandbox {}", release.name),
            async move { engine.remove(&release).await },
        )?;
        Ok(response)
    }
}

#[async_trait]
impl Harness for DindHarness {
    async fn create(&self, cancel: &CancellationToken) -> Result<()> {
        let network = self.engine.create_network(&self.engine.generate_name("dind-net")).await?;
        {
            let engine = Arc::clone(&self.engine);
            let name = network.name.clone();
            self.stack.add(format!("remove network {name}"), async move {
                engine.remove_network(&name).await
            })?;
        }

        // Bring the daemon up while the sandbox image is pulled; first
        // failure cancels the sibling.
        let (daemon, ()) = tokio::try_join!(
            self.start_daemon(network.clone(), cancel),
            async {
                self.engine
                    .pull_if_missing(&self.config.image.to_string())
                    .await
            }
        )?;

        let certs = self.extract_client_certs(&daemon).await?;
        let sandbox = self.start_sandbox(network, &daemon, certs, cancel).await?;
        *self.sandbox.lock().await = Some(sandbox);
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken, command: Command) -> Result<()> {
        let id = self.sandbox_id().await?;
        let watch = self.config.sandbox_healthcheck.is_some();
        tokio::select! {
            result = self.engine.exec_watched(&id, command, watch) => result,
            () = cancel.cancelled() => Err(Error::cancelled("dind sandbox exec")),
        }
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        self.stack.teardown(cancel).await
    }

    async fn extract_file(&self, path: &str) -> Result<Vec<u8>> {
        let id = self.sandbox_id().await?;
        let archive = self.engine.copy_out(&id, path).await?;
        untar_files(&archive)?
            .into_values()
            .next()
            .ok_or_else(|| Error::not_found(format!("file {path} in sandbox")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_json_shape() {
        let rendered = daemon_json(&["https://mirror.gcr.io".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["registry-mirrors"][0], "https://mirror.gcr.io");
        assert_eq!(value["default-address-pool"], "base=172.30.0.0/16,size=24");
    }

    #[test]
    fn test_daemon_json_empty_mirrors() {
        let value: serde_json::Value = serde_json::from_str(&daemon_json(&[])).unwrap();
        assert!(value["registry-mirrors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_config_defaults() {
        let config =
            DindConfig::new(Reference::parse("cgr.dev/chainguard/docker-cli:latest").unwrap())
                .unwrap();
        assert_eq!(config.dind_image.repository, "library/docker");
        assert_eq!(config.dind_image.tag.as_deref(), Some("dind"));
    }
}
