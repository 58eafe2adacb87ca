//! k3s-in-container harness.
//!
//! A privileged k3s service container bootstraps a single-node cluster with
//! rendered `config.yaml` and `registries.yaml`, a fixed audit policy, and
//! tmpfs mounts for its runtime directories. The sandbox container runs the
//! caller's image with a kubeconfig extracted from the service and
//! rewritten to reach it by container DNS name.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Command, Harness};
use crate::content::{untar_files, Content};
use crate::engine::{
    ContainerRequest, ContainerResponse, Engine, Healthcheck, Mount, PublishedPort,
    DEFAULT_NETWORK,
};
use crate::error::{Error, Result};
use crate::registry::Reference;
use crate::teardown::TeardownStack;

const CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml";
const REGISTRIES_PATH: &str = "/etc/rancher/k3s/registries.yaml";
const AUDIT_POLICY_PATH: &str = "/etc/rancher/k3s/audit-policy.yaml";
const KUBELET_CONFIG_PATH: &str = "/etc/rancher/k3s/kubelet.yaml";
const KUBECONFIG_SOURCE: &str = "/etc/rancher/k3s/k3s.yaml";
const SANDBOX_KUBECONFIG: &str = "/root/.kube/config";

const AUDIT_POLICY: &str = "apiVersion: audit.k8s.io/v1
kind: Policy
rules:
  - level: RequestResponse
";

/// Credentials for one registry in `registries.yaml`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryAuth {
    /// Registry username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Registry password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// TLS settings for one registry in `registries.yaml`
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryTls {
    /// Skip server certificate verification
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
struct RegistryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<RegistryAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<RegistryTls>,
}

#[derive(Debug, Clone, Serialize)]
struct MirrorEntry {
    endpoint: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct RegistriesFile {
    mirrors: BTreeMap<String, MirrorEntry>,
    configs: BTreeMap<String, RegistryEntry>,
}

#[derive(Debug, Clone, Serialize)]
struct ConfigFile {
    #[serde(rename = "tls-san")]
    tls_san: Vec<String>,
    #[serde(rename = "https-listen-port")]
    https_listen_port: u16,
    disable: Vec<String>,
    #[serde(rename = "disable-network-policy")]
    disable_network_policy: bool,
    snapshotter: String,
    #[serde(rename = "kube-apiserver-arg")]
    kube_apiserver_arg: Vec<String>,
    #[serde(rename = "kubelet-arg", skip_serializing_if = "Option::is_none")]
    kubelet_arg: Option<Vec<String>>,
}

/// Configuration for a k3s-in-container harness
#[derive(Debug, Clone)]
pub struct K3sConfig {
    /// Test image run as the sandbox (a kubectl-capable image)
    pub image: Reference,
    /// Image for the k3s service container
    pub k3s_image: Reference,
    /// API server listen port
    pub api_port: u16,
    /// Keep traefik enabled
    pub traefik: bool,
    /// Keep the metrics server enabled
    pub metrics_server: bool,
    /// Keep the default network policy controller enabled
    pub network_policy: bool,
    /// Containerd snapshotter
    pub snapshotter: String,
    /// Optional kubelet configuration file content
    pub kubelet_config: Option<String>,
    /// Registry mirrors: upstream -> endpoints
    pub mirrors: BTreeMap<String, Vec<String>>,
    /// Per-registry auth
    pub registry_auth: BTreeMap<String, RegistryAuth>,
    /// Per-registry TLS settings
    pub registry_tls: BTreeMap<String, RegistryTls>,
    /// Shell commands exec'd in the service container after start, in order
    pub post_start_hooks: Vec<String>,
    /// Healthcheck on the sandbox container; watched while commands run
    pub sandbox_healthcheck: Option<Healthcheck>,
}

impl K3sConfig {
    /// Configuration with defaults for the given sandbox image
    pub fn new(image: Reference) -> Result<Self> {
        Ok(Self {
            image,
            k3s_image: Reference::parse("cgr.dev/chainguard/k3s:latest")?,
            api_port: 6443,
            traefik: false,
            metrics_server: false,
            network_policy: false,
            snapshotter: "overlayfs".to_string(),
            kubelet_config: None,
            mirrors: BTreeMap::new(),
            registry_auth: BTreeMap::new(),
            registry_tls: BTreeMap::new(),
            post_start_hooks: Vec::new(),
            sandbox_healthcheck: None,
        })
    }

    fn render_config(&self, service_name: &str) -> Result<String> {
        let mut disable = Vec::new();
        if !self.traefik {
            disable.push("traefik".to_string());
        }
        if !self.metrics_server {
            disable.push("metrics-server".to_string());
        }
        let config = ConfigFile {
            tls_san: vec![service_name.to_string()],
            https_listen_port: self.api_port,
            disable,
            disable_network_policy: !self.network_policy,
            snapshotter: self.snapshotter.clone(),
            kube_apiserver_arg: vec![format!("audit-policy-file={AUDIT_POLICY_PATH}")],
            kubelet_arg: self
                .kubelet_config
                .as_ref()
                .map(|_| vec![format!("config={KUBELET_CONFIG_PATH}")]),
        };
        Ok(serde_yaml::to_string(&config)?)
    }

    fn render_registries(&self) -> Result<String> {
        let mut file = RegistriesFile::default();
        for (registry, endpoints) in &self.mirrors {
            file.mirrors.insert(
                registry.clone(),
                MirrorEntry {
                    endpoint: endpoints.clone(),
                },
            );
        }
        let registries: std::collections::BTreeSet<&String> = self
            .registry_auth
            .keys()
            .chain(self.registry_tls.keys())
            .collect();
        for registry in registries {
            file.configs.insert(
                registry.clone(),
                RegistryEntry {
                    auth: self.registry_auth.get(registry).cloned(),
                    tls: self.registry_tls.get(registry).cloned(),
                },
            );
        }
        Ok(serde_yaml::to_string(&file)?)
    }
}

/// Rewrite a kubeconfig so its server field targets the given URL.
fn rewrite_kubeconfig(raw: &[u8], server: &str) -> Result<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_slice(raw)?;
    let clusters = doc
        .get_mut("clusters")
        .and_then(serde_yaml::Value::as_sequence_mut)
        .ok_or_else(|| Error::invalid_config("kubeconfig has no clusters"))?;
    for cluster in clusters {
        if let Some(entry) = cluster.get_mut("cluster").and_then(serde_yaml::Value::as_mapping_mut)
        {
            entry.insert(
                serde_yaml::Value::from("server"),
                serde_yaml::Value::from(server),
            );
        }
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// A harness running the payload beside a single-node k3s cluster.
pub struct K3sHarness {
    engine: Arc<Engine>,
    config: K3sConfig,
    stack: TeardownStack,
    sandbox: Mutex<Option<ContainerResponse>>,
}

impl K3sHarness {
    /// Create a harness over the given engine
    pub fn new(engine: Arc<Engine>, config: K3sConfig) -> Self {
        Self {
            engine,
            config,
            stack: TeardownStack::new(),
            sandbox: Mutex::new(None),
        }
    }

    async fn sandbox_id(&self) -> Result<String> {
        self.sandbox
            .lock()
            .await
            .as_ref()
            .map(|response| response.id.clone())
            .ok_or_else(|| Error::invalid_config("harness has not been created"))
    }

    async fn start_service(
        &self,
        network: crate::engine::NetworkAttachment,
        cancel: &CancellationToken,
    ) -> Result<ContainerResponse> {
        let name = self.engine.generate_name("k3s");
        let mut request = ContainerRequest::new(self.config.k3s_image.clone())
            .name(name.clone())
            .privileged()
            .network(network)
            .cmd(vec!["server".to_string()])
            .mount(Mount::Tmpfs {
                target: "/run".to_string(),
                size: 0,
            })
            .mount(Mount::Tmpfs {
                target: "/tmp".to_string(),
                size: 0,
            })
            .publish(PublishedPort::ephemeral(self.config.api_port))
            .healthcheck(Healthcheck::new(vec![
                "CMD".to_string(),
                "kubectl".to_string(),
                "get".to_string(),
                "--raw=/healthz".to_string(),
            ]))
            .content(Content::from_string(
                self.config.render_config(&name)?,
                CONFIG_PATH,
            )?)
            .content(Content::from_string(
                self.config.render_registries()?,
                REGISTRIES_PATH,
            )?)
            .content(Content::from_string(AUDIT_POLICY, AUDIT_POLICY_PATH)?);
        if let Some(kubelet) = &self.config.kubelet_config {
            request = request.content(Content::from_string(kubelet.clone(), KUBELET_CONFIG_PATH)?);
        }

        let response = self.engine.start(request, cancel).await?;
        debug!(container = %response.id, "k3s service healthy");

        let engine = Arc::clone(&self.engine);
        let release = response.clone();
        self.stack.add(
            format!("remove k3s service {}", release.name),
            async move { engine.remove(&release).await },
        )?;
        Ok(response)
    }

    async fn start_sandbox(
        &self,
        service: &ContainerResponse,
        cancel: &CancellationToken,
    ) -> Result<ContainerResponse> {
        let archive = self.engine.copy_out(&service.id, KUBECONFIG_SOURCE).await?;
        let files = untar_files(&archive)?;
        let raw = files
            .values()
            .next()
            .ok_or_else(|| Error::not_found(format!("kubeconfig at {KUBECONFIG_SOURCE}")))?;
        let server = format!("https://{}:{}", service.name, self.config.api_port);
        let kubeconfig = rewrite_kubeconfig(raw, &server)?;

        let mut request = ContainerRequest::new(self.config.image.clone())
            .name(self.engine.generate_name("sandbox"))
            .entrypoint(vec!["/bin/sh".to_string(), "-c".to_string()])
            .cmd(vec!["tail -f /dev/null".to_string()])
            .env("KUBECONFIG", SANDBOX_KUBECONFIG)
            .content(Content::from_string(kubeconfig, SANDBOX_KUBECONFIG)?);
        if let Some(healthcheck) = &self.config.sandbox_healthcheck {
            request = request.healthcheck(healthcheck.clone());
        }
        // Join every network the service joined.
        for name in service.network_names() {
            if let Some(attachment) = self.engine.network_inspect(&name).await? {
                request = request.network(attachment);
            }
        }

        let response = self.engine.start(request, cancel).await?;
        debug!(container = %response.id, "k3s sandbox running");

        let engine = Arc::clone(&self.engine);
        let release = response.clone();
        self.stack.add(
            format!("remove k3s sandbox {}", release.name),
            async move { engine.remove(&release).await },
        )?;
        Ok(response)
    }
}

#[async_trait]
impl Harness for K3sHarness {
    async fn create(&self, cancel: &CancellationToken) -> Result<()> {
        let network = self.engine.create_network(DEFAULT_NETWORK).await?;

        let (service, ()) = tokio::try_join!(self.start_service(network, cancel), async {
            self.engine
                .pull_if_missing(&self.config.image.to_string())
                .await
        })?;

        // Post-start hooks run in declaration order; the first failure
        // aborts setup.
        for hook in &self.config.post_start_hooks {
            debug!(hook = %hook, "running post-start hook");
            self.engine
                .exec(&service.id, Command::shell(hook.clone()))
                .await?;
        }

        let sandbox = self.start_sandbox(&service, cancel).await?;
        *self.sandbox.lock().await = Some(sandbox);
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken, command: Command) -> Result<()> {
        let id = self.sandbox_id().await?;
        let watch = self.config.sandbox_healthcheck.is_some();
        tokio::select! {
            result = self.engine.exec_watched(&id, command, watch) => result,
            () = cancel.cancelled() => Err(Error::cancelled("k3s sandbox exec")),
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

    fn config() -> K3sConfig {
        K3sConfig::new(Reference::parse("cgr.dev/chainguard/kubectl:latest").unwrap()).unwrap()
    }

    #[test]
    fn test_render_config_defaults() {
        let rendered = config().render_config("imagetest-k3s-abc").unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["tls-san"][0], "imagetest-k3s-abc");
        assert_eq!(value["https-listen-port"], 6443);
        let disable: Vec<&str> = value["disable"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(disable, vec!["traefik", "metrics-server"]);
        assert_eq!(value["disable-network-policy"], true);
        assert_eq!(value["snapshotter"], "overlayfs");
        assert!(value.get("kubelet-arg").is_none());
    }

    #[test]
    fn test_render_config_kubelet_arg() {
        let mut config = config();
        config.kubelet_config = Some("maxPods: 42".to_string());
        let rendered = config.render_config("svc").unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["kubelet-arg"][0], "config=/etc/rancher/k3s/kubelet.yaml");
    }

    #[test]
    fn test_render_registries() {
        let mut config = config();
        config
            .mirrors
            .insert("docker.io".into(), vec!["https://mirror.gcr.io".into()]);
        config.registry_auth.insert(
            "registry.example.com".into(),
            RegistryAuth {
                username: Some("u".into()),
                password: Some("p".into()),
            },
        );
        config.registry_tls.insert(
            "registry.example.com".into(),
            RegistryTls {
                insecure_skip_verify: true,
            },
        );
        let rendered = config.render_registries().unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(value["mirrors"]["docker.io"]["endpoint"][0], "https://mirror.gcr.io");
        assert_eq!(value["configs"]["registry.example.com"]["auth"]["username"], "u");
        assert_eq!(
            value["configs"]["registry.example.com"]["tls"]["insecure_skip_verify"],
            true
        );
    }

    #[test]
    fn test_rewrite_kubeconfig() {
        let raw = b"apiVersion: v1
clusters:
  - name: default
    cluster:
      server: https://127.0.0.1:6443
      certificate-authority-data: Zm9v
contexts: []
";
        let rewritten = rewrite_kubeconfig(raw, "https://imagetest-k3s-abc:6443").unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&rewritten).unwrap();
        assert_eq!(
            value["clusters"][0]["cluster"]["server"],
            "https://imagetest-k3s-abc:6443"
        );
        assert_eq!(value["clusters"][0]["cluster"]["certificate-authority-data"], "Zm9v");
    }

    #[test]
    fn test_rewrite_kubeconfig_without_clusters_fails() {
        assert!(rewrite_kubeconfig(b"apiVersion: v1", "https://x").is_err());
    }

    #[test]
    fn test_audit_policy_is_valid_yaml() {
        let value: serde_yaml::Value = serde_yaml::from_str(AUDIT_POLICY).unwrap();
        assert_eq!(value["kind"], "Policy");
    }
}
