//! Plain single-container harness.
//!
//! The simplest sandbox shape: one container started from the caller's
//! test image and held alive, with commands delivered by exec.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Command, Harness};
use crate::content::untar_files;
use crate::engine::{
    ContainerRequest, ContainerResponse, Engine, Healthcheck, Mount, Resources, DEFAULT_NETWORK,
};
use crate::error::{Error, Result};
use crate::registry::Reference;
use crate::teardown::TeardownStack;

/// Configuration for a plain container harness
#[derive(Debug, Clone)]
pub struct ContainerHarnessConfig {
    /// Image the sandbox runs
    pub image: Reference,
    /// Container name; generated when absent
    pub name: Option<String>,
    /// Environment variables for the sandbox
    pub env: std::collections::BTreeMap<String, String>,
    /// Mounts attached to the sandbox
    pub mounts: Vec<Mount>,
    /// Extended privileges
    pub privileged: bool,
    /// Resource limits
    pub resources: Resources,
    /// Healthcheck on the sandbox container; watched while commands run
    pub sandbox_healthcheck: Option<Healthcheck>,
}

impl ContainerHarnessConfig {
    /// Configuration with defaults for the given image
    pub fn new(image: Reference) -> Self {
        Self {
            image,
            name: None,
            env: Default::default(),
            mounts: Vec::new(),
            privileged: false,
            resources: Resources::default(),
            sandbox_healthcheck: None,
        }
    }
}

/// A harness backed by one long-lived container.
pub struct ContainerHarness {
    engine: Arc<Engine>,
    config: ContainerHarnessConfig,
    stack: TeardownStack,
    sandbox: Mutex<Option<ContainerResponse>>,
}

impl ContainerHarness {
    /// Create a harness over the given engine
    pub fn new(engine: Arc<Engine>, config: ContainerHarnessConfig) -> Self {
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
}

#[async_trait]
impl Harness for ContainerHarness {
    async fn create(&self, cancel: &CancellationToken) -> Result<()> {
        let network = self.engine.create_network(DEFAULT_NETWORK).await?;

        let mut request = ContainerRequest::new(self.config.image.clone())
            .entrypoint(vec!["/bin/sh".to_string(), "-c".to_string()])
            .cmd(vec!["tail -f /dev/null".to_string()])
            .network(network)
            .resources(self.config.resources.clone());
        if let Some(name) = &self.config.name {
            request = request.name(name.clone());
        }
        for (key, value) in &self.config.env {
            request = request.env(key.clone(), value.clone());
        }
        for mount in &self.config.mounts {
            request = request.mount(mount.clone());
        }
        if self.config.privileged {
            request = request.privileged();
        }
        if let Some(healthcheck) = &self.config.sandbox_healthcheck {
            request = request.healthcheck(healthcheck.clone());
        }

        let response = self.engine.start(request, cancel).await?;
        debug!(container = %response.id, "sandbox container running");

        let engine = Arc::clone(&self.engine);
        let release = response.clone();
        self.stack.add(
            format!("remove container {}", release.name),
            async move { engine.remove(&release).await },
        )?;

        *self.sandbox.lock().await = Some(response);
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken, command: Command) -> Result<()> {
        let id = self.sandbox_id().await?;
        let watch = self.config.sandbox_healthcheck.is_some();
        tokio::select! {
            result = self.engine.exec_watched(&id, command, watch) => result,
            () = cancel.cancelled() => Err(Error::cancelled("sandbox exec")),
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
    fn test_config_defaults() {
        let config =
            ContainerHarnessConfig::new(Reference::parse("cgr.dev/chainguard/wolfi-base").unwrap());
        assert!(config.name.is_none());
        assert!(!config.privileged);
        assert!(config.mounts.is_empty());
    }
}
