//! Terraform-provisioned harness.
//!
//! Copies a read-only terraform tree into a scratch directory, applies it,
//! and reads a JSON `connection` output that names either a container
//! engine host (optionally over SSH) or a Kubernetes cluster. Commands then
//! run against whichever backend the configuration reported.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::kubernetes::{KubeconfigSource, KubernetesConfig, KubernetesHarness};
use super::{Command, Harness};
use crate::content::untar_files;
use crate::engine::{Engine, EngineConfig};
use crate::error::{Error, Result};
use crate::executor::{ExecutionConfig, ProcessExecutor};
use crate::registry::Reference;

pub use super::kubernetes::SKIP_TEARDOWN_ENV;

/// Prefix for environment variables forwarded as terraform variables
pub const TF_VAR_FORWARD_PREFIX: &str = "IMAGETEST_TF_VAR_";

/// Backoff for re-reading the connection output
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySpec {
    /// Attempts before giving up
    pub attempts: u32,
    /// Initial delay in seconds
    pub delay: f64,
    /// Delay multiplier between attempts
    pub factor: f64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: 5.0,
            factor: 2.0,
        }
    }
}

/// Engine-backed connection details
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConnection {
    /// Container to attach to
    pub cid: String,
    /// Engine endpoint, e.g. `ssh://user@host`
    #[serde(default)]
    pub host: Option<String>,
    /// Key file in the workspace for `ssh://` hosts
    #[serde(default)]
    pub private_key_path: Option<String>,
}

/// Cluster-backed connection details
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConnection {
    /// Kubeconfig YAML inline
    #[serde(default)]
    pub kubeconfig: Option<String>,
    /// Path to a kubeconfig file
    #[serde(default)]
    pub kubeconfig_path: Option<String>,
    /// Image for the sandbox pod
    pub sandbox_image: String,
}

/// The `connection` output the applied configuration must produce
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Connection {
    /// Container engine backend
    #[serde(default)]
    pub docker: Option<DockerConnection>,
    /// Kubernetes backend
    #[serde(default)]
    pub kubernetes: Option<KubernetesConnection>,
    /// Retry policy for establishing the connection
    #[serde(default)]
    pub retry: Option<RetrySpec>,
}

/// Configuration for a terraform-provisioned harness
#[derive(Debug, Clone)]
pub struct PterraformConfig {
    /// Read-only terraform source tree
    pub source: PathBuf,
    /// Retry used when the connection output names none
    pub retry: RetrySpec,
}

impl PterraformConfig {
    /// Configuration for the given source tree
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            retry: RetrySpec::default(),
        }
    }
}

enum Backend {
    Docker {
        engine: Arc<Engine>,
        container_id: String,
    },
    Kubernetes(KubernetesHarness),
}

struct Applied {
    workdir: tempfile::TempDir,
    backend: Backend,
}

/// A harness whose sandbox lives on infrastructure terraform provisions.
pub struct PterraformHarness {
    config: PterraformConfig,
    applied: Mutex<Option<Applied>>,
}

impl PterraformHarness {
    /// Create a harness from the given configuration
    pub fn new(config: PterraformConfig) -> Self {
        Self {
            config,
            applied: Mutex::new(None),
        }
    }

    fn terraform(&self) -> Result<ProcessExecutor> {
        ProcessExecutor::find("terraform")
    }

    fn execution_config(workdir: &Path) -> ExecutionConfig {
        let mut config = ExecutionConfig::unbounded().cwd(workdir);
        // Host TF_VAR_* must not leak into the applied configuration.
        config.strip_environment = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with("TF_VAR_"))
            .collect();
        config
    }

    async fn apply(&self, workdir: &Path) -> Result<()> {
        let terraform = self.terraform()?;
        let config = Self::execution_config(workdir);

        let init = vec!["init".to_string(), "-input=false".to_string()];
        terraform.execute(&init, Some(config.clone())).await?;

        let mut apply = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
        ];
        apply.extend(forwarded_var_args(std::env::vars()));
        terraform.execute(&apply, Some(config)).await?;
        debug!(workdir = %workdir.display(), "terraform apply complete");
        Ok(())
    }

    async fn read_connection(&self, workdir: &Path) -> Result<Connection> {
        let terraform = self.terraform()?;
        let args = vec![
            "output".to_string(),
            "-json".to_string(),
            "connection".to_string(),
        ];
        let output = terraform
            .execute(&args, Some(Self::execution_config(workdir)))
            .await?;
        Ok(serde_json::from_str(&output.stdout)?)
    }

    async fn establish(&self, workdir: &Path, connection: &Connection) -> Result<Backend> {
        if let Some(docker) = &connection.docker {
            let ssh_key_path = docker
                .private_key_path
                .as_ref()
                .map(|path| workdir.join(path));
            let engine = Engine::new(EngineConfig {
                endpoint: docker.host.clone(),
                binary: None,
                ssh_key_path,
            })?;
            engine.probe().await?;
            engine.connect(&docker.cid).await?;
            return Ok(Backend::Docker {
                engine: Arc::new(engine),
                container_id: docker.cid.clone(),
            });
        }
        if let Some(kubernetes) = &connection.kubernetes {
            let kubeconfig = match (&kubernetes.kubeconfig, &kubernetes.kubeconfig_path) {
                (Some(inline), _) => KubeconfigSource::Inline(inline.clone()),
                (None, Some(path)) => KubeconfigSource::Path(workdir.join(path)),
                (None, None) => {
                    return Err(Error::invalid_config(
                        "kubernetes connection names no kubeconfig",
                    ))
                }
            };
            let image = Reference::parse(&kubernetes.sandbox_image)?;
            let harness = KubernetesHarness::new(KubernetesConfig {
                image,
                kubeconfig,
                namespace: None,
            });
            return Ok(Backend::Kubernetes(harness));
        }
        Err(Error::invalid_config(
            "connection output names neither docker nor kubernetes",
        ))
    }
}

#[async_trait]
impl Harness for PterraformHarness {
    async fn create(&self, cancel: &CancellationToken) -> Result<()> {
        let source = self.config.source.clone();
        let workdir = tokio::task::spawn_blocking(move || -> Result<tempfile::TempDir> {
            let workdir = tempfile::TempDir::with_prefix("imagetest-tf-")?;
            copy_tree(&source, workdir.path())?;
            Ok(workdir)
        })
        .await
        .map_err(|e| Error::transport("pterraform", format!("task join: {e}")))??;

        self.apply(workdir.path()).await?;

        let mut attempt = 0;
        let mut retry = self.config.retry.clone();
        let backend = loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled("establishing pterraform connection"));
            }
            let result = match self.read_connection(workdir.path()).await {
                Ok(connection) => {
                    if let Some(spec) = &connection.retry {
                        retry = spec.clone();
                    }
                    self.establish(workdir.path(), &connection).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(backend) => break backend,
                Err(e) if attempt + 1 < retry.attempts => {
                    let delay = retry.delay * retry.factor.powi(attempt as i32);
                    warn!(
                        attempt,
                        delay_secs = delay,
                        error = %e,
                        "connection not ready; retrying"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        if let Backend::Kubernetes(harness) = &backend {
            harness.create(cancel).await?;
        }

        *self.applied.lock().await = Some(Applied { workdir, backend });
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken, command: Command) -> Result<()> {
        let guard = self.applied.lock().await;
        let applied = guard
            .as_ref()
            .ok_or_else(|| Error::invalid_config("harness has not been created"))?;
        match &applied.backend {
            Backend::Docker {
                engine,
                container_id,
            } => {
                tokio::select! {
                    result = engine.exec(container_id, command) => result,
                    () = cancel.cancelled() => Err(Error::cancelled("pterraform exec")),
                }
            }
            Backend::Kubernetes(harness) => harness.run(cancel, command).await,
        }
    }

    async fn extract_file(&self, path: &str) -> Result<Vec<u8>> {
        let guard = self.applied.lock().await;
        let applied = guard
            .as_ref()
            .ok_or_else(|| Error::invalid_config("harness has not been created"))?;
        match &applied.backend {
            Backend::Docker {
                engine,
                container_id,
            } => {
                let archive = engine.copy_out(container_id, path).await?;
                untar_files(&archive)?
                    .into_values()
                    .next()
                    .ok_or_else(|| Error::not_found(format!("file {path} in sandbox")))
            }
            Backend::Kubernetes(harness) => harness.extract_file(path).await,
        }
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        let applied = self.applied.lock().await.take();
        let Some(applied) = applied else {
            return Ok(());
        };

        if std::env::var(SKIP_TEARDOWN_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
        {
            let kept = applied.workdir.keep();
            warn!(
                workdir = %kept.display(),
                "{SKIP_TEARDOWN_ENV} set; leaving terraform state in place"
            );
            return Ok(());
        }

        if let Backend::Kubernetes(harness) = &applied.backend {
            harness.destroy(cancel).await?;
        }

        let terraform = self.terraform()?;
        let mut destroy = vec![
            "destroy".to_string(),
            "-auto-approve".to_string(),
            "-input=false".to_string(),
        ];
        destroy.extend(forwarded_var_args(std::env::vars()));
        terraform
            .execute(&destroy, Some(Self::execution_config(applied.workdir.path())))
            .await?;
        Ok(())
    }
}

/// Render `-var` flags from `IMAGETEST_TF_VAR_*` environment variables.
fn forwarded_var_args(vars: impl Iterator<Item = (String, String)>) -> Vec<String> {
    let mut args = Vec::new();
    let mut forwarded: Vec<(String, String)> = vars
        .filter_map(|(key, value)| {
            key.strip_prefix(TF_VAR_FORWARD_PREFIX)
                .map(|name| (name.to_string(), value))
        })
        .collect();
    forwarded.sort();
    for (name, value) in forwarded {
        args.push("-var".to_string());
        args.push(format!("{name}={value}"));
    }
    args
}

/// Copy a terraform tree, skipping `.terraform*`, symlinks, and state files.
fn copy_tree(source: &Path, target: &Path) -> Result<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(".terraform") {
            continue;
        }
        if name.ends_with(".tfstate") || name.contains(".tfstate.") {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let destination = target.join(&name);
        if file_type.is_dir() {
            std::fs::create_dir_all(&destination)?;
            copy_tree(&entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_parse_docker() {
        let connection: Connection = serde_json::from_str(
            r#"{"docker": {"cid": "abc", "host": "ssh://admin@10.0.0.9", "private_key_path": "id_ed25519"},
                "retry": {"attempts": 5, "delay": 2.0, "factor": 1.5}}"#,
        )
        .unwrap();
        let docker = connection.docker.unwrap();
        assert_eq!(docker.cid, "abc");
        assert_eq!(docker.host.as_deref(), Some("ssh://admin@10.0.0.9"));
        assert_eq!(connection.retry.unwrap().attempts, 5);
    }

    #[test]
    fn test_connection_parse_kubernetes() {
        let connection: Connection = serde_json::from_str(
            r#"{"kubernetes": {"kubeconfig_path": "kubeconfig", "sandbox_image": "cgr.dev/chainguard/kubectl:latest"}}"#,
        )
        .unwrap();
        let kubernetes = connection.kubernetes.unwrap();
        assert_eq!(kubernetes.kubeconfig_path.as_deref(), Some("kubeconfig"));
        assert!(connection.retry.is_none());
    }

    #[test]
    fn test_forwarded_var_args_prefix_filtering() {
        let vars = vec![
            ("IMAGETEST_TF_VAR_foo".to_string(), "foo".to_string()),
            ("TF_VAR_foo".to_string(), "bar".to_string()),
            ("IMAGETEST_TF_VAR_region".to_string(), "us-east-1".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let args = forwarded_var_args(vars.into_iter());
        assert_eq!(
            args,
            vec!["-var", "foo=foo", "-var", "region=us-east-1"]
        );
    }

    #[test]
    fn test_copy_tree_skip_rules() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("main.tf"), "resource {}").unwrap();
        std::fs::write(source.path().join("terraform.tfstate"), "{}").unwrap();
        std::fs::write(source.path().join("terraform.tfstate.backup"), "{}").unwrap();
        std::fs::write(source.path().join(".terraform.lock.hcl"), "").unwrap();
        std::fs::create_dir(source.path().join(".terraform")).unwrap();
        std::fs::write(source.path().join(".terraform").join("junk"), "x").unwrap();
        std::fs::create_dir(source.path().join("modules")).unwrap();
        std::fs::write(source.path().join("modules").join("vars.tf"), "variable {}").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("main.tf", source.path().join("link.tf")).unwrap();

        copy_tree(source.path(), target.path()).unwrap();

        assert!(target.path().join("main.tf").exists());
        assert!(target.path().join("modules").join("vars.tf").exists());
        assert!(!target.path().join("terraform.tfstate").exists());
        assert!(!target.path().join("terraform.tfstate.backup").exists());
        assert!(!target.path().join(".terraform").exists());
        assert!(!target.path().join(".terraform.lock.hcl").exists());
        assert!(!target.path().join("link.tf").exists());
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetrySpec::default();
        assert_eq!(retry.attempts, 3);
        assert!((retry.factor - 2.0).abs() < f64::EPSILON);
    }
}
