//! External Kubernetes harness.
//!
//! Given a kubeconfig (inline, by path, or ambient), provisions a namespace,
//! a dedicated service account bound to cluster-admin, and one privileged
//! sandbox pod running the test image. Commands run through the pod's exec
//! subresource over the API server's WebSocket channel.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::ClusterRoleBinding;
use kube::api::{AttachParams, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use rand::Rng;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Command, Harness};
use crate::engine::{DEFAULT_LABEL_KEY, DEFAULT_LABEL_VALUE};
use crate::error::{Error, Result};
use crate::registry::Reference;
use crate::teardown::TeardownStack;

/// Environment variable that leaves cluster resources in place for debugging
pub const SKIP_TEARDOWN_ENV: &str = "IMAGETEST_SKIP_TEARDOWN";

const POD_NAME: &str = "sandbox";
const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);
const POD_POLL_INTERVAL: Duration = Duration::from_secs(2);

// The API server has no SPDY path here; a failed WebSocket upgrade is
// retried instead.
const EXEC_UPGRADE_ATTEMPTS: u32 = 3;
const EXEC_UPGRADE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Where the harness finds its kubeconfig
#[derive(Debug, Clone)]
pub enum KubeconfigSource {
    /// Kubeconfig YAML provided inline
    Inline(String),
    /// Path to a kubeconfig file
    Path(PathBuf),
    /// Ambient configuration (`KUBECONFIG` or in-cluster)
    Default,
}

/// Configuration for an external-cluster harness
#[derive(Debug, Clone)]
pub struct KubernetesConfig {
    /// Test image run as the sandbox pod
    pub image: Reference,
    /// Kubeconfig source
    pub kubeconfig: KubeconfigSource,
    /// Namespace name; generated when absent
    pub namespace: Option<String>,
}

impl KubernetesConfig {
    /// Configuration using the ambient kubeconfig
    pub fn new(image: Reference) -> Self {
        Self {
            image,
            kubeconfig: KubeconfigSource::Default,
            namespace: None,
        }
    }
}

struct Provisioned {
    client: Client,
    namespace: String,
}

/// A harness running the payload as a pod in an existing cluster.
pub struct KubernetesHarness {
    config: KubernetesConfig,
    stack: TeardownStack,
    provisioned: Mutex<Option<Provisioned>>,
}

fn name_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let n: u8 = rng.gen_range(0..36);
            char::from_digit(u32::from(n), 36).unwrap_or('0')
        })
        .collect()
}

fn skip_teardown() -> bool {
    std::env::var(SKIP_TEARDOWN_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl KubernetesHarness {
    /// Create a harness from the given configuration
    pub fn new(config: KubernetesConfig) -> Self {
        Self {
            config,
            stack: TeardownStack::new(),
            provisioned: Mutex::new(None),
        }
    }

    async fn client(&self) -> Result<Client> {
        let config = match &self.config.kubeconfig {
            KubeconfigSource::Default => Config::infer().await.map_err(|e| {
                Error::transport("kubernetes", format!("ambient kubeconfig: {e}"))
            })?,
            KubeconfigSource::Path(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::invalid_config(format!("kubeconfig {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::invalid_config(format!("kubeconfig: {e}")))?
            }
            KubeconfigSource::Inline(yaml) => {
                let kubeconfig = Kubeconfig::from_yaml(yaml)
                    .map_err(|e| Error::invalid_config(format!("inline kubeconfig: {e}")))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::invalid_config(format!("inline kubeconfig: {e}")))?
            }
        };
        Client::try_from(config)
            .map_err(|e| Error::transport("kubernetes", format!("client: {e}")))
    }

    async fn ensure_namespace(&self, client: &Client, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(client.clone());
        let namespace: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name,
                "labels": { DEFAULT_LABEL_KEY: DEFAULT_LABEL_VALUE },
            },
        }))?;
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => debug!(namespace = name, "created namespace"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(namespace = name, "namespace already exists");
            }
            Err(e) => return Err(kube_error("create namespace", e)),
        }
        Ok(())
    }

    async fn create_rbac(&self, client: &Client, namespace: &str) -> Result<()> {
        let account_name = format!("imagetest-{namespace}");
        let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
        let account: ServiceAccount = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ServiceAccount",
            "metadata": {
                "name": account_name,
                "labels": { DEFAULT_LABEL_KEY: DEFAULT_LABEL_VALUE },
            },
        }))?;
        accounts
            .create(&PostParams::default(), &account)
            .await
            .map_err(|e| kube_error("create service account", e))?;
        {
            let accounts = accounts.clone();
            let name = account_name.clone();
            self.stack
                .add(format!("delete service account {name}"), async move {
                    accounts
                        .delete(&name, &zero_grace())
                        .await
                        .map(|_| ())
                        .map_err(|e| kube_error("delete service account", e))
                })?;
        }

        let binding_name = format!("imagetest-{namespace}-admin");
        let bindings: Api<ClusterRoleBinding> = Api::all(client.clone());
        let binding: ClusterRoleBinding = serde_json::from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": {
                "name": binding_name,
                "labels": { DEFAULT_LABEL_KEY: DEFAULT_LABEL_VALUE },
            },
            "roleRef": {
                "apiGroup": "rbac.authorization.k8s.io",
                "kind": "ClusterRole",
                "name": "cluster-admin",
            },
            "subjects": [{
                "kind": "ServiceAccount",
                "name": account_name,
                "namespace": namespace,
            }],
        }))?;
        bindings
            .create(&PostParams::default(), &binding)
            .await
            .map_err(|e| kube_error("create cluster role binding", e))?;
        {
            let bindings = bindings.clone();
            let name = binding_name.clone();
            self.stack
                .add(format!("delete cluster role binding {name}"), async move {
                    bindings
                        .delete(&name, &zero_grace())
                        .await
                        .map(|_| ())
                        .map_err(|e| kube_error("delete cluster role binding", e))
                })?;
        }
        Ok(())
    }

    async fn create_pod(&self, client: &Client, namespace: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let pod: Pod = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": POD_NAME,
                "labels": { DEFAULT_LABEL_KEY: DEFAULT_LABEL_VALUE },
            },
            "spec": {
                "serviceAccountName": format!("imagetest-{namespace}"),
                "restartPolicy": "Never",
                "containers": [{
                    "name": "sandbox",
                    "image": self.config.image.to_string(),
                    "command": ["/bin/sh", "-c"],
                    "args": ["tail -f /dev/null"],
                    "securityContext": { "privileged": true },
                }],
            },
        }))?;
        pods.create(&PostParams::default(), &pod)
            .await
            .map_err(|e| kube_error("create pod", e))?;
        {
            let pods = pods.clone();
            self.stack.add(format!("delete pod {POD_NAME}"), async move {
                pods.delete(POD_NAME, &zero_grace())
                    .await
                    .map(|_| ())
                    .map_err(|e| kube_error("delete pod", e))
            })?;
        }
        Ok(())
    }

    async fn wait_pod_running(
        &self,
        client: &Client,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let deadline = tokio::time::Instant::now() + POD_READY_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled("waiting for sandbox pod"));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(
                    POD_READY_TIMEOUT.as_secs(),
                    format!("pod {namespace}/{POD_NAME} did not reach Running"),
                ));
            }
            let pod = pods
                .get(POD_NAME)
                .await
                .map_err(|e| kube_error("get pod", e))?;
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            match phase.as_str() {
                "Running" => return Ok(()),
                "Failed" | "Succeeded" => {
                    return Err(Error::exec(
                        format!("pod {namespace}/{POD_NAME}"),
                        -1,
                        format!("pod reached terminal phase {phase} before exec"),
                    ))
                }
                _ => {}
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::cancelled("waiting for sandbox pod"));
                }
                () = tokio::time::sleep(POD_POLL_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl Harness for KubernetesHarness {
    async fn create(&self, cancel: &CancellationToken) -> Result<()> {
        let client = self.client().await?;
        let namespace = self
            .config
            .namespace
            .clone()
            .unwrap_or_else(|| format!("imagetest-{}", name_suffix()));

        self.ensure_namespace(&client, &namespace).await?;
        {
            let namespaces: Api<Namespace> = Api::all(client.clone());
            let name = namespace.clone();
            self.stack
                .add(format!("delete namespace {name}"), async move {
                    namespaces
                        .delete(&name, &zero_grace())
                        .await
                        .map(|_| ())
                        .map_err(|e| kube_error("delete namespace", e))
                })?;
        }

        self.create_rbac(&client, &namespace).await?;
        self.create_pod(&client, &namespace).await?;
        self.wait_pod_running(&client, &namespace, cancel).await?;
        debug!(namespace = %namespace, "sandbox pod running");

        *self.provisioned.lock().await = Some(Provisioned { client, namespace });
        Ok(())
    }

    async fn run(&self, cancel: &CancellationToken, mut command: Command) -> Result<()> {
        let (client, namespace) = {
            let guard = self.provisioned.lock().await;
            let provisioned = guard
                .as_ref()
                .ok_or_else(|| Error::invalid_config("harness has not been created"))?;
            (provisioned.client.clone(), provisioned.namespace.clone())
        };
        let pods: Api<Pod> = Api::namespaced(client, &namespace);

        let mut args = Vec::new();
        if let Some(dir) = &command.working_dir {
            args.push("sh".to_string());
            args.push("-c".to_string());
            let env = command
                .env
                .iter()
                .map(|(k, v)| format!("export {k}={v}; "))
                .collect::<String>();
            args.push(format!("cd {dir} && {env}exec \"$@\"",));
            args.push("--".to_string());
        } else if !command.env.is_empty() {
            args.push("env".to_string());
            for (key, value) in &command.env {
                args.push(format!("{key}={value}"));
            }
        }
        args.extend(command.args.iter().cloned());

        let params = AttachParams::default().stdout(true).stderr(true);
        let mut attempt = 0;
        let mut attached = loop {
            let exec = pods.exec(POD_NAME, args.clone(), &params);
            let result = tokio::select! {
                attached = exec => attached,
                () = cancel.cancelled() => return Err(Error::cancelled("pod exec")),
            };
            match result {
                Ok(attached) => break attached,
                Err(e) if attempt + 1 < EXEC_UPGRADE_ATTEMPTS => {
                    attempt += 1;
                    warn!(attempt, error = %e, "exec upgrade failed; retrying");
                    tokio::select! {
                        () = tokio::time::sleep(EXEC_UPGRADE_RETRY_DELAY) => {}
                        () = cancel.cancelled() => return Err(Error::cancelled("pod exec")),
                    }
                }
                Err(e) => return Err(kube_error("pod exec", e)),
            }
        };

        let mut combined = String::new();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(mut stdout) = attached.stdout() {
            stdout.read_to_end(&mut stdout_buf).await?;
        }
        if let Some(mut stderr) = attached.stderr() {
            stderr.read_to_end(&mut stderr_buf).await?;
        }
        combined.push_str(&String::from_utf8_lossy(&stdout_buf));
        combined.push_str(&String::from_utf8_lossy(&stderr_buf));

        if let Some(writer) = command.stdout.as_mut() {
            writer.write_all(&stdout_buf).await?;
            writer.flush().await?;
        }
        if let Some(writer) = command.stderr.as_mut() {
            writer.write_all(&stderr_buf).await?;
            writer.flush().await?;
        }

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| Error::transport("kubernetes", format!("pod exec join: {e}")))?;

        match status {
            Some(status) if status.status.as_deref() == Some("Success") => Ok(()),
            Some(status) => {
                let exit_code = status
                    .details
                    .as_ref()
                    .and_then(|d| d.causes.as_ref())
                    .and_then(|causes| {
                        causes
                            .iter()
                            .find(|c| c.reason.as_deref() == Some("ExitCode"))
                    })
                    .and_then(|c| c.message.as_ref())
                    .and_then(|m| m.parse::<i32>().ok())
                    .unwrap_or(-1);
                Err(Error::exec(command.command_line(), exit_code, combined))
            }
            None => Ok(()),
        }
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<()> {
        if skip_teardown() {
            warn!("{SKIP_TEARDOWN_ENV} set; leaving cluster resources in place");
            return Ok(());
        }
        self.stack.teardown(cancel).await
    }
}

fn zero_grace() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        ..DeleteParams::default()
    }
}

fn kube_error(operation: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(format!("{operation}: {ae}")),
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            Error::auth("kubernetes", format!("{operation}: {ae}"))
        }
        other => Error::transport("kubernetes", format!("{operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_grace_params() {
        assert_eq!(zero_grace().grace_period_seconds, Some(0));
    }

    #[test]
    fn test_name_suffix_shape() {
        let suffix = name_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_kube_error_mapping() {
        let not_found = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "pods \"sandbox\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert_eq!(kube_error("get pod", not_found).category(), "not-found");

        let forbidden = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert_eq!(kube_error("get pod", forbidden).category(), "auth");
    }
}
