//! Driver orchestration: compose, provision, run, collect, tear down.
//!
//! The driver is the public entrypoint for one test invocation. It composes
//! the test image from the harness base and the payload, provisions the
//! selected harness backend around that image, runs the payload through the
//! uniform harness contract while scanning its output, extracts the
//! artifact the payload left behind, and maps the exit code onto a result.
//! Teardown releases everything in reverse order even when the run failed
//! or was cancelled.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Engine, Healthcheck, DEFAULT_NETWORK};
use crate::error::{Error, Result};
use crate::harness::container::{ContainerHarness, ContainerHarnessConfig};
use crate::harness::dind::{DindConfig, DindHarness};
use crate::harness::k3s::{K3sConfig, K3sHarness};
use crate::harness::kubernetes::{KubernetesConfig, KubernetesHarness};
use crate::harness::pterraform::{PterraformConfig, PterraformHarness};
use crate::harness::{Command, Harness};
use crate::image::{AppendSpec, Composer};
use crate::registry::{Reference, RegistryClient};
use crate::teardown::TeardownStack;

/// Exit code a payload uses to pause for inspection; treated as success
pub const PAUSED_EXIT_CODE: i32 = 222;

/// Well-known path the payload writes its artifact to
pub const ARTIFACTS_PATH: &str = "/tmp/imagetest.artifacts.json";

/// Healthcheck command every sandbox image exposes
pub const SANDBOX_HEALTHCHECK: [&str; 3] = ["CMD", "imagetest", "healthcheck"];

/// Bytes of trailing log output retained for error context
const LOG_TAIL_LIMIT: usize = 4096;

/// Which sandbox backend the driver provisions around the composed image.
///
/// Backend configs carry their own knobs; the driver overrides their
/// sandbox image with the composed test image before `create`.
#[derive(Debug, Clone)]
pub enum HarnessSpec {
    /// One plain container, commands via exec
    Container,
    /// Docker-in-Docker daemon plus sandbox
    Dind(DindConfig),
    /// k3s cluster in a container plus kubectl sandbox
    K3s(K3sConfig),
    /// Pod in an external Kubernetes cluster
    Kubernetes(KubernetesConfig),
    /// Whatever backend a terraform configuration reports
    Pterraform(PterraformConfig),
}

/// Configuration for a driver, validated once at construction
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Harness base image the payload is appended to
    pub harness_base: Reference,
    /// Repository composed test images are pushed to
    pub target_repo: Reference,
    /// Sandbox backend provisioned for each run
    pub harness: HarnessSpec,
    /// Command executed in the sandbox; derived from the payload's
    /// entrypoint and cmd when empty
    pub payload_command: Vec<String>,
    /// Run the sandbox container privileged (plain-container backend)
    pub privileged: bool,
    /// Watch the sandbox healthcheck while the payload runs
    pub healthcheck: bool,
    /// Deadline for detached teardown after cancellation
    pub teardown_timeout: Duration,
}

impl DriverConfig {
    /// Configuration with defaults for the given base and target
    pub fn new(harness_base: Reference, target_repo: Reference) -> Self {
        Self {
            harness_base,
            target_repo,
            harness: HarnessSpec::Container,
            payload_command: Vec::new(),
            privileged: false,
            healthcheck: true,
            teardown_timeout: Duration::from_secs(300),
        }
    }

    /// Select the sandbox backend
    #[must_use]
    pub fn harness(mut self, harness: HarnessSpec) -> Self {
        self.harness = harness;
        self
    }
}

/// The artifact extracted from the sandbox after a run
#[derive(Debug, Clone)]
pub struct RunArtifact {
    /// In-sandbox path the artifact came from
    pub path: String,
    /// Raw artifact bytes
    pub data: Vec<u8>,
}

impl RunArtifact {
    /// Decode the artifact as JSON
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// Outcome of one driver run
#[derive(Debug)]
pub struct RunResult {
    /// The composed, content-addressed test image
    pub image: Reference,
    /// Exit code of the payload
    pub exit_code: i32,
    /// Whether the payload paused for inspection
    pub paused: bool,
    /// Artifact extracted from the sandbox, when present
    pub artifact: Option<RunArtifact>,
}

/// Bounded buffer retaining the tail of the sandbox's log stream
#[derive(Debug, Default)]
struct LogTail {
    buffer: VecDeque<u8>,
}

impl LogTail {
    fn push_line(&mut self, line: &str) {
        self.buffer.extend(line.as_bytes());
        self.buffer.push_back(b'\n');
        while self.buffer.len() > LOG_TAIL_LIMIT {
            self.buffer.pop_front();
        }
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.iter().copied().collect::<Vec<u8>>()).to_string()
    }
}

/// An `AsyncWrite` splitting payload output into lines, forwarding each to
/// the structured logger and the bounded tail buffer.
struct SinkWriter {
    tail: Arc<Mutex<LogTail>>,
    pending: Vec<u8>,
}

impl SinkWriter {
    fn new(tail: Arc<Mutex<LogTail>>) -> Self {
        Self {
            tail,
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &str) {
        info!(target: "imagetest::sandbox", sandbox_log = %line);
        self.tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_line(line);
    }

    fn drain_complete_lines(&mut self) {
        while let Some(at) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=at).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            self.emit(&text);
        }
    }

    fn flush_remainder(&mut self) {
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).to_string();
            self.pending.clear();
            self.emit(&text);
        }
    }
}

impl AsyncWrite for SinkWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.pending.extend_from_slice(buf);
        self.drain_complete_lines();
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.flush_remainder();
        Poll::Ready(Ok(()))
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        self.flush_remainder();
    }
}

/// Orchestrates one sandboxed test run end to end.
pub struct Driver {
    engine: Arc<Engine>,
    composer: Composer,
    config: DriverConfig,
    stack: TeardownStack,
    network_registered: std::sync::atomic::AtomicBool,
}

impl Driver {
    /// Create a driver over an engine and registry client
    pub fn new(engine: Arc<Engine>, registry: Arc<RegistryClient>, config: DriverConfig) -> Self {
        Self {
            engine,
            composer: Composer::new(registry),
            config,
            stack: TeardownStack::new(),
            network_registered: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Verify the engine is usable before any run.
    ///
    /// Skipped for backends that never touch the local engine.
    pub async fn setup(&self) -> Result<()> {
        match self.config.harness {
            HarnessSpec::Kubernetes(_) | HarnessSpec::Pterraform(_) => Ok(()),
            _ => self.engine.probe().await,
        }
    }

    /// Compose and run one payload; the result carries the exit
    /// disposition and any extracted artifact.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        payload: &AppendSpec,
    ) -> Result<RunResult> {
        // Configuration errors are fatal before any side effect.
        let argv = payload_command(&self.config, payload)?;

        // Compose the test image and pin it by digest.
        let image = self
            .composer
            .append(&self.config.harness_base, &self.config.target_repo, payload)
            .await?;
        info!(image = %image, "composed test image");

        // Provision: engine-side network first, then the harness, each
        // registered to the teardown stack as soon as it exists.
        if self.uses_engine() {
            let network = self.engine.create_network(DEFAULT_NETWORK).await?;
            // The default network is shared by every run of this driver;
            // one release covers all of them.
            if !self
                .network_registered
                .swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                let engine = Arc::clone(&self.engine);
                let name = network.name.clone();
                self.stack
                    .add(format!("remove network {name}"), async move {
                        engine.remove_network(&name).await
                    })?;
            }
        }

        let harness = self.build_harness(&image)?;
        {
            let harness = Arc::clone(&harness);
            self.stack.add("destroy harness", async move {
                harness.destroy(&CancellationToken::new()).await
            })?;
        }
        harness.create(cancel).await?;

        // Run the payload through the uniform contract, scanning its
        // output into the structured logger and the bounded tail.
        let tail = Arc::new(Mutex::new(LogTail::default()));
        let command = Command::argv(argv)
            .stdout(Box::new(SinkWriter::new(Arc::clone(&tail))))
            .stderr(Box::new(SinkWriter::new(Arc::clone(&tail))));
        let run = harness.run(cancel, command).await;

        // Extraction is best-effort and happens even when the run failed.
        let artifact = match harness.extract_file(ARTIFACTS_PATH).await {
            Ok(data) => Some(RunArtifact {
                path: ARTIFACTS_PATH.to_string(),
                data,
            }),
            Err(e) => {
                warn!(error = %e, "artifact extraction failed");
                None
            }
        };

        match run {
            Ok(()) => Ok(RunResult {
                image,
                exit_code: 0,
                paused: false,
                artifact,
            }),
            Err(Error::Exec { exit_code, .. }) if exit_code == PAUSED_EXIT_CODE => {
                info!(image = %image, "payload paused for inspection");
                Ok(RunResult {
                    image,
                    exit_code,
                    paused: true,
                    artifact,
                })
            }
            Err(Error::Exec {
                exit_code,
                combined_output,
                ..
            }) => {
                let logs = tail.lock().unwrap_or_else(|e| e.into_inner()).contents();
                Err(Error::exec(
                    format!("test payload {image}"),
                    exit_code,
                    format!("{combined_output}\nlog tail:\n{logs}"),
                ))
            }
            Err(other) => Err(other),
        }
    }

    /// Release every provisioned resource on a detached deadline.
    pub async fn teardown(&self) -> Result<()> {
        self.stack
            .teardown_detached(self.config.teardown_timeout)
            .await
    }

    fn uses_engine(&self) -> bool {
        !matches!(
            self.config.harness,
            HarnessSpec::Kubernetes(_) | HarnessSpec::Pterraform(_)
        )
    }

    fn sandbox_healthcheck(&self) -> Option<Healthcheck> {
        self.config.healthcheck.then(|| {
            Healthcheck::new(SANDBOX_HEALTHCHECK.iter().map(ToString::to_string).collect())
        })
    }

    /// Build the selected backend around the composed test image.
    fn build_harness(&self, image: &Reference) -> Result<Arc<dyn Harness>> {
        match &self.config.harness {
            HarnessSpec::Container => {
                let mut config = ContainerHarnessConfig::new(image.clone());
                config.privileged = self.config.privileged;
                config.sandbox_healthcheck = self.sandbox_healthcheck();
                Ok(Arc::new(ContainerHarness::new(
                    Arc::clone(&self.engine),
                    config,
                )))
            }
            HarnessSpec::Dind(template) => {
                let mut config = template.clone();
                config.image = image.clone();
                config.sandbox_healthcheck = self.sandbox_healthcheck();
                Ok(Arc::new(DindHarness::new(
                    Arc::clone(&self.engine),
                    config,
                )?))
            }
            HarnessSpec::K3s(template) => {
                let mut config = template.clone();
                config.image = image.clone();
                config.sandbox_healthcheck = self.sandbox_healthcheck();
                Ok(Arc::new(K3sHarness::new(Arc::clone(&self.engine), config)))
            }
            HarnessSpec::Kubernetes(template) => {
                let mut config = template.clone();
                config.image = image.clone();
                Ok(Arc::new(KubernetesHarness::new(config)))
            }
            HarnessSpec::Pterraform(template) => {
                Ok(Arc::new(PterraformHarness::new(template.clone())))
            }
        }
    }
}

/// The argv executed in the sandbox: the explicit configuration when set,
/// the payload's entrypoint and cmd otherwise.
fn payload_command(config: &DriverConfig, payload: &AppendSpec) -> Result<Vec<String>> {
    if !config.payload_command.is_empty() {
        return Ok(config.payload_command.clone());
    }
    let mut argv = payload.entrypoint.clone();
    argv.extend(payload.cmd.iter().cloned());
    if argv.is_empty() {
        return Err(Error::invalid_config(
            "no payload command: set DriverConfig.payload_command or the payload's entrypoint/cmd",
        ));
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_log_tail_is_bounded() {
        let mut tail = LogTail::default();
        for i in 0..1000 {
            tail.push_line(&format!("line number {i} with some padding to fill space"));
        }
        let contents = tail.contents();
        assert!(contents.len() <= LOG_TAIL_LIMIT + 1);
        // The newest lines survive, the oldest are gone.
        assert!(contents.contains("line number 999"));
        assert!(!contents.contains("line number 0 "));
    }

    #[tokio::test]
    async fn test_sink_writer_splits_lines() {
        let tail = Arc::new(Mutex::new(LogTail::default()));
        let mut writer = SinkWriter::new(Arc::clone(&tail));
        writer.write_all(b"first li").await.unwrap();
        writer.write_all(b"ne\nsecond line\ntrail").await.unwrap();
        writer.shutdown().await.unwrap();

        let contents = tail.lock().unwrap().contents();
        assert_eq!(contents, "first line\nsecond line\ntrail\n");
    }

    #[test]
    fn test_payload_command_explicit_wins() {
        let mut config = DriverConfig::new(
            Reference::parse("cgr.dev/chainguard/wolfi-base:latest").unwrap(),
            Reference::parse("localhost:5000/imagetest").unwrap(),
        );
        config.payload_command = vec!["/imagetest/run.sh".to_string()];
        let payload = AppendSpec {
            cmd: vec!["ignored".to_string()],
            ..AppendSpec::default()
        };
        assert_eq!(
            payload_command(&config, &payload).unwrap(),
            vec!["/imagetest/run.sh"]
        );
    }

    #[test]
    fn test_payload_command_derived_from_spec() {
        let config = DriverConfig::new(
            Reference::parse("cgr.dev/chainguard/wolfi-base:latest").unwrap(),
            Reference::parse("localhost:5000/imagetest").unwrap(),
        );
        let payload = AppendSpec {
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            cmd: vec!["/imagetest/run.sh".to_string()],
            ..AppendSpec::default()
        };
        assert_eq!(
            payload_command(&config, &payload).unwrap(),
            vec!["/bin/sh", "-c", "/imagetest/run.sh"]
        );
    }

    #[test]
    fn test_payload_command_missing_is_config_error() {
        let config = DriverConfig::new(
            Reference::parse("cgr.dev/chainguard/wolfi-base:latest").unwrap(),
            Reference::parse("localhost:5000/imagetest").unwrap(),
        );
        let err = payload_command(&config, &AppendSpec::default()).unwrap_err();
        assert_eq!(err.category(), "config");
    }

    #[test]
    fn test_artifact_json_decoding() {
        let artifact = RunArtifact {
            path: ARTIFACTS_PATH.to_string(),
            data: br#"{"passed": 12, "failed": 0}"#.to_vec(),
        };
        let value = artifact.json().unwrap();
        assert_eq!(value["passed"], 12);

        let broken = RunArtifact {
            path: ARTIFACTS_PATH.to_string(),
            data: b"not json".to_vec(),
        };
        assert!(broken.json().is_err());
    }

    #[test]
    fn test_paused_code_is_reserved() {
        assert_ne!(PAUSED_EXIT_CODE, 0);
        assert_ne!(PAUSED_EXIT_CODE, 1);
    }

    #[test]
    fn test_default_harness_is_plain_container() {
        let config = DriverConfig::new(
            Reference::parse("cgr.dev/chainguard/wolfi-base:latest").unwrap(),
            Reference::parse("localhost:5000/imagetest").unwrap(),
        );
        assert!(matches!(config.harness, HarnessSpec::Container));
    }
}
