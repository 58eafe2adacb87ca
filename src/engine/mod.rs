//! Container engine adapter.
//!
//! Drives a local (or `ssh://`-remote) container engine through its CLI:
//! image pulls, container lifecycle, exec with stream splitting, tar copies
//! in and out, networks, and volumes. One [`Engine`] value is passed
//! explicitly into every harness; there is no process-wide engine state.

pub mod network;
pub mod request;
pub mod response;
pub mod volume;

pub use network::DEFAULT_NETWORK;
pub use request::{
    ContainerRequest, Healthcheck, LogSink, Mount, NetworkAttachment, PublishedPort, Resources,
    DEFAULT_LABEL_KEY, DEFAULT_LABEL_VALUE,
};
pub use response::{ContainerResponse, InspectState};
pub use volume::Volume;

use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::content::Content;
use crate::error::{Error, Result};
use crate::executor::{ExecutionConfig, OutputLine, ProcessExecutor};
use crate::harness::Command;
use crate::ssh::{self, PortForward};

/// Environment variable overriding the engine endpoint
pub const HOST_ENV: &str = "DOCKER_HOST";

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the engine adapter, validated once at construction
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Engine endpoint; falls back to `DOCKER_HOST`, then the local socket
    pub endpoint: Option<String>,
    /// Engine binary name; `docker` then `podman` are probed when unset
    pub binary: Option<String>,
    /// Private key used for `ssh://` endpoints' port tunnels
    pub ssh_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct SshRemote {
    user: String,
    host: String,
    port: u16,
    key_path: Option<PathBuf>,
}

/// Adapter over one container engine endpoint.
///
/// Safe for concurrent use; each call borrows the adapter.
#[derive(Debug, Clone)]
pub struct Engine {
    executor: ProcessExecutor,
    endpoint: Option<String>,
    ssh: Option<SshRemote>,
}

impl Engine {
    /// Create an adapter from the given configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let executor = match &config.binary {
            Some(binary) => ProcessExecutor::find(binary)?,
            None => ProcessExecutor::find("docker")
                .or_else(|_| ProcessExecutor::find("podman"))
                .map_err(|_| Error::not_found("container engine binary (docker or podman)"))?,
        };

        let endpoint = config
            .endpoint
            .clone()
            .or_else(|| std::env::var(HOST_ENV).ok().filter(|v| !v.is_empty()));

        let ssh = match &endpoint {
            Some(endpoint) if endpoint.starts_with("ssh://") => {
                Some(parse_ssh_endpoint(endpoint, config.ssh_key_path.clone())?)
            }
            _ => None,
        };

        let executor = match &endpoint {
            Some(endpoint) => executor.base_env(HOST_ENV, endpoint.clone()),
            None => executor,
        };

        Ok(Self {
            executor,
            endpoint,
            ssh,
        })
    }

    /// Adapter with default configuration
    pub fn default_engine() -> Result<Self> {
        Self::new(EngineConfig::default())
    }

    pub(crate) fn executor(&self) -> &ProcessExecutor {
        &self.executor
    }

    /// The configured endpoint, if any
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Whether the endpoint is a remote engine reached over SSH
    pub fn is_ssh_remote(&self) -> bool {
        self.ssh.is_some()
    }

    /// Verify the engine daemon responds.
    pub async fn probe(&self) -> Result<()> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let output = self
            .executor
            .execute(&args, Some(ExecutionConfig::default().with_timeout(Duration::from_secs(30))))
            .await
            .map_err(|e| {
                Error::transport(
                    self.endpoint.clone().unwrap_or_else(|| "local engine".to_string()),
                    format!("engine daemon unreachable: {e}"),
                )
            })?;
        debug!(version = %output.stdout.trim(), "engine reachable");
        Ok(())
    }

    /// Generate a `imagetest-<kind>-<suffix>` resource name
    pub fn generate_name(&self, kind: &str) -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(rand::distributions::Alphanumeric)
            .take(8)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        format!("imagetest-{kind}-{suffix}")
    }

    /// Pull the request's image unless the engine already has it.
    pub async fn pull_if_missing(&self, image: &str) -> Result<()> {
        let inspect = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            image.to_string(),
        ];
        if self.executor.execute(&inspect, None).await.is_ok() {
            trace!(image, "image already present");
            return Ok(());
        }
        debug!(image, "pulling image");
        let pull = vec!["pull".to_string(), "--quiet".to_string(), image.to_string()];
        self.executor
            .execute(&pull, Some(ExecutionConfig::unbounded()))
            .await?;
        Ok(())
    }

    /// Create a container from a request without starting it.
    ///
    /// Applies every option atomically, attaches remaining networks, and
    /// copies in every content blob at `/`.
    async fn create(&self, request: &mut ContainerRequest) -> Result<(String, String)> {
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| self.generate_name("container"));

        self.pull_if_missing(&request.image.to_string()).await?;

        let args = request.build_create_args(&name);
        let output = self.executor.execute(&args, None).await?;
        let id = output.stdout.trim().to_string();

        for attachment in request.networks.iter().skip(1) {
            self.connect_network(&attachment.name, &id).await?;
        }

        for content in request.contents.drain(..) {
            self.copy_in(&id, content).await?;
        }

        Ok((id, name))
    }

    /// Start a container and wait until it is running and, when a
    /// healthcheck is configured, healthy. Bounded by `request.timeout`.
    pub async fn start(
        &self,
        mut request: ContainerRequest,
        cancel: &CancellationToken,
    ) -> Result<ContainerResponse> {
        let has_healthcheck = request.healthcheck.is_some();
        let timeout = request.timeout;
        let log_sink = request.log_sink.clone();
        let (id, _name) = self.create(&mut request).await?;

        let start = vec!["start".to_string(), id.clone()];
        self.executor.execute(&start, None).await?;
        if let Some(sink) = log_sink {
            self.spawn_log_streamer(&id, sink)?;
        }

        let state = self
            .wait_ready(&id, has_healthcheck, timeout, cancel)
            .await?;
        Ok(ContainerResponse::from_state(state))
    }

    /// Start a container and block until it is no longer running.
    ///
    /// Returns the container id and its exit code; a healthcheck flip to
    /// unhealthy fails the wait with the last health-probe log entry.
    pub async fn run(
        &self,
        mut request: ContainerRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, i32)> {
        let has_healthcheck = request.healthcheck.is_some();
        let log_sink = request.log_sink.clone();
        let (id, _name) = self.create(&mut request).await?;

        let start = vec!["start".to_string(), id.clone()];
        self.executor.execute(&start, None).await?;
        if let Some(sink) = log_sink {
            self.spawn_log_streamer(&id, sink)?;
        }

        let exit_code = self.wait_exit(&id, has_healthcheck, cancel).await?;
        Ok((id, exit_code))
    }

    /// Attach to an already-running container.
    pub async fn connect(&self, id: &str) -> Result<ContainerResponse> {
        let state = self.inspect(id).await?;
        if !state.state.running {
            return Err(Error::not_found(format!("running container {id}")));
        }
        Ok(ContainerResponse::from_state(state))
    }

    /// Force-stop with a zero-second grace period, then remove with volumes.
    pub async fn remove(&self, response: &ContainerResponse) -> Result<()> {
        let stop = vec![
            "stop".to_string(),
            "--time".to_string(),
            "0".to_string(),
            response.id.clone(),
        ];
        if let Err(e) = self.executor.execute(&stop, None).await {
            trace!(container = %response.id, error = %e, "stop before remove failed");
        }
        let remove = vec![
            "rm".to_string(),
            "--force".to_string(),
            "--volumes".to_string(),
            response.id.clone(),
        ];
        self.executor.execute(&remove, None).await?;
        debug!(container = %response.id, "removed container");
        Ok(())
    }

    /// [`remove`](Self::remove) by name or id, tolerating a container that
    /// was never created.
    pub async fn remove_named(&self, name: &str) -> Result<()> {
        let remove = vec![
            "rm".to_string(),
            "--force".to_string(),
            "--volumes".to_string(),
            name.to_string(),
        ];
        match self.executor.execute(&remove, None).await {
            Ok(_) => Ok(()),
            Err(Error::Exec { combined_output, .. }) if combined_output.contains("No such") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Inspect a container.
    pub async fn inspect(&self, id: &str) -> Result<InspectState> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            id.to_string(),
        ];
        match self.executor.execute(&args, None).await {
            Ok(output) => Ok(serde_json::from_str(&output.stdout)?),
            Err(Error::Exec { combined_output, .. })
                if combined_output.contains("No such") =>
            {
                Err(Error::not_found(format!("container {id}")))
            }
            Err(e) => Err(e),
        }
    }

    /// Execute a command in a running container.
    ///
    /// Stdout and stderr are split into the command's writers when present;
    /// both are merged into a combined buffer either way, and a non-zero
    /// exit yields [`Error::Exec`] carrying that buffer.
    pub async fn exec(&self, id: &str, mut command: Command) -> Result<()> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in &command.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(dir) = &command.working_dir {
            args.push("--workdir".to_string());
            args.push(dir.clone());
        }
        args.push(id.to_string());
        args.extend(command.args.iter().cloned());

        let mut streaming = self
            .executor
            .stream(&args, Some(ExecutionConfig::unbounded()))?;
        let command_line = command.command_line();
        let mut combined = String::new();

        while let Some(line) = streaming.lines.recv().await {
            combined.push_str(line.text());
            combined.push('\n');
            match line {
                OutputLine::Stdout(text) => {
                    if let Some(writer) = command.stdout.as_mut() {
                        writer.write_all(text.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                }
                OutputLine::Stderr(text) => {
                    if let Some(writer) = command.stderr.as_mut() {
                        writer.write_all(text.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                }
            }
        }
        if let Some(writer) = command.stdout.as_mut() {
            writer.flush().await?;
        }
        if let Some(writer) = command.stderr.as_mut() {
            writer.flush().await?;
        }

        let status = streaming.child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            return Err(Error::exec(command_line, exit_code, combined));
        }
        Ok(())
    }

    /// [`exec`](Self::exec), additionally racing the container's
    /// healthcheck: when the builtin probe flips to unhealthy while the
    /// command runs, the exec is abandoned and the probe's last log entry
    /// is returned as the failure.
    pub async fn exec_watched(
        &self,
        id: &str,
        command: Command,
        watch_health: bool,
    ) -> Result<()> {
        if !watch_health {
            return self.exec(id, command).await;
        }

        let exec = self.exec(id, command);
        tokio::pin!(exec);

        let unhealthy = {
            let engine = self.clone();
            let id = id.to_string();
            async move {
                loop {
                    tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                    match engine.inspect(&id).await {
                        Ok(state) if state.health_status() == "unhealthy" => {
                            return unhealthy_error(&id, &state);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container = %id, error = %e, "health poll failed");
                        }
                    }
                }
            }
        };
        tokio::pin!(unhealthy);

        tokio::select! {
            result = &mut exec => result,
            err = &mut unhealthy => Err(err),
        }
    }

    /// Copy a content stream into a container; the archive lands at `/`.
    pub async fn copy_in(&self, id: &str, content: Content) -> Result<()> {
        let target = content.target().to_string();
        let archive = content.into_bytes().await?;
        let args = vec!["cp".to_string(), "-".to_string(), format!("{id}:/")];
        let config = ExecutionConfig::default().stdin(archive);
        self.executor.execute(&args, Some(config)).await?;
        trace!(container = id, target = %target, "copied content in");
        Ok(())
    }

    /// Copy a path out of a container as a tar archive.
    pub async fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        if !path.starts_with('/') {
            return Err(Error::invalid_config(format!(
                "path {path:?} is not absolute"
            )));
        }
        let args = vec!["cp".to_string(), format!("{id}:{path}"), "-".to_string()];
        let output = self.executor.execute_raw(&args, None).await?;
        Ok(output.stdout)
    }

    /// Resolve a published container port to a dialable address.
    ///
    /// For `ssh://` endpoints the port is tunneled through a dynamically
    /// chosen local port; the returned guard keeps the tunnel open.
    pub async fn published_addr(
        &self,
        response: &ContainerResponse,
        container_port: u16,
    ) -> Result<(String, u16, Option<PortForward>)> {
        let (host, port) = response.published_port(container_port).ok_or_else(|| {
            Error::not_found(format!(
                "published port {container_port} on container {}",
                response.id
            ))
        })?;
        match &self.ssh {
            None => Ok((host, port, None)),
            Some(remote) => {
                let forward = ssh::PortForward::open(
                    &remote.host,
                    remote.port,
                    &remote.user,
                    remote.key_path.as_deref(),
                    port,
                )
                .await?;
                let local = forward.local_port();
                Ok(("127.0.0.1".to_string(), local, Some(forward)))
            }
        }
    }

    fn spawn_log_streamer(&self, id: &str, sink: LogSink) -> Result<()> {
        let args = vec!["logs".to_string(), "--follow".to_string(), id.to_string()];
        let mut streaming = self
            .executor
            .stream(&args, Some(ExecutionConfig::unbounded()))?;
        tokio::spawn(async move {
            while let Some(line) = streaming.lines.recv().await {
                sink(line.text());
            }
            let _ = streaming.child.wait().await;
        });
        Ok(())
    }

    async fn wait_ready(
        &self,
        id: &str,
        has_healthcheck: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<InspectState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled(format!("waiting for container {id}")));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(
                    timeout.as_secs(),
                    format!("container {id} did not become ready"),
                ));
            }

            let state = self.inspect(id).await?;
            if state.health_status() == "unhealthy" {
                return Err(unhealthy_error(id, &state));
            }
            if !state.state.running && state.state.status == "exited" {
                return Err(Error::exec(
                    format!("container {id} start"),
                    state.state.exit_code,
                    "container exited before becoming ready",
                ));
            }
            if state.state.running && (!has_healthcheck || state.health_status() == "healthy") {
                return Ok(state);
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(Error::cancelled(format!("waiting for container {id}")));
                }
                () = tokio::time::sleep(HEALTH_POLL_INTERVAL) => {}
            }
        }
    }

    async fn wait_exit(
        &self,
        id: &str,
        has_healthcheck: bool,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        // Status watcher: the engine's own wait blocks until exit and
        // prints the code.
        let status = {
            let executor = self.executor.clone();
            let id = id.to_string();
            async move {
                let args = vec!["wait".to_string(), id];
                let output = executor
                    .execute(&args, Some(ExecutionConfig::unbounded()))
                    .await?;
                output
                    .stdout
                    .trim()
                    .parse::<i32>()
                    .map_err(|e| Error::transport("engine wait", format!("bad exit code: {e}")))
            }
        };
        tokio::pin!(status);

        // Unhealthy watcher: inspect once per second; the builtin
        // healthcheck is authoritative, the poll only harvests its last
        // log entry as error detail.
        let unhealthy = {
            let engine = self.clone();
            let id = id.to_string();
            async move {
                if !has_healthcheck {
                    futures::future::pending::<()>().await;
                }
                loop {
                    tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
                    match engine.inspect(&id).await {
                        Ok(state) if state.health_status() == "unhealthy" => {
                            return unhealthy_error(&id, &state);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(container = %id, error = %e, "health poll failed");
                        }
                    }
                }
            }
        };
        tokio::pin!(unhealthy);

        tokio::select! {
            code = &mut status => code,
            err = &mut unhealthy => Err(err),
            () = cancel.cancelled() => {
                Err(Error::cancelled(format!("waiting for container {id} to exit")))
            }
        }
    }
}

fn unhealthy_error(id: &str, state: &InspectState) -> Error {
    let last_log = state
        .last_health_log()
        .map(|entry| format!("exit {}: {}", entry.exit_code, entry.output.trim()))
        .unwrap_or_else(|| "no probe output recorded".to_string());
    Error::HealthcheckFailed {
        container_id: id.to_string(),
        last_log,
    }
}

fn parse_ssh_endpoint(endpoint: &str, key_path: Option<PathBuf>) -> Result<SshRemote> {
    let rest = endpoint.trim_start_matches("ssh://");
    let (user, host_port) = match rest.split_once('@') {
        Some((user, host_port)) => (user.to_string(), host_port),
        None => ("root".to_string(), rest),
    };
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| {
                Error::invalid_config(format!("invalid ssh port in endpoint {endpoint:?}"))
            })?;
            (host.to_string(), port)
        }
        None => (host_port.to_string(), 22),
    };
    if host.is_empty() {
        return Err(Error::invalid_config(format!(
            "ssh endpoint {endpoint:?} names no host"
        )));
    }
    Ok(SshRemote {
        user,
        host,
        port,
        key_path,
    })
}
