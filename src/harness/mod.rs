//! Harness contract: the uniform execution context for test payloads.
//!
//! A harness is the minimum set of containers and/or cluster resources that
//! present one sandbox to a test. Every backend satisfies the same three
//! operations, so the driver never knows which shape it is driving.

pub mod container;
pub mod dind;
pub mod k3s;
pub mod kubernetes;
pub mod pterraform;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A boxed writer receiving one of the command's output streams
pub type OutputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One command to run inside a sandbox.
///
/// A `Command` owns its writers and must not be shared across tasks; build
/// a fresh one per invocation.
pub struct Command {
    /// Argument vector executed in the sandbox
    pub args: Vec<String>,
    /// Working directory inside the sandbox
    pub working_dir: Option<String>,
    /// Environment variables set for the command
    pub env: BTreeMap<String, String>,
    /// Receives the command's stdout
    pub stdout: Option<OutputWriter>,
    /// Receives the command's stderr
    pub stderr: Option<OutputWriter>,
}

impl Command {
    /// A command run through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::argv(vec!["sh".to_string(), "-c".to_string(), script.into()])
    }

    /// A command run as the given argument vector
    pub fn argv(args: Vec<String>) -> Self {
        Self {
            args,
            working_dir: None,
            env: BTreeMap::new(),
            stdout: None,
            stderr: None,
        }
    }

    /// Set the working directory
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Attach a stdout writer
    #[must_use]
    pub fn stdout(mut self, writer: OutputWriter) -> Self {
        self.stdout = Some(writer);
        self
    }

    /// Attach a stderr writer
    #[must_use]
    pub fn stderr(mut self, writer: OutputWriter) -> Self {
        self.stderr = Some(writer);
        self
    }

    /// The rendered command line, for error reporting
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .finish_non_exhaustive()
    }
}

/// A sandbox backend.
///
/// Implementations hold a [`TeardownStack`](crate::teardown::TeardownStack)
/// by value and register every resource they create; `destroy` delegates to
/// it. `run` executes one command in the sandbox and fails with
/// [`Error::Exec`](crate::error::Error::Exec) on non-zero exit.
#[async_trait]
pub trait Harness: Send + Sync {
    /// Provision the sandbox
    async fn create(&self, cancel: &CancellationToken) -> Result<()>;

    /// Execute a command inside the sandbox
    async fn run(&self, cancel: &CancellationToken, command: Command) -> Result<()>;

    /// Release every resource this harness created, in reverse order
    async fn destroy(&self, cancel: &CancellationToken) -> Result<()>;

    /// Read one file out of the sandbox by absolute path.
    ///
    /// The driver uses this for artifact collection after the payload
    /// exits. The default reads through the sandbox shell, so any backend
    /// with a working `run` supports it.
    async fn extract_file(&self, path: &str) -> Result<Vec<u8>> {
        if !path.starts_with('/') {
            return Err(Error::invalid_config(format!(
                "path {path:?} is not absolute"
            )));
        }
        let buffer = BufferWriter::default();
        let command = Command::argv(vec!["cat".to_string(), path.to_string()])
            .stdout(Box::new(buffer.clone()));
        self.run(&CancellationToken::new(), command).await?;
        Ok(buffer.into_bytes())
    }
}

/// An `AsyncWrite` collecting everything into shared memory.
#[derive(Clone, Default)]
pub(crate) struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl BufferWriter {
    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_command_shape() {
        let command = Command::shell("exit 0");
        assert_eq!(command.args, vec!["sh", "-c", "exit 0"]);
        assert_eq!(command.command_line(), "sh -c exit 0");
    }

    #[test]
    fn test_builder_fields() {
        let command = Command::argv(vec!["ls".into()])
            .working_dir("/work")
            .env("A", "1");
        assert_eq!(command.working_dir.as_deref(), Some("/work"));
        assert_eq!(command.env.get("A").map(String::as_str), Some("1"));
    }
}
