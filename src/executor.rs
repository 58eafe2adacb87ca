//! Async process executor for external binaries.
//!
//! The engine adapter and the pterraform harness both drive command-line
//! tools (a container engine, `terraform`). This module owns the shared
//! spawning logic: timeouts, stdin piping, captured or raw-byte output, and
//! line-streamed output for long-running commands.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// Configuration for one command execution
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Command timeout (None for no timeout)
    pub timeout: Option<Duration>,
    /// Environment variables to set on top of the inherited environment
    pub environment: HashMap<String, String>,
    /// Environment variable names removed from the inherited environment
    pub strip_environment: Vec<String>,
    /// Working directory for the command
    pub working_dir: Option<PathBuf>,
    /// Input data to send to stdin
    pub stdin_data: Option<Vec<u8>>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(300)),
            environment: HashMap::new(),
            strip_environment: Vec::new(),
            working_dir: None,
            stdin_data: None,
        }
    }
}

impl ExecutionConfig {
    /// Configuration with no timeout, for commands that block on container exit
    pub fn unbounded() -> Self {
        Self {
            timeout: None,
            ..Self::default()
        }
    }

    /// Set the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set the stdin payload
    #[must_use]
    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin_data = Some(data);
        self
    }

    /// Set the working directory
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Result of command execution with text output
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code of the process
    pub exit_code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Whether the command was successful (exit code 0)
    pub success: bool,
}

impl CommandOutput {
    /// Get the combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// One line emitted by a streaming command
#[derive(Debug, Clone)]
pub enum OutputLine {
    /// A line from stdout
    Stdout(String),
    /// A line from stderr
    Stderr(String),
}

impl OutputLine {
    /// The line text regardless of which stream produced it
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(s) | Self::Stderr(s) => s,
        }
    }
}

/// Streaming command handle: line channel plus the child process
pub struct StreamingChild {
    /// Receiver for interleaved stdout/stderr lines
    pub lines: mpsc::Receiver<OutputLine>,
    /// Handle to the child process; callers wait on it for the exit status
    pub child: Child,
    /// The rendered command line for error reporting
    pub command_line: String,
}

/// Async process executor bound to one binary
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    /// Path to the binary
    pub program: PathBuf,
    base_environment: HashMap<String, String>,
}

impl ProcessExecutor {
    /// Create a new executor for the given binary path
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_environment: HashMap::new(),
        }
    }

    /// Locate `name` on the PATH and build an executor for it
    pub fn find(name: &str) -> Result<Self> {
        let program = which::which(name)
            .map_err(|_| Error::not_found(format!("binary `{name}` on PATH")))?;
        Ok(Self::new(program))
    }

    /// Environment applied to every execution (e.g. `DOCKER_HOST`)
    #[must_use]
    pub fn base_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_environment.insert(key.into(), value.into());
        self
    }

    fn command(&self, args: &[String], config: &ExecutionConfig) -> Command {
        let mut command = Command::new(&self.program);
        command.args(args);
        command.kill_on_drop(true);
        for name in &config.strip_environment {
            command.env_remove(name);
        }
        for (key, value) in &self.base_environment {
            command.env(key, value);
        }
        for (key, value) in &config.environment {
            command.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        command
    }

    fn command_line(&self, args: &[String]) -> String {
        format!("{} {}", self.program.display(), args.join(" "))
    }

    /// Execute and capture stdout/stderr as UTF-8 text.
    ///
    /// Non-zero exit produces an [`Error::Exec`] carrying the combined output.
    pub async fn execute(
        &self,
        args: &[String],
        config: Option<ExecutionConfig>,
    ) -> Result<CommandOutput> {
        let raw = self.execute_raw(args, config).await?;
        Ok(CommandOutput {
            exit_code: raw.exit_code,
            stdout: String::from_utf8_lossy(&raw.stdout).to_string(),
            stderr: String::from_utf8_lossy(&raw.stderr).to_string(),
            success: raw.exit_code == 0,
        })
    }

    /// Execute and capture stdout as raw bytes (tar streams from `cp`).
    pub async fn execute_raw(
        &self,
        args: &[String],
        config: Option<ExecutionConfig>,
    ) -> Result<RawOutput> {
        let config = config.unwrap_or_default();
        let command_line = self.command_line(args);
        debug!(command = %command_line, "executing");

        let mut command = self.command(args, &config);
        command.stdin(if config.stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::transport(command_line.clone(), format!("spawn failed: {e}")))?;

        if let Some(stdin_data) = config.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(&stdin_data).await {
                        warn!("failed to write to stdin: {e}");
                    }
                    if let Err(e) = stdin.shutdown().await {
                        warn!("failed to close stdin: {e}");
                    }
                });
            }
        }

        let waited = if let Some(deadline) = config.timeout {
            match timeout(deadline, Self::collect(child)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::timeout(deadline.as_secs(), command_line));
                }
            }
        } else {
            Self::collect(child).await?
        };

        trace!(exit_code = waited.exit_code, "command completed");

        if waited.exit_code != 0 {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&waited.stdout),
                String::from_utf8_lossy(&waited.stderr)
            );
            return Err(Error::exec(command_line, waited.exit_code, combined));
        }
        Ok(waited)
    }

    /// Spawn the command and stream its output line by line.
    ///
    /// The caller owns the returned [`StreamingChild`] and must wait on the
    /// child for the exit status; the line channel closes when both streams
    /// reach EOF.
    pub fn stream(
        &self,
        args: &[String],
        config: Option<ExecutionConfig>,
    ) -> Result<StreamingChild> {
        let config = config.unwrap_or_else(ExecutionConfig::unbounded);
        let command_line = self.command_line(args);
        debug!(command = %command_line, "streaming");

        let mut command = self.command(args, &config);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Error::transport(command_line.clone(), format!("spawn failed: {e}")))?;

        let (tx, rx) = mpsc::channel(256);

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(OutputLine::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(StreamingChild {
            lines: rx,
            child,
            command_line,
        })
    }

    async fn collect(mut child: Child) -> Result<RawOutput> {
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let copy_out = async {
            if let Some(out) = stdout.as_mut() {
                out.read_to_end(&mut stdout_buf).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let copy_err = async {
            if let Some(err) = stderr.as_mut() {
                err.read_to_end(&mut stderr_buf).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (o, e) = tokio::join!(copy_out, copy_err);
        o?;
        e?;

        let status = child.wait().await?;
        Ok(RawOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    }
}

/// Result of command execution with byte output
#[derive(Debug, Clone)]
pub struct RawOutput {
    /// Exit code of the process
    pub exit_code: i32,
    /// Captured stdout bytes
    pub stdout: Vec<u8>,
    /// Captured stderr bytes
    pub stderr: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> ProcessExecutor {
        ProcessExecutor::new("/bin/sh")
    }

    #[tokio::test]
    async fn test_execute_captures_stdout() {
        let out = sh()
            .execute(&["-c".into(), "echo hello".into()], None)
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_execute_nonzero_is_exec_error() {
        let err = sh()
            .execute(&["-c".into(), "echo oops >&2; exit 3".into()], None)
            .await
            .unwrap_err();
        match err {
            Error::Exec {
                exit_code,
                combined_output,
                ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(combined_output.contains("oops"));
            }
            other => panic!("expected exec error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let config = ExecutionConfig::default().with_timeout(Duration::from_millis(100));
        let err = sh()
            .execute(&["-c".into(), "sleep 5".into()], Some(config))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_stdin_piping() {
        let config = ExecutionConfig::default().stdin(b"from stdin".to_vec());
        let out = sh()
            .execute(&["-c".into(), "cat".into()], Some(config))
            .await
            .unwrap();
        assert_eq!(out.stdout, "from stdin");
    }

    #[tokio::test]
    async fn test_env_overlay_and_strip() {
        let mut config = ExecutionConfig::default().env("IMAGETEST_EXEC_A", "1");
        config.strip_environment.push("HOME".to_string());
        let out = sh()
            .execute(
                &["-c".into(), "echo ${IMAGETEST_EXEC_A}:${HOME:-unset}".into()],
                Some(config),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "1:unset");
    }

    #[tokio::test]
    async fn test_stream_interleaves_lines() {
        let mut streaming = sh()
            .stream(
                &["-c".into(), "echo one; echo two >&2; echo three".into()],
                None,
            )
            .unwrap();
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        while let Some(line) = streaming.lines.recv().await {
            match line {
                OutputLine::Stdout(s) => stdout_lines.push(s),
                OutputLine::Stderr(s) => stderr_lines.push(s),
            }
        }
        let status = streaming.child.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(stdout_lines, vec!["one", "three"]);
        assert_eq!(stderr_lines, vec!["two"]);
    }

    #[tokio::test]
    async fn test_execute_raw_bytes() {
        let out = sh()
            .execute_raw(&["-c".into(), "printf '\\000\\001\\002'".into()], None)
            .await
            .unwrap();
        assert_eq!(out.stdout, vec![0u8, 1, 2]);
    }
}
