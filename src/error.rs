//! Error types for the imagetest crate.
//!
//! One error enum covers every subsystem: registry transport, image
//! composition, the container engine adapter, harness provisioning, and
//! teardown. Components add one layer of context each and propagate.

use thiserror::Error;

/// Result type for imagetest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for all imagetest operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration, detected before any side effect
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong with the configuration
        message: String,
    },

    /// The requested descriptor, container, or resource does not exist
    #[error("not found: {what}")]
    NotFound {
        /// Identity of the missing entity
        what: String,
    },

    /// Credentials are missing or were rejected; never retried
    #[error("authentication failed for {registry}: {message}")]
    Auth {
        /// Registry or endpoint the credentials were for
        registry: String,
        /// Detail from the credential resolver or server
        message: String,
    },

    /// A network-facing call failed (registry, engine, k8s API)
    #[error("transport error against {endpoint}: {message}")]
    Transport {
        /// Identity of the endpoint that failed
        endpoint: String,
        /// Underlying failure detail
        message: String,
    },

    /// A manifest carried a media type the composer cannot mutate
    #[error("unsupported media type: {media_type}")]
    UnsupportedMediaType {
        /// The offending media type
        media_type: String,
    },

    /// A command inside a sandbox or against the engine exited non-zero
    #[error("command failed with exit code {exit_code}: {command_line}")]
    Exec {
        /// Exit code reported for the command
        exit_code: i32,
        /// Merged stdout and stderr, preserved so tests can assert on it
        combined_output: String,
        /// The command line that was executed
        command_line: String,
    },

    /// A container's healthcheck reported unhealthy while we waited on it
    #[error("container {container_id} became unhealthy: {last_log}")]
    HealthcheckFailed {
        /// The container whose probe failed
        container_id: String,
        /// The most recent health-probe log entry
        last_log: String,
    },

    /// The driving context was cancelled; teardown still runs
    #[error("operation cancelled: {cause}")]
    Cancelled {
        /// What was in flight when the cancellation arrived
        cause: String,
    },

    /// An operation did not finish within its deadline
    #[error("operation timed out after {seconds} seconds: {operation}")]
    Timeout {
        /// Seconds waited before giving up
        seconds: u64,
        /// The operation that was in flight
        operation: String,
    },

    /// `add` was called on a stack that already tore down, or `teardown` ran twice
    #[error("teardown stack is already torn down")]
    AlreadyTornDown,

    /// One or more release closures failed during teardown
    #[error("teardown finished with {} error(s): {}", errors.len(), errors.join("; "))]
    TeardownAggregate {
        /// Closure failures in reverse-execution order
        errors: Vec<String>,
    },

    /// IO error occurred during operation
    #[error("io error: {message}")]
    Io {
        /// Error message describing the IO failure
        message: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing or serialization error
    #[error("json error: {message}")]
    Json {
        /// Error message describing the JSON failure
        message: String,
        /// The underlying JSON error
        #[source]
        source: serde_json::Error,
    },

    /// YAML parsing or rendering error
    #[error("yaml error: {message}")]
    Yaml {
        /// Error message describing the YAML failure
        message: String,
        /// The underlying YAML error
        #[source]
        source: serde_yaml::Error,
    },
}

impl Error {
    /// Create a new invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new authentication error
    pub fn auth(registry: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            registry: registry.into(),
            message: message.into(),
        }
    }

    /// Create a new transport error
    pub fn transport(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a new execution error
    pub fn exec(
        command_line: impl Into<String>,
        exit_code: i32,
        combined_output: impl Into<String>,
    ) -> Self {
        Self::Exec {
            exit_code,
            combined_output: combined_output.into(),
            command_line: command_line.into(),
        }
    }

    /// Create a new cancellation error
    pub fn cancelled(cause: impl Into<String>) -> Self {
        Self::Cancelled {
            cause: cause.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(seconds: u64, operation: impl Into<String>) -> Self {
        Self::Timeout {
            seconds,
            operation: operation.into(),
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config",
            Self::NotFound { .. } => "not-found",
            Self::Auth { .. } => "auth",
            Self::Transport { .. } => "transport",
            Self::UnsupportedMediaType { .. } => "media-type",
            Self::Exec { .. } | Self::HealthcheckFailed { .. } => "exec",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::AlreadyTornDown | Self::TeardownAggregate { .. } => "teardown",
            Self::Io { .. } => "io",
            Self::Json { .. } | Self::Yaml { .. } => "encoding",
        }
    }

    /// Check if this error may be retried under a component retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Io { .. }
        )
    }

    /// Exit code carried by an execution error, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exec { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let endpoint = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        Self::Transport {
            endpoint,
            message: err.to_string(),
        }
    }
}
