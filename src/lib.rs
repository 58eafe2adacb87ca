//! # imagetest
//!
//! Run shell-based tests inside ephemeral, isolated sandbox environments.
//!
//! A sandbox is a container (or set of containers) wired to a harness that
//! presents one uniform execution context: a plain container, a
//! Docker-in-Docker daemon, a k3s cluster in a container, an external
//! Kubernetes cluster, or infrastructure provisioned by terraform. The
//! driver composes a test image by appending payload layers onto a harness
//! base, starts the harness, streams the payload's logs, watches its
//! healthcheck, and tears every resource down in reverse order of creation
//! whatever the outcome.
//!
//! ## Quick start
//!
//! The driver composes the payload onto the harness base, provisions the
//! selected backend around the composed image, and runs the payload's
//! command through it. `HarnessSpec::Container` is the default; swap in
//! `HarnessSpec::Dind(..)`, `HarnessSpec::K3s(..)`,
//! `HarnessSpec::Kubernetes(..)`, or `HarnessSpec::Pterraform(..)` for the
//! other backends.
//!
//! ```rust,no_run
//! use imagetest::{
//!     AppendSpec, DindConfig, Driver, DriverConfig, Engine, HarnessSpec, Layer, Reference,
//!     RegistryClient,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> imagetest::Result<()> {
//!     let engine = Arc::new(Engine::default_engine()?);
//!     let registry = Arc::new(RegistryClient::new()?);
//!     let base = Reference::parse("cgr.dev/chainguard/docker-cli:latest")?;
//!     let config = DriverConfig::new(
//!         base.clone(),
//!         Reference::parse("registry.local:5000/imagetest")?,
//!     )
//!     .harness(HarnessSpec::Dind(DindConfig::new(base)?));
//!
//!     let driver = Driver::new(engine, registry, config);
//!     driver.setup().await?;
//!
//!     let payload = AppendSpec {
//!         layers: vec![Layer::from_files(&[(
//!             "/imagetest/run.sh".to_string(),
//!             b"#!/bin/sh\nset -e\ndocker info\n".to_vec(),
//!         )])?],
//!         cmd: vec!["/bin/sh".to_string(), "/imagetest/run.sh".to_string()],
//!         ..AppendSpec::default()
//!     };
//!
//!     let cancel = CancellationToken::new();
//!     let result = driver.run(&cancel, &payload).await?;
//!     println!("exit {} (image {})", result.exit_code, result.image);
//!
//!     driver.teardown().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`registry`] - OCI distribution client and credential keychain
//! - [`image`] - test-image composition by layer appending
//! - [`engine`] - container engine adapter (lifecycle, exec, copy, networks)
//! - [`content`] - tar content streams for copying files into containers
//! - [`teardown`] - LIFO release stack with a single-shot guarantee
//! - [`harness`] - sandbox backends satisfying one uniform contract
//! - [`driver`] - the orchestrator tying a run together
//! - [`feature`] - ordered test steps with phases and retries
//! - [`ssh`] - transport for remote engines

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use content::Content;
pub use driver::{
    Driver, DriverConfig, HarnessSpec, RunArtifact, RunResult, ARTIFACTS_PATH, PAUSED_EXIT_CODE,
    SANDBOX_HEALTHCHECK,
};
pub use engine::{
    ContainerRequest, ContainerResponse, Engine, EngineConfig, Healthcheck, Mount,
    NetworkAttachment, PublishedPort, Resources, Volume, DEFAULT_LABEL_KEY, DEFAULT_LABEL_VALUE,
    DEFAULT_NETWORK,
};
pub use error::{Error, Result};
pub use feature::{Backoff, Feature, Phase, Step};
pub use harness::container::{ContainerHarness, ContainerHarnessConfig};
pub use harness::dind::{DindConfig, DindHarness};
pub use harness::k3s::{K3sConfig, K3sHarness};
pub use harness::kubernetes::{KubeconfigSource, KubernetesConfig, KubernetesHarness};
pub use harness::pterraform::{PterraformConfig, PterraformHarness, TF_VAR_FORWARD_PREFIX};
pub use harness::{Command, Harness};
pub use image::{AppendSpec, Composer, Layer, Mutation};
pub use registry::{Reference, RegistryClient};
pub use teardown::TeardownStack;

pub mod content;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod feature;
pub mod harness;
pub mod image;
pub mod registry;
pub mod ssh;
pub mod teardown;

/// The version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_info() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_label_constants() {
        assert_eq!(DEFAULT_LABEL_KEY, "dev.chainguard.imagetest");
        assert_eq!(DEFAULT_LABEL_VALUE, "true");
    }
}
