//! Integration tests for the plain-container harness lifecycle.

use imagetest::{Command, ContainerHarness, ContainerHarnessConfig, Engine, Harness, Reference};
use serial_test::serial;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const TEST_IMAGE: &str = "cgr.dev/chainguard/wolfi-base:latest";

async fn engine_or_skip() -> Option<Arc<Engine>> {
    let engine = match Engine::default_engine() {
        Ok(engine) => engine,
        Err(e) => {
            println!("engine binary not found - skipping harness test: {e}");
            return None;
        }
    };
    if let Err(e) = engine.probe().await {
        println!("engine daemon unreachable - skipping harness test: {e}");
        return None;
    }
    Some(Arc::new(engine))
}

#[tokio::test]
#[serial]
async fn test_plain_harness_lifecycle() {
    let Some(engine) = engine_or_skip().await else {
        return;
    };
    let cancel = CancellationToken::new();
    let config = ContainerHarnessConfig::new(Reference::parse(TEST_IMAGE).unwrap());
    let harness = ContainerHarness::new(engine, config);

    harness.create(&cancel).await.expect("create harness");

    harness
        .run(&cancel, Command::shell("echo hello > /tmp/marker"))
        .await
        .expect("write marker");
    harness
        .run(&cancel, Command::shell("grep -q hello /tmp/marker"))
        .await
        .expect("state persists across runs in one sandbox");

    let err = harness
        .run(&cancel, Command::shell("exit 42"))
        .await
        .expect_err("non-zero run fails");
    assert_eq!(err.exit_code(), Some(42));

    harness.destroy(&cancel).await.expect("destroy harness");

    // A second destroy must not release anything twice.
    let err = harness.destroy(&cancel).await.expect_err("second destroy fails");
    assert!(matches!(err, imagetest::Error::AlreadyTornDown));
}

#[tokio::test]
#[serial]
async fn test_harness_env_and_workdir() {
    let Some(engine) = engine_or_skip().await else {
        return;
    };
    let cancel = CancellationToken::new();
    let config = ContainerHarnessConfig::new(Reference::parse(TEST_IMAGE).unwrap());
    let harness = ContainerHarness::new(engine, config);
    harness.create(&cancel).await.expect("create harness");

    harness
        .run(
            &cancel,
            Command::shell("test \"$MARKER\" = on && test \"$(pwd)\" = /tmp")
                .env("MARKER", "on")
                .working_dir("/tmp"),
        )
        .await
        .expect("env and workdir applied");

    harness.destroy(&cancel).await.expect("destroy harness");
}
