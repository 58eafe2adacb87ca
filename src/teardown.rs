//! LIFO release stack for resources created during a run.
//!
//! Every resource a harness creates registers its release here immediately
//! after creation succeeds. Teardown runs the releases in strict reverse
//! insertion order, at most once each, and keeps going past individual
//! failures so later (outer) resources are still released.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
}

struct Entry {
    label: String,
    release: BoxFuture<'static, Result<()>>,
}

/// Append-only stack of release actions with a single-shot guarantee.
///
/// `add` succeeds only before the first `teardown`; a second `teardown`
/// fails with [`Error::AlreadyTornDown`] without running anything twice.
pub struct TeardownStack {
    inner: Mutex<(State, Vec<Entry>)>,
}

impl TeardownStack {
    /// Create an empty, open stack
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((State::Open, Vec::new())),
        }
    }

    /// Register a release action with a human-readable label.
    ///
    /// Fails deterministically once teardown has started.
    pub fn add<F>(&self, label: impl Into<String>, release: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.0 != State::Open {
            return Err(Error::AlreadyTornDown);
        }
        inner.1.push(Entry {
            label: label.into(),
            release: release.boxed(),
        });
        Ok(())
    }

    /// Number of pending releases
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1.len()
    }

    /// Whether the stack holds no pending releases
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run all releases in reverse insertion order.
    ///
    /// Cancellation aborts any pending releases and is reported as
    /// [`Error::Cancelled`]; releases already completed stay completed.
    /// Failures of individual releases are collected into
    /// [`Error::TeardownAggregate`] rather than stopping the unwind.
    pub async fn teardown(&self, cancel: &CancellationToken) -> Result<()> {
        let entries = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.0 != State::Open {
                return Err(Error::AlreadyTornDown);
            }
            inner.0 = State::Closing;
            std::mem::take(&mut inner.1)
        };

        let mut errors = Vec::new();
        let total = entries.len();
        for (i, entry) in entries.into_iter().rev().enumerate() {
            if cancel.is_cancelled() {
                self.close();
                return Err(Error::cancelled(format!(
                    "teardown aborted with {} release(s) pending",
                    total - i
                )));
            }
            debug!(release = %entry.label, "tearing down");
            tokio::select! {
                () = cancel.cancelled() => {
                    self.close();
                    return Err(Error::cancelled(format!(
                        "teardown aborted during release of {}",
                        entry.label
                    )));
                }
                result = entry.release => {
                    if let Err(e) = result {
                        warn!(release = %entry.label, error = %e, "release failed");
                        errors.push(format!("{}: {e}", entry.label));
                    }
                }
            }
        }
        self.close();

        if errors.is_empty() {
            Ok(())
        } else {
            errors.reverse();
            Err(Error::TeardownAggregate { errors })
        }
    }

    /// Run teardown under a fresh deadline, detached from any cancelled
    /// caller context, so resources are still released after cancellation.
    pub async fn teardown_detached(&self, timeout: std::time::Duration) -> Result<()> {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            guard.cancel();
        });
        let result = self.teardown(&cancel).await;
        deadline.abort();
        result
    }

    fn close(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).0 = State::Closed;
    }
}

impl Default for TeardownStack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TeardownStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("TeardownStack")
            .field("state", &inner.0)
            .field("pending", &inner.1.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<String>>, impl Fn(&'static str) -> BoxFuture<'static, Result<()>>) {
        let buffer = Arc::new(Mutex::new(String::new()));
        let writer = {
            let buffer = Arc::clone(&buffer);
            move |letter: &'static str| {
                let buffer = Arc::clone(&buffer);
                async move {
                    buffer.lock().unwrap().push_str(letter);
                    Ok(())
                }
                .boxed()
            }
        };
        (buffer, writer)
    }

    #[tokio::test]
    async fn test_releases_run_in_reverse_order() {
        let (buffer, record) = recorder();
        let stack = TeardownStack::new();
        stack.add("a", record("A")).unwrap();
        stack.add("b", record("B")).unwrap();
        stack.add("c", record("C")).unwrap();

        stack.teardown(&CancellationToken::new()).await.unwrap();
        assert_eq!(*buffer.lock().unwrap(), "CBA");
    }

    #[tokio::test]
    async fn test_empty_stack_teardown_is_ok() {
        let stack = TeardownStack::new();
        assert!(stack.is_empty());
        stack.teardown(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_teardown_fails_without_rerunning() {
        let (buffer, record) = recorder();
        let stack = TeardownStack::new();
        stack.add("a", record("A")).unwrap();

        stack.teardown(&CancellationToken::new()).await.unwrap();
        let err = stack.teardown(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyTornDown));
        assert_eq!(*buffer.lock().unwrap(), "A");
    }

    #[tokio::test]
    async fn test_add_after_teardown_fails() {
        let stack = TeardownStack::new();
        stack.teardown(&CancellationToken::new()).await.unwrap();
        let err = stack.add("late", async { Ok(()) }).unwrap_err();
        assert!(matches!(err, Error::AlreadyTornDown));
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_and_unwind_continues() {
        let (buffer, record) = recorder();
        let stack = TeardownStack::new();
        stack.add("a", record("A")).unwrap();
        stack
            .add("broken", async { Err(Error::transport("engine", "gone")) })
            .unwrap();
        stack.add("c", record("C")).unwrap();

        let err = stack.teardown(&CancellationToken::new()).await.unwrap_err();
        match err {
            Error::TeardownAggregate { errors } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("broken"));
            }
            other => panic!("expected aggregate, got {other}"),
        }
        // Outer release still ran despite the middle failure.
        assert_eq!(*buffer.lock().unwrap(), "CA");
    }

    #[tokio::test]
    async fn test_cancellation_aborts_pending_releases() {
        let (buffer, record) = recorder();
        let stack = TeardownStack::new();
        let cancel = CancellationToken::new();

        stack.add("a", record("A")).unwrap();
        let canceller = cancel.clone();
        stack
            .add("slow", async move {
                canceller.cancel();
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();

        let err = stack.teardown(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        // The release behind the slow one never ran.
        assert_eq!(*buffer.lock().unwrap(), "");

        // And the stack is closed for good.
        let err = stack.teardown(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyTornDown));
    }

    #[tokio::test]
    async fn test_detached_teardown_times_out() {
        let stack = TeardownStack::new();
        stack
            .add("hang", async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(())
            })
            .unwrap();
        let err = stack
            .teardown_detached(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
