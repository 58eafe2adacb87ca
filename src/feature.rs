//! Features: named collections of ordered test steps.
//!
//! Steps are partitioned into three phases. `Before` and `Assessment` run in
//! order and short-circuit on the first failure; `After` always runs, even
//! when an earlier phase failed, so cleanup steps observe every outcome.

use futures::future::BoxFuture;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Which phase a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Setup steps, run first
    Before,
    /// The steps under test
    Assessment,
    /// Cleanup steps; always run
    After,
}

/// Exponential backoff for a retried step
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Total attempts, including the first
    pub max_steps: u32,
    /// Multiplier applied to the delay after each attempt
    pub multiplier: f64,
}

type StepFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One named step
pub struct Step {
    name: String,
    phase: Phase,
    backoff: Option<Backoff>,
    run: StepFn,
}

impl Step {
    /// Create a step from a closure producing its execution future
    pub fn new<F>(name: impl Into<String>, phase: Phase, run: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            phase,
            backoff: None,
            run: Box::new(run),
        }
    }

    /// Retry the step with exponential backoff
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    async fn execute(&self) -> Result<()> {
        let Some(backoff) = &self.backoff else {
            return (self.run)().await;
        };
        let attempts = backoff.max_steps.max(1);
        let mut delay = backoff.initial;
        let mut last = None;
        for attempt in 0..attempts {
            match (self.run)().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(step = %self.name, attempt, error = %e, "step attempt failed");
                    last = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.mul_f64(backoff.multiplier);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::invalid_config("step ran zero attempts")))
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("retried", &self.backoff.is_some())
            .finish()
    }
}

/// A named, ordered collection of steps.
///
/// Built once and executed once per invocation.
#[derive(Debug)]
pub struct Feature {
    name: String,
    steps: Vec<Step>,
}

impl Feature {
    /// Create an empty feature
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// The feature's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a step; steps run in insertion order within their phase
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Execute all phases.
    ///
    /// Returns the first `Before`/`Assessment` failure after `After` has
    /// run; an `After` failure is returned only when everything else
    /// passed.
    pub async fn execute(&self) -> Result<()> {
        let mut primary: Option<Error> = None;

        for phase in [Phase::Before, Phase::Assessment] {
            if primary.is_some() {
                break;
            }
            for step in self.steps.iter().filter(|s| s.phase == phase) {
                debug!(feature = %self.name, step = %step.name, ?phase, "running step");
                if let Err(e) = step.execute().await {
                    primary = Some(e);
                    break;
                }
            }
        }

        let mut after_failure: Option<Error> = None;
        for step in self.steps.iter().filter(|s| s.phase == Phase::After) {
            debug!(feature = %self.name, step = %step.name, "running after step");
            if let Err(e) = step.execute().await {
                warn!(feature = %self.name, step = %step.name, error = %e, "after step failed");
                if after_failure.is_none() {
                    after_failure = Some(e);
                }
            }
        }

        match (primary, after_failure) {
            (Some(primary), _) => Err(primary),
            (None, Some(after)) => Err(after),
            (None, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn recording_step(
        name: &str,
        phase: Phase,
        log: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Step {
        let log = Arc::clone(log);
        let name_owned = name.to_string();
        Step::new(name, phase, move || {
            let log = Arc::clone(&log);
            let name = name_owned.clone();
            async move {
                log.lock().unwrap().push(name.clone());
                if fail {
                    Err(Error::exec(name, 1, "boom"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let feature = Feature::new("ordering")
            .step(recording_step("cleanup", Phase::After, &log, false))
            .step(recording_step("setup", Phase::Before, &log, false))
            .step(recording_step("assess", Phase::Assessment, &log, false));
        feature.execute().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["setup", "assess", "cleanup"]);
    }

    #[tokio::test]
    async fn test_failure_short_circuits_to_after() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let feature = Feature::new("short-circuit")
            .step(recording_step("setup", Phase::Before, &log, true))
            .step(recording_step("assess", Phase::Assessment, &log, false))
            .step(recording_step("cleanup", Phase::After, &log, false));
        let err = feature.execute().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
        // Assessment skipped, cleanup still ran.
        assert_eq!(*log.lock().unwrap(), vec!["setup", "cleanup"]);
    }

    #[tokio::test]
    async fn test_after_failure_surfaces_when_rest_passed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let feature = Feature::new("after-fails")
            .step(recording_step("assess", Phase::Assessment, &log, false))
            .step(recording_step("cleanup", Phase::After, &log, true));
        assert!(feature.execute().await.is_err());
    }

    #[tokio::test]
    async fn test_backoff_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let step = Step::new("flaky", Phase::Assessment, move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transport("x", "not yet"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
        .with_backoff(Backoff {
            initial: Duration::from_millis(1),
            max_steps: 5,
            multiplier: 2.0,
        });
        let feature = Feature::new("retry").step(step);
        feature.execute().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_backoff_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let step = Step::new("always-fails", Phase::Assessment, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport("x", "still broken"))
            }
            .boxed()
        })
        .with_backoff(Backoff {
            initial: Duration::from_millis(1),
            max_steps: 3,
            multiplier: 1.0,
        });
        let feature = Feature::new("exhaust").step(step);
        assert!(feature.execute().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
