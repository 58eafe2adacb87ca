//! Network management on the engine adapter.
//!
//! Creation is idempotent: an existing network with the requested name is
//! reused, so the default network can be shared by every sandbox in one
//! process. Address-pool exhaustion is retried with exponential backoff;
//! any other failure surfaces immediately.

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use super::request::{NetworkAttachment, DEFAULT_LABEL_KEY, DEFAULT_LABEL_VALUE};
use super::Engine;
use crate::error::{Error, Result};

/// Name of the network shared across sandboxes of one process
pub const DEFAULT_NETWORK: &str = "imagetest";

const RETRYABLE_CREATE_ERRORS: &[&str] = &[
    "no available IPv4 pool",
    "non-overlapping IPv4 address pool",
    "all predefined address pools have been fully subnetted",
];

const CREATE_ATTEMPTS: u32 = 5;
const CREATE_BASE_DELAY: Duration = Duration::from_secs(1);
const CREATE_MAX_DELAY: Duration = Duration::from_secs(60);
const CREATE_JITTER: f64 = 0.1;

fn is_pool_exhaustion(err: &Error) -> bool {
    let text = err.to_string();
    RETRYABLE_CREATE_ERRORS.iter().any(|needle| text.contains(needle))
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = CREATE_BASE_DELAY.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = base.min(CREATE_MAX_DELAY.as_secs_f64());
    let jitter = 1.0 + rand::thread_rng().gen_range(-CREATE_JITTER..CREATE_JITTER);
    Duration::from_secs_f64(capped * jitter)
}

impl Engine {
    /// Create a network, reusing an existing one with the same name.
    pub async fn create_network(&self, name: &str) -> Result<NetworkAttachment> {
        if let Some(existing) = self.network_inspect(name).await? {
            debug!(network = name, id = %existing.id, "reusing existing network");
            return Ok(existing);
        }

        let args = vec![
            "network".to_string(),
            "create".to_string(),
            "--label".to_string(),
            format!("{DEFAULT_LABEL_KEY}={DEFAULT_LABEL_VALUE}"),
            name.to_string(),
        ];

        let mut attempt = 0;
        loop {
            match self.executor().execute(&args, None).await {
                Ok(output) => {
                    let id = output.stdout.trim().to_string();
                    debug!(network = name, id = %id, "created network");
                    return Ok(NetworkAttachment {
                        name: name.to_string(),
                        id,
                    });
                }
                Err(err) if is_pool_exhaustion(&err) && attempt + 1 < CREATE_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        network = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "address pool exhausted; retrying network create"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Look a network up by name; `Ok(None)` when it does not exist.
    pub async fn network_inspect(&self, name: &str) -> Result<Option<NetworkAttachment>> {
        let args = vec![
            "network".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            name.to_string(),
        ];
        match self.executor().execute(&args, None).await {
            Ok(output) => Ok(Some(NetworkAttachment {
                name: name.to_string(),
                id: output.stdout.trim().to_string(),
            })),
            Err(Error::Exec { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Remove a network by name or id.
    pub async fn remove_network(&self, name: &str) -> Result<()> {
        let args = vec!["network".to_string(), "rm".to_string(), name.to_string()];
        self.executor().execute(&args, None).await?;
        debug!(network = name, "removed network");
        Ok(())
    }

    /// Connect an existing container to a network.
    pub async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        let args = vec![
            "network".to_string(),
            "connect".to_string(),
            network.to_string(),
            container.to_string(),
        ];
        self.executor().execute(&args, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_matching() {
        assert!(is_pool_exhaustion(&Error::exec(
            "network create",
            1,
            "Error response from daemon: could not find an available, non-overlapping IPv4 address pool",
        )));
        assert!(is_pool_exhaustion(&Error::exec(
            "network create",
            1,
            "no available IPv4 pool",
        )));
        assert!(!is_pool_exhaustion(&Error::exec(
            "network create",
            1,
            "network with name x already exists",
        )));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        // Jitter is within 10%, so compare against loose bounds.
        let first = backoff_delay(0).as_secs_f64();
        assert!((0.9..=1.1).contains(&first));
        let second = backoff_delay(1).as_secs_f64();
        assert!((1.8..=2.2).contains(&second));
        let huge = backoff_delay(30).as_secs_f64();
        assert!(huge <= CREATE_MAX_DELAY.as_secs_f64() * 1.1);
    }
}
