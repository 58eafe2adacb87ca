//! Volume management on the engine adapter.

use tracing::debug;

use super::request::{DEFAULT_LABEL_KEY, DEFAULT_LABEL_VALUE};
use super::Engine;
use crate::error::Result;

/// A named, managed volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Volume name
    pub name: String,
}

impl Engine {
    /// Create a labeled volume; the name is generated when absent.
    pub async fn create_volume(&self, name: Option<&str>) -> Result<Volume> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.generate_name("volume"),
        };
        let args = vec![
            "volume".to_string(),
            "create".to_string(),
            "--label".to_string(),
            format!("{DEFAULT_LABEL_KEY}={DEFAULT_LABEL_VALUE}"),
            name.clone(),
        ];
        self.executor().execute(&args, None).await?;
        debug!(volume = %name, "created volume");
        Ok(Volume { name })
    }

    /// Remove a volume by name.
    ///
    /// Only the teardown stack calls this; volumes are never deleted inline.
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        let args = vec![
            "volume".to_string(),
            "rm".to_string(),
            "--force".to_string(),
            name.to_string(),
        ];
        self.executor().execute(&args, None).await?;
        debug!(volume = name, "removed volume");
        Ok(())
    }
}
