//! Runtime tuning shared by stages, aggregators and the session.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Pipeline and session runtime constants.
///
/// Every field has a default, so `{}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Backlog size of each stage queue.
    pub stage_queue_capacity: usize,
    /// Sleep between retries while a stage queue is full.
    pub accept_backoff_ms: u64,
    /// Aggregator sleep when it has nothing to pull.
    pub aggregator_idle_ms: u64,
    /// How long closing a pipeline waits for each worker.
    pub shutdown_timeout_ms: u64,
    /// Capacity of the session's serialized execution queue.
    pub execution_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stage_queue_capacity: 100,
            accept_backoff_ms: 1,
            aggregator_idle_ms: 5,
            shutdown_timeout_ms: 1000,
            execution_queue_capacity: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    pub fn aggregator_idle(&self) -> Duration {
        Duration::from_millis(self.aggregator_idle_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        assert_eq!(RuntimeConfig::from_json("{}").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = RuntimeConfig::from_json(r#"{"stage_queue_capacity": 4}"#).unwrap();
        assert_eq!(config.stage_queue_capacity, 4);
        assert_eq!(config.accept_backoff(), Duration::from_millis(1));
    }

    #[test]
    fn test_bad_json() {
        assert!(RuntimeConfig::from_json("{").is_err());
    }
}
