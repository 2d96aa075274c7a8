//! File-based configuration for a retry cascade.
//!
//! ```json
//! {
//!   "initial_interval_ms": 1000,
//!   "factor": 3.0,
//!   "max_wait_ms": 10000,
//!   "max_attempts": 3,
//!   "queue_names": ["retry-queue-1", "retry-queue-2", "retry-queue-3"],
//!   "wait_ended_queue": "retry-wait-ended-queue",
//!   "growth": "exponential",
//!   "concurrency": 1
//! }
//! ```
//!
//! Every field is optional; missing fields take the values shown above.

use crate::backoff::{BackoffSchedule, BackoffScheduleBuilder, Growth};
use crate::cascade::{validate_parts, CascadeBuildError};
use crate::queues::RetryQueueSet;
use crate::subscription::SubscribeOptions;
use crate::topology::{RetryTopology, DEFAULT_WAIT_ENDED_QUEUE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors while loading or validating a [`CascadeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid cascade config: {0}")]
    Invalid(#[from] CascadeBuildError),
}

/// Serializable description of one retry cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CascadeConfig {
    pub initial_interval_ms: u64,
    pub factor: f64,
    pub max_wait_ms: u64,
    pub max_attempts: u32,
    pub queue_names: Vec<String>,
    pub wait_ended_queue: String,
    pub growth: Growth,
    /// Deliveries processed at once per subscription.
    pub concurrency: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1000,
            factor: 3.0,
            max_wait_ms: 10_000,
            max_attempts: 3,
            queue_names: (1..=3).map(|i| format!("retry-queue-{i}")).collect(),
            wait_ended_queue: DEFAULT_WAIT_ENDED_QUEUE.to_string(),
            growth: Growth::Exponential,
            concurrency: 1,
        }
    }
}

impl CascadeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_json_str(&raw)
    }

    /// Check the schedule, the queue names, and that there is one queue per attempt.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let schedule = self.schedule().map_err(CascadeBuildError::from)?;
        let queues = RetryQueueSet::new(self.queue_names.iter().cloned())
            .map_err(CascadeBuildError::from)?;
        validate_parts(&schedule, queues, &self.wait_ended_queue)?;
        Ok(())
    }

    pub fn backoff_builder(&self) -> BackoffScheduleBuilder {
        BackoffSchedule::builder()
            .initial_interval(Duration::from_millis(self.initial_interval_ms))
            .factor(self.factor)
            .max_wait(Duration::from_millis(self.max_wait_ms))
            .max_attempts(self.max_attempts)
            .growth(self.growth)
    }

    pub fn schedule(&self) -> Result<BackoffSchedule, crate::backoff::BackoffError> {
        self.backoff_builder().build()
    }

    pub fn topology(&self) -> Result<RetryTopology, ConfigError> {
        let schedule = self.schedule().map_err(CascadeBuildError::from)?;
        let queues = RetryQueueSet::new(self.queue_names.iter().cloned())
            .map_err(CascadeBuildError::from)?;
        Ok(validate_parts(&schedule, queues, &self.wait_ended_queue)?)
    }

    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::with_concurrency(self.concurrency)
    }
}
