use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shared configuration for publishers and dispatchers built through the
/// [`crate::publisher::PublisherFactory`] and [`crate::pipeline::ReviewPipeline`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Default polling interval in milliseconds, applied per publisher
    /// unless overridden.
    pub poll_interval_ms: u64,
    /// Global concurrency cap for any dispatcher built from this config.
    pub max_concurrency: usize,
    /// Whether publishers and dispatchers keep running after an error.
    pub continue_on_error: bool,
    /// Capacity of the channels connecting publishers to the dispatcher.
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            max_concurrency: 10,
            continue_on_error: true,
            channel_capacity: 64,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Build a config from the environment, falling back to defaults for
    /// anything unset. A `.env` file is honored when present.
    pub fn from_env() -> PipelineResult<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(interval) = std::env::var("REVIEW_PIPELINE_POLL_INTERVAL_MS") {
            config.poll_interval_ms = interval.parse().map_err(|e| {
                PipelineError::Configuration(format!("Invalid poll_interval_ms: {e}"))
            })?;
        }

        if let Ok(max_concurrency) = std::env::var("REVIEW_PIPELINE_MAX_CONCURRENCY") {
            config.max_concurrency = max_concurrency.parse().map_err(|e| {
                PipelineError::Configuration(format!("Invalid max_concurrency: {e}"))
            })?;
        }

        if let Ok(continue_on_error) = std::env::var("REVIEW_PIPELINE_CONTINUE_ON_ERROR") {
            config.continue_on_error = continue_on_error.parse().map_err(|e| {
                PipelineError::Configuration(format!("Invalid continue_on_error: {e}"))
            })?;
        }

        if let Ok(capacity) = std::env::var("REVIEW_PIPELINE_CHANNEL_CAPACITY") {
            config.channel_capacity = capacity.parse().map_err(|e| {
                PipelineError::Configuration(format!("Invalid channel_capacity: {e}"))
            })?;
        }

        Ok(config)
    }
}
