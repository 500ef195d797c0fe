//! Factory for publishers pre-configured from [`PipelineConfig`].

use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::models::Partitioned;
use crate::partition::PartitionLockRegistry;

use super::gated::PartitionedStream;
use super::polling::{FetchFn, PollingPublisher};
use super::push::PushPublisher;

/// Builds publishers that share one lock registry and the configured
/// defaults; individual publishers can override the polling interval.
#[derive(Clone)]
pub struct PublisherFactory {
    config: PipelineConfig,
    lock_registry: Arc<PartitionLockRegistry>,
}

impl PublisherFactory {
    pub fn new(config: PipelineConfig, lock_registry: Arc<PartitionLockRegistry>) -> Self {
        Self {
            config,
            lock_registry,
        }
    }

    pub fn lock_registry(&self) -> &Arc<PartitionLockRegistry> {
        &self.lock_registry
    }

    /// A polling publisher using the configured interval and error policy.
    pub fn polling_publisher<T>(&self, fetch: FetchFn<T>) -> PollingPublisher<T>
    where
        T: Partitioned + Send + 'static,
    {
        self.polling_publisher_with_interval(fetch, self.config.poll_interval_ms)
    }

    /// A polling publisher with a custom interval, overriding the default.
    pub fn polling_publisher_with_interval<T>(
        &self,
        fetch: FetchFn<T>,
        poll_interval_ms: u64,
    ) -> PollingPublisher<T>
    where
        T: Partitioned + Send + 'static,
    {
        PollingPublisher::builder()
            .fetch(fetch)
            .lock_registry(Arc::clone(&self.lock_registry))
            .poll_interval(Duration::from_millis(poll_interval_ms))
            .continue_on_error(self.config.continue_on_error)
            .channel_capacity(self.config.channel_capacity)
            .build()
    }

    /// A push publisher and the stream it feeds.
    pub fn push_publisher<T>(&self) -> (PushPublisher<T>, PartitionedStream<T>)
    where
        T: Partitioned + Send + 'static,
    {
        PushPublisher::connect_with(
            Arc::clone(&self.lock_registry),
            self.config.channel_capacity,
            None,
        )
    }
}
