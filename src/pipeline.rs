//! # Review Pipeline
//!
//! Composition root wiring the store poller, the subscription feed, the
//! handler registry, and the dispatcher into one running pipeline.
//!
//! Poll-sourced reviews are marked processed in the store after their
//! handler succeeds, so the store stops serving them; feed messages carry
//! no processed flag and are simply acknowledged by completion.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::PipelineConfig;
use crate::dispatcher::{DispatcherHandle, ItemProcessor, ReviewDispatcher};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{FeedReviewMessage, Partitioned, PipelineItem, ReviewItem};
use crate::partition::PartitionLockRegistry;
use crate::publisher::{PublisherFactory, PushPublisher};
use crate::registry::{ReviewHandler, ReviewHandlerRegistry};
use crate::store::ReviewStore;

/// A running review pipeline.
pub struct ReviewPipeline {
    feed: PushPublisher<PipelineItem>,
    handle: DispatcherHandle,
    lock_registry: Arc<PartitionLockRegistry>,
}

impl ReviewPipeline {
    /// Assemble and start a pipeline: a polling publisher over the store, a
    /// push publisher for the feed, and a dispatcher invoking the given
    /// handlers. Fails fast on duplicate handler registrations.
    pub fn start(
        config: PipelineConfig,
        store: Arc<dyn ReviewStore>,
        handlers: impl IntoIterator<Item = Arc<dyn ReviewHandler>>,
    ) -> PipelineResult<Self> {
        let registry = Arc::new(ReviewHandlerRegistry::new(handlers)?);
        let lock_registry = Arc::new(PartitionLockRegistry::new());
        let factory = PublisherFactory::new(config.clone(), Arc::clone(&lock_registry));

        let fetch_store = Arc::clone(&store);
        let polling = factory.polling_publisher::<PipelineItem>(Arc::new(move || {
            fetch_store
                .fetch_unprocessed()
                .map(|rows| rows.into_iter().map(PipelineItem::Stored).collect())
                .map_err(Into::into)
        }));
        let poll_stream = polling.subscribe();
        let (feed, feed_stream) = factory.push_publisher::<PipelineItem>();

        let processor: Arc<dyn ItemProcessor<PipelineItem>> =
            Arc::new(StoreProcessor { registry, store });
        let dispatcher = ReviewDispatcher::builder(processor)
            .source(poll_stream)
            .source(feed_stream)
            .max_concurrency(config.max_concurrency)
            .continue_on_error(config.continue_on_error)
            .build();
        let handle = dispatcher.start_async();

        info!(
            poll_interval_ms = config.poll_interval_ms,
            max_concurrency = config.max_concurrency,
            "Review pipeline started"
        );
        Ok(Self {
            feed,
            handle,
            lock_registry,
        })
    }

    /// Offer a feed message to the pipeline. Returns `false` if the message
    /// was gated out on this attempt; redelivery is the feed's concern.
    pub async fn offer_feed(&self, message: FeedReviewMessage) -> bool {
        self.feed.offer(PipelineItem::Feed(message)).await
    }

    pub fn lock_registry(&self) -> &Arc<PartitionLockRegistry> {
        &self.lock_registry
    }

    /// Stop the pipeline: cancel the poller and the feed stream, let
    /// in-flight handlers finish, and release all partition locks.
    pub async fn stop(self) -> PipelineResult<()> {
        info!("Stopping review pipeline");
        self.handle.stop().await
    }
}

/// Dispatches through the handler registry, then marks poll-sourced items
/// processed. A mark failure is this item's processing error, not a
/// dispatcher fault.
struct StoreProcessor {
    registry: Arc<ReviewHandlerRegistry>,
    store: Arc<dyn ReviewStore>,
}

#[async_trait]
impl ItemProcessor<PipelineItem> for StoreProcessor {
    async fn process(&self, item: &PipelineItem) -> PipelineResult<()> {
        self.registry
            .dispatch(item.review_type(), item.payload(), item.client_id())
            .await?;

        if let PipelineItem::Stored(review) = item {
            let store = Arc::clone(&self.store);
            let id = review.id;
            let marked = tokio::task::spawn_blocking(move || store.mark_processed(id))
                .await
                .map_err(|e| {
                    PipelineError::Store(format!("mark-processed task panicked: {e}"))
                })?;
            marked?;
        }
        Ok(())
    }
}
