//! # Push Publisher
//!
//! Adapter giving an externally driven source (a subscription callback, a
//! message listener) the same gated stream shape as the polling publisher.
//! No batching: each offered item passes the filter and the partition gate
//! individually.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::gated::{GatedItem, PartitionedStream};
use super::polling::ItemFilter;
use super::DEFAULT_CHANNEL_CAPACITY;
use crate::models::Partitioned;
use crate::partition::PartitionLockRegistry;

/// Entry point for push-delivered items.
pub struct PushPublisher<T> {
    lock_registry: Arc<PartitionLockRegistry>,
    item_filter: Option<ItemFilter<T>>,
    tx: mpsc::Sender<GatedItem<T>>,
}

impl<T> PushPublisher<T>
where
    T: Partitioned + Send + 'static,
{
    /// Create a publisher and the stream it feeds.
    pub fn connect(lock_registry: Arc<PartitionLockRegistry>) -> (Self, PartitionedStream<T>) {
        Self::connect_with(lock_registry, DEFAULT_CHANNEL_CAPACITY, None)
    }

    pub fn connect_with(
        lock_registry: Arc<PartitionLockRegistry>,
        channel_capacity: usize,
        item_filter: Option<ItemFilter<T>>,
    ) -> (Self, PartitionedStream<T>) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let publisher = Self {
            lock_registry,
            item_filter,
            tx,
        };
        (publisher, PartitionedStream::new(rx, CancellationToken::new()))
    }

    /// Offer one item to the pipeline. Returns `true` if the item cleared
    /// the filter and the partition gate and was forwarded; `false` if it
    /// was dropped on this attempt. Redelivery of gated-out items is the
    /// source's responsibility.
    pub async fn offer(&self, item: T) -> bool {
        if let Some(filter) = &self.item_filter {
            if !filter(&item) {
                debug!(partition_key = %item.partition_key(), "Item rejected by filter");
                return false;
            }
        }

        let key = item.partition_key();
        let Some(claim) = self.lock_registry.try_claim(&key) else {
            warn!(
                partition_key = %key,
                "Partition is already being processed, skipping item"
            );
            return false;
        };

        let gated = GatedItem::claimed(item, Arc::new(claim));
        match self.tx.send(gated).await {
            Ok(()) => true,
            // The stream is gone; the dropped claim released the lock.
            Err(_) => false,
        }
    }

    /// Whether the consuming stream still exists.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
