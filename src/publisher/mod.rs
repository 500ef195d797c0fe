//! # Publishers
//!
//! Sources of gated work items. [`PollingPublisher`] turns a blocking fetch
//! function into a cancellable, back-pressure-aware stream; [`PushPublisher`]
//! adapts an externally driven source to the same shape. Items from either
//! publisher have already cleared the partition gate: the partition lock is
//! held from emission until downstream processing of the whole partition
//! group finishes.

mod factory;
mod gated;
mod polling;
mod push;

pub use factory::PublisherFactory;
pub use gated::{GatedItem, GatedStream, PartitionedStream};
pub use polling::{
    BatchObserver, ErrorObserver, FetchFn, ItemFilter, PollingPublisher, SharedPollingPublisher,
};
pub use push::PushPublisher;

pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 64;
