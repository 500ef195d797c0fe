//! # review-pipeline-core
//!
//! Partitioned work dispatcher for a multi-source review-processing
//! pipeline: a store poller and a subscription feed funnel into one
//! dispatcher that serializes work per partition key, serializes download
//! operations per account, and caps global handler concurrency.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod models;
pub mod partition;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod store;

pub use config::PipelineConfig;
pub use dispatcher::{
    DispatcherHandle, ItemProcessor, ProcessedStream, RegistryProcessor, ReviewDispatcher,
};
pub use error::{PipelineError, PipelineResult};
pub use models::{FeedReviewMessage, Partitioned, PipelineItem, ReviewItem, StoredReview};
pub use partition::{PartitionClaim, PartitionLockRegistry};
pub use pipeline::ReviewPipeline;
pub use publisher::{
    GatedItem, GatedStream, PartitionedStream, PollingPublisher, PublisherFactory, PushPublisher,
};
pub use registry::{ReviewHandler, ReviewHandlerRegistry};
pub use store::{InMemoryReviewStore, ReviewStore};
