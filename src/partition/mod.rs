//! # Partition Locking
//!
//! In-memory serialization of work sharing a partition key. The registry
//! hands out non-blocking boolean locks; [`PartitionClaim`] wraps a
//! successful acquisition so the release runs on every exit path.

mod claim;
mod lock_registry;

pub use claim::PartitionClaim;
pub use lock_registry::PartitionLockRegistry;
