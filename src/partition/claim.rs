use std::sync::Arc;

use super::PartitionLockRegistry;

/// An exclusive claim on a partition key, released when the claim drops.
///
/// Publishers share one claim across every item of a gated group (behind an
/// `Arc`), so the lock is released exactly once, after the last item's
/// processing finishes, on success, error, and cancellation alike.
#[derive(Debug)]
pub struct PartitionClaim {
    key: String,
    registry: Arc<PartitionLockRegistry>,
}

impl PartitionClaim {
    pub(crate) fn new(key: String, registry: Arc<PartitionLockRegistry>) -> Self {
        Self { key, registry }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for PartitionClaim {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
