use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::PartitionClaim;

/// Registry of per-partition boolean locks.
///
/// Lock cells are created lazily on first acquisition and never removed;
/// the map's cardinality is bounded by the number of distinct partition
/// keys ever seen. Both operations are total: acquisition either succeeds
/// or reports the partition busy, and releasing an unheld or unknown key
/// is a no-op.
#[derive(Debug, Default)]
pub struct PartitionLockRegistry {
    cells: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl PartitionLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire the lock for a partition key. Returns `true` on
    /// the free-to-held transition, `false` when the partition is already
    /// being processed. Never blocks.
    pub fn try_acquire(&self, key: &str) -> bool {
        let cell = self.cell(key);
        let acquired = cell
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if acquired {
            debug!(partition_key = %key, "Acquired partition lock");
        } else {
            debug!(partition_key = %key, "Partition is already being processed");
        }

        acquired
    }

    /// Release the lock for a partition key. Idempotent: releasing an
    /// unheld or never-seen key does nothing.
    pub fn release(&self, key: &str) {
        match self.read_cells().get(key) {
            Some(cell) => {
                cell.store(false, Ordering::Release);
                debug!(partition_key = %key, "Released partition lock");
            }
            None => {
                debug!(partition_key = %key, "Release of unknown partition key ignored");
            }
        }
    }

    /// Acquire the lock and wrap it in a claim that releases on drop.
    pub fn try_claim(self: &Arc<Self>, key: &str) -> Option<PartitionClaim> {
        if self.try_acquire(key) {
            Some(PartitionClaim::new(key.to_string(), Arc::clone(self)))
        } else {
            None
        }
    }

    /// Whether the lock for a key is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.read_cells()
            .get(key)
            .map(|cell| cell.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Number of currently held locks.
    pub fn held_count(&self) -> usize {
        self.read_cells()
            .values()
            .filter(|cell| cell.load(Ordering::Acquire))
            .count()
    }

    /// Number of lock cells ever created. Cells are never evicted, so this
    /// grows with the number of distinct keys observed.
    pub fn len(&self) -> usize {
        self.read_cells().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cell(&self, key: &str) -> Arc<AtomicBool> {
        if let Some(cell) = self.read_cells().get(key) {
            return Arc::clone(cell);
        }
        Arc::clone(
            self.write_cells()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    // The cells are atomics, so a panic while the map guard is held cannot
    // leave the map inconsistent; recover the guard instead of poisoning
    // every later caller.
    fn read_cells(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.cells.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cells(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<AtomicBool>>> {
        self.cells.write().unwrap_or_else(|e| e.into_inner())
    }
}
