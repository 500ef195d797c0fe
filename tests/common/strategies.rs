//! Proptest strategies shared by the property-based tests.

use proptest::prelude::*;

/// One step of an acquire/release workload against the lock registry.
#[derive(Debug, Clone)]
pub enum LockOp {
    Acquire(usize),
    Release(usize),
}

/// A colon-free partition key component.
pub fn key_component() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{1,12}"
}

/// A small pool of partition keys.
pub fn key_pool() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(key_component(), 1..5).prop_map(|mut keys| {
        keys.sort();
        keys.dedup();
        keys
    })
}

/// A workload of interleaved acquire/release steps over a key pool of the
/// given size.
pub fn lock_workload(pool_size: usize) -> impl Strategy<Value = Vec<LockOp>> {
    prop::collection::vec(
        (0..pool_size, prop::bool::ANY).prop_map(|(key, acquire)| {
            if acquire {
                LockOp::Acquire(key)
            } else {
                LockOp::Release(key)
            }
        }),
        0..64,
    )
}
