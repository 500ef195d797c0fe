//! # Handler Registry
//!
//! Binds review type tags to handlers. The registry is assembled once at
//! startup from the full handler set and never mutated afterwards, so
//! lookups are plain map reads with no locking.

mod handler_registry;

pub use handler_registry::{ReviewHandler, ReviewHandlerRegistry};
