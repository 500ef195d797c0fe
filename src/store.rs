//! Review store contract.
//!
//! The pipeline treats persistence as an opaque collaborator: a blocking
//! fetch of unprocessed rows and a blocking mark-processed call. Both run
//! on the blocking worker pool, never on the async executor.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::models::StoredReview;

/// Blocking persistence contract for poll-sourced reviews.
///
/// `fetch_unprocessed` must be idempotent across invocations: the same row
/// keeps coming back until `mark_processed` succeeds for it.
pub trait ReviewStore: Send + Sync {
    /// Fetch the next batch of unprocessed reviews in creation order. An
    /// empty batch means nothing to do this tick.
    fn fetch_unprocessed(&self) -> PipelineResult<Vec<StoredReview>>;

    /// Flag a review as processed so it stops being fetched.
    fn mark_processed(&self, id: i64) -> PipelineResult<()>;
}

/// Mutex-backed store for tests and wiring examples.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    rows: Mutex<Vec<StoredReview>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<StoredReview>) -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(rows),
        })
    }

    pub fn insert(&self, review: StoredReview) {
        self.lock_rows().push(review);
    }

    pub fn unprocessed_count(&self) -> usize {
        self.lock_rows().iter().filter(|r| !r.processed).count()
    }

    pub fn processed_ids(&self) -> Vec<i64> {
        self.lock_rows()
            .iter()
            .filter(|r| r.processed)
            .map(|r| r.id)
            .collect()
    }

    fn lock_rows(&self) -> MutexGuard<'_, Vec<StoredReview>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReviewStore for InMemoryReviewStore {
    fn fetch_unprocessed(&self) -> PipelineResult<Vec<StoredReview>> {
        let rows = self.lock_rows();
        let mut batch: Vec<StoredReview> =
            rows.iter().filter(|r| !r.processed).cloned().collect();
        batch.sort_by_key(|r| r.created_at);
        Ok(batch)
    }

    fn mark_processed(&self, id: i64) -> PipelineResult<()> {
        let mut rows = self.lock_rows();
        let Some(row) = rows.iter_mut().find(|r| r.id == id) else {
            return Err(PipelineError::Store(format!(
                "Review {id} not found while marking processed"
            )));
        };
        row.processed = true;
        row.processed_at = Some(Utc::now());
        info!(review_id = id, "Marked review as processed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn review(id: i64) -> StoredReview {
        StoredReview::builder()
            .id(id)
            .client_id("client-1".to_string())
            .account_id("account-1".to_string())
            .operation("update".to_string())
            .review_type("TYPE_A".to_string())
            .payload("{}".to_string())
            .build()
    }

    #[test]
    fn fetch_skips_processed_rows() {
        let store = InMemoryReviewStore::new();
        store.insert(review(1));
        store.insert(review(2));
        store.mark_processed(1).expect("mark");

        let batch = store.fetch_unprocessed().expect("fetch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, 2);
    }

    #[test]
    fn marking_unknown_row_is_a_store_error() {
        let store = InMemoryReviewStore::new();
        assert!(matches!(
            store.mark_processed(99),
            Err(PipelineError::Store(_))
        ));
    }

    #[test]
    fn marked_rows_record_a_processed_timestamp() {
        let store = InMemoryReviewStore::new();
        store.insert(review(1));
        store.mark_processed(1).expect("mark");
        let rows = store.lock_rows();
        assert!(rows[0].processed);
        assert!(rows[0].processed_at.is_some());
    }
}
