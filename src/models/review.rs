use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Partitioned, ReviewItem};

/// A review row from the persistent review queue. The store keeps returning
/// the same row until something marks it processed, so handlers must be
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct StoredReview {
    /// Row identifier, unique within the store.
    pub id: i64,
    pub client_id: String,
    pub account_id: String,
    pub operation: String,
    /// Selects the handler that processes this review.
    pub review_type: String,
    /// Opaque review body, handed to the handler verbatim.
    pub payload: String,
    #[builder(default)]
    pub processed: bool,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Partitioned for StoredReview {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn operation(&self) -> &str {
        &self.operation
    }
}

impl ReviewItem for StoredReview {
    fn review_type(&self) -> &str {
        &self.review_type
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}
