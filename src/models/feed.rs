use bon::Builder;
use serde::{Deserialize, Serialize};

use super::{Partitioned, ReviewItem};

/// A decoded message delivered by the subscription feed. Carries no
/// processed flag; redelivery on gate rejection is the feed's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct FeedReviewMessage {
    pub client_id: String,
    pub account_id: String,
    pub operation: String,
    pub review_type: String,
    pub payload: String,
}

impl Partitioned for FeedReviewMessage {
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

impl ReviewItem for FeedReviewMessage {
    fn review_type(&self) -> &str {
        &self.review_type
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}
