//! # Review Data Model
//!
//! Work items flowing through the pipeline and the partitioning capability
//! they share. Two concrete sources exist: [`StoredReview`] rows fetched
//! from the review store and [`FeedReviewMessage`] values pushed by the
//! subscription feed. [`PipelineItem`] fuses both so a single dispatcher
//! can process either.

mod feed;
mod review;

pub use feed::FeedReviewMessage;
pub use review::StoredReview;

/// The operation whose items are serialized per account.
pub const DOWNLOAD_OPERATION: &str = "download";

/// Capability of reporting the identity components a partition key is
/// derived from. Items with the same partition key are processed one at a
/// time; the key is `client_id:account_id:operation` joined with an ASCII
/// colon and compared byte-for-byte.
pub trait Partitioned {
    fn client_id(&self) -> &str;

    fn account_id(&self) -> &str;

    fn operation(&self) -> &str;

    /// Composite partition key for this item.
    fn partition_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.client_id(),
            self.account_id(),
            self.operation()
        )
    }

    /// Whether this item belongs in the serial per-account download lane.
    /// Only this discriminator compares case-insensitively.
    fn is_download(&self) -> bool {
        self.operation().eq_ignore_ascii_case(DOWNLOAD_OPERATION)
    }
}

/// A work item the handler registry can dispatch: a type tag selecting the
/// handler plus an opaque payload handed over verbatim.
pub trait ReviewItem: Partitioned {
    fn review_type(&self) -> &str;

    fn payload(&self) -> &str;
}

/// A review from either source, so heterogeneous streams can be merged
/// into one dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineItem {
    Stored(StoredReview),
    Feed(FeedReviewMessage),
}

impl Partitioned for PipelineItem {
    fn client_id(&self) -> &str {
        match self {
            PipelineItem::Stored(review) => review.client_id(),
            PipelineItem::Feed(message) => message.client_id(),
        }
    }

    fn account_id(&self) -> &str {
        match self {
            PipelineItem::Stored(review) => review.account_id(),
            PipelineItem::Feed(message) => message.account_id(),
        }
    }

    fn operation(&self) -> &str {
        match self {
            PipelineItem::Stored(review) => review.operation(),
            PipelineItem::Feed(message) => message.operation(),
        }
    }
}

impl ReviewItem for PipelineItem {
    fn review_type(&self) -> &str {
        match self {
            PipelineItem::Stored(review) => review.review_type(),
            PipelineItem::Feed(message) => message.review_type(),
        }
    }

    fn payload(&self) -> &str {
        match self {
            PipelineItem::Stored(review) => review.payload(),
            PipelineItem::Feed(message) => message.payload(),
        }
    }
}
