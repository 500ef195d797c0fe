//! Built-in review handlers.
//!
//! Each handler parses the review payload as JSON and applies its own
//! processing; they exist so a pipeline can run end to end out of the box
//! and as templates for application-specific handlers.

use async_trait::async_trait;
use tracing::info;

use crate::error::PipelineResult;
use crate::registry::ReviewHandler;

/// Handles `TYPE_A` reviews.
#[derive(Debug, Default)]
pub struct TypeAReviewHandler;

#[async_trait]
impl ReviewHandler for TypeAReviewHandler {
    fn review_type(&self) -> &str {
        "TYPE_A"
    }

    async fn handle(&self, payload: &str, client_id: &str) -> PipelineResult<()> {
        let review: serde_json::Value = serde_json::from_str(payload)?;
        info!(
            client_id = %client_id,
            review = %review,
            "Processing TYPE_A review"
        );
        Ok(())
    }
}

/// Handles `TYPE_B` reviews.
#[derive(Debug, Default)]
pub struct TypeBReviewHandler;

#[async_trait]
impl ReviewHandler for TypeBReviewHandler {
    fn review_type(&self) -> &str {
        "TYPE_B"
    }

    async fn handle(&self, payload: &str, client_id: &str) -> PipelineResult<()> {
        let review: serde_json::Value = serde_json::from_str(payload)?;
        info!(
            client_id = %client_id,
            review = %review,
            "Processing TYPE_B review"
        );
        Ok(())
    }
}

/// Fallback handler registered under the `DEFAULT` tag.
#[derive(Debug, Default)]
pub struct DefaultReviewHandler;

#[async_trait]
impl ReviewHandler for DefaultReviewHandler {
    fn review_type(&self) -> &str {
        "DEFAULT"
    }

    async fn handle(&self, payload: &str, client_id: &str) -> PipelineResult<()> {
        info!(
            client_id = %client_id,
            payload = %payload,
            "Processing DEFAULT review"
        );
        Ok(())
    }
}
