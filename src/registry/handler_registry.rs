use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};

/// A processing strategy for one review type.
#[async_trait]
pub trait ReviewHandler: Send + Sync {
    /// The type tag this handler is registered under.
    fn review_type(&self) -> &str;

    /// Process one review payload for a client. Errors propagate to the
    /// dispatcher's error observer unchanged.
    async fn handle(&self, payload: &str, client_id: &str) -> PipelineResult<()>;
}

/// Immutable mapping from review type to handler.
pub struct ReviewHandlerRegistry {
    handlers: HashMap<String, Arc<dyn ReviewHandler>>,
}

impl ReviewHandlerRegistry {
    /// Build a registry from a set of handlers. A duplicate review type is
    /// a configuration error: silently shadowing a handler would reroute
    /// items at runtime.
    pub fn new(
        handlers: impl IntoIterator<Item = Arc<dyn ReviewHandler>>,
    ) -> PipelineResult<Self> {
        let mut bindings: HashMap<String, Arc<dyn ReviewHandler>> = HashMap::new();
        for handler in handlers {
            let review_type = handler.review_type().to_string();
            if bindings.contains_key(&review_type) {
                return Err(PipelineError::Configuration(format!(
                    "Duplicate handler registered for review type: {review_type}"
                )));
            }
            info!(review_type = %review_type, "Registered handler for review type");
            bindings.insert(review_type, handler);
        }
        Ok(Self { handlers: bindings })
    }

    /// Dispatch a review to the handler registered for its type.
    pub async fn dispatch(
        &self,
        review_type: &str,
        payload: &str,
        client_id: &str,
    ) -> PipelineResult<()> {
        let Some(handler) = self.handlers.get(review_type) else {
            warn!(review_type = %review_type, "No handler found for review type");
            return Err(PipelineError::UnknownReviewType(review_type.to_string()));
        };
        handler.handle(payload, client_id).await
    }

    pub fn has_handler(&self, review_type: &str) -> bool {
        self.handlers.contains_key(review_type)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl std::fmt::Debug for ReviewHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut review_types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        review_types.sort_unstable();
        f.debug_struct("ReviewHandlerRegistry")
            .field("review_types", &review_types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubHandler {
        review_type: String,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl ReviewHandler for StubHandler {
        fn review_type(&self) -> &str {
            &self.review_type
        }

        async fn handle(&self, _payload: &str, _client_id: &str) -> PipelineResult<()> {
            match &self.fail_with {
                Some(message) => Err(PipelineError::Handler(message.clone())),
                None => Ok(()),
            }
        }
    }

    fn stub(review_type: &str) -> Arc<dyn ReviewHandler> {
        Arc::new(StubHandler {
            review_type: review_type.to_string(),
            fail_with: None,
        })
    }

    #[tokio::test]
    async fn dispatches_to_matching_handler() {
        let registry = ReviewHandlerRegistry::new([stub("TYPE_A")]).expect("registry");
        assert!(registry.dispatch("TYPE_A", "{}", "client-1").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_review_type_is_an_error() {
        let registry =
            ReviewHandlerRegistry::new(Vec::<Arc<dyn ReviewHandler>>::new()).expect("registry");
        let err = registry
            .dispatch("MISSING", "{}", "client-1")
            .await
            .expect_err("should fail");
        assert_eq!(err, PipelineError::UnknownReviewType("MISSING".to_string()));
    }

    #[tokio::test]
    async fn handler_failures_propagate_unchanged() {
        let failing: Arc<dyn ReviewHandler> = Arc::new(StubHandler {
            review_type: "TYPE_A".to_string(),
            fail_with: Some("boom".to_string()),
        });
        let registry = ReviewHandlerRegistry::new([failing]).expect("registry");
        let err = registry
            .dispatch("TYPE_A", "{}", "client-1")
            .await
            .expect_err("should fail");
        assert_eq!(err, PipelineError::Handler("boom".to_string()));
    }

    #[test]
    fn duplicate_review_types_are_rejected() {
        let result = ReviewHandlerRegistry::new([stub("TYPE_A"), stub("TYPE_A")]);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn reports_registered_types() {
        let registry =
            ReviewHandlerRegistry::new([stub("TYPE_A"), stub("TYPE_B")]).expect("registry");
        assert!(registry.has_handler("TYPE_A"));
        assert!(!registry.has_handler("TYPE_C"));
        assert_eq!(registry.handler_count(), 2);
    }
}
