//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod strategies;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use review_pipeline_core::{
    FeedReviewMessage, ItemProcessor, PipelineError, PipelineResult, ReviewItem,
};

/// Build a feed message whose payload doubles as its label in assertions.
pub fn feed_message(
    client_id: &str,
    account_id: &str,
    operation: &str,
    label: &str,
) -> FeedReviewMessage {
    FeedReviewMessage::builder()
        .client_id(client_id.to_string())
        .account_id(account_id.to_string())
        .operation(operation.to_string())
        .review_type("TYPE_A".to_string())
        .payload(label.to_string())
        .build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Completed,
}

#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    pub label: String,
    pub kind: EventKind,
    pub at: Instant,
}

/// Processor that records per-item start/completion events and tracks how
/// many invocations run concurrently.
pub struct RecordingProcessor {
    delay: Duration,
    fail_labels: Vec<String>,
    events: Mutex<Vec<ProcessingEvent>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingProcessor {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail_labels: Vec::new(),
            events: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Like [`RecordingProcessor::new`], but items with these labels fail.
    pub fn failing_on(delay: Duration, fail_labels: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail_labels: fail_labels.iter().map(|s| s.to_string()).collect(),
            events: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<ProcessingEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn started_labels(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Started)
            .map(|e| e.label)
            .collect()
    }

    pub fn completed_labels(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Completed)
            .map(|e| e.label)
            .collect()
    }

    pub fn started_at(&self, label: &str) -> Option<Instant> {
        self.events()
            .into_iter()
            .find(|e| e.kind == EventKind::Started && e.label == label)
            .map(|e| e.at)
    }

    pub fn completed_at(&self, label: &str) -> Option<Instant> {
        self.events()
            .into_iter()
            .find(|e| e.kind == EventKind::Completed && e.label == label)
            .map(|e| e.at)
    }

    /// The processor as the trait object the dispatcher builder expects.
    pub fn as_processor(self: &Arc<Self>) -> Arc<dyn ItemProcessor<FeedReviewMessage>> {
        Arc::clone(self) as Arc<dyn ItemProcessor<FeedReviewMessage>>
    }

    fn record(&self, label: &str, kind: EventKind) {
        self.events.lock().expect("events lock").push(ProcessingEvent {
            label: label.to_string(),
            kind,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl<T> ItemProcessor<T> for RecordingProcessor
where
    T: ReviewItem + Send + Sync,
{
    async fn process(&self, item: &T) -> PipelineResult<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.record(item.payload(), EventKind::Started);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.record(item.payload(), EventKind::Completed);

        if self.fail_labels.iter().any(|l| l == item.payload()) {
            return Err(PipelineError::Handler(format!(
                "induced failure for {}",
                item.payload()
            )));
        }
        Ok(())
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
