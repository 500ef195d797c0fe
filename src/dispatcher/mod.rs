//! # Review Dispatcher
//!
//! Merges gated streams from any number of publishers and drives handler
//! execution with two-level routing and a global concurrency cap.
//!
//! ## Pipeline
//!
//! 1. **Merge** — items from all sources interleave into one stream; each
//!    source's internal order is preserved, cross-source order is not.
//! 2. **Account lanes** — items split by `account_id`; accounts process
//!    independently, subject only to the global cap.
//! 3. **Operation routing** — within an account, `download` items (compared
//!    case-insensitively) run through a serial lane one at a time in arrival
//!    order; everything else runs on the account's parallel lane.
//! 4. **Invocation** — the pre-observer fires, a global semaphore permit is
//!    acquired, the processor runs, and the success or error observer fires.
//!    With `continue_on_error` (the default) failures are swallowed after
//!    the error observer; otherwise the first failure stops the dispatcher.
//!
//! [`ReviewDispatcher::start`] returns the stream of successfully processed
//! items; [`ReviewDispatcher::start_async`] attaches a logging consumer and
//! returns a handle whose `stop` cancels upstream sources, lets in-flight
//! work finish, and resolves once the concurrency gate has drained.

mod engine;

use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{Partitioned, ReviewItem};
use crate::publisher::{GatedItem, GatedStream};
use crate::registry::ReviewHandlerRegistry;

use engine::EngineShared;

/// Side-effect hook observing an item (pre-processing or post-success).
pub type ItemObserver<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Side-effect hook observing a failed item and its error.
pub type ItemErrorObserver<T> = Arc<dyn Fn(&T, &PipelineError) + Send + Sync>;

/// Processes one item to completion. Typically an adapter over the handler
/// registry; tests substitute instrumented processors.
#[async_trait]
pub trait ItemProcessor<T>: Send + Sync {
    async fn process(&self, item: &T) -> PipelineResult<()>;
}

/// [`ItemProcessor`] dispatching through a [`ReviewHandlerRegistry`] by the
/// item's review type.
pub struct RegistryProcessor {
    registry: Arc<ReviewHandlerRegistry>,
}

impl RegistryProcessor {
    pub fn new(registry: Arc<ReviewHandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl<T> ItemProcessor<T> for RegistryProcessor
where
    T: ReviewItem + Send + Sync,
{
    async fn process(&self, item: &T) -> PipelineResult<()> {
        self.registry
            .dispatch(item.review_type(), item.payload(), item.client_id())
            .await
    }
}

/// Orchestrates merged sources into handler invocations.
pub struct ReviewDispatcher<T> {
    sources: Vec<GatedStream<T>>,
    processor: Arc<dyn ItemProcessor<T>>,
    max_concurrency: usize,
    continue_on_error: bool,
    lane_capacity: usize,
    pre_observer: Option<ItemObserver<T>>,
    success_observer: Option<ItemObserver<T>>,
    error_observer: Option<ItemErrorObserver<T>>,
}

impl<T> ReviewDispatcher<T>
where
    T: Partitioned + Send + Sync + 'static,
{
    pub fn builder(processor: Arc<dyn ItemProcessor<T>>) -> ReviewDispatcherBuilder<T> {
        ReviewDispatcherBuilder {
            sources: Vec::new(),
            processor,
            max_concurrency: 10,
            continue_on_error: true,
            lane_capacity: 32,
            pre_observer: None,
            success_observer: None,
            error_observer: None,
        }
    }

    /// Start processing and return the stream of successfully processed
    /// items. Dropping the stream cancels the dispatcher and its sources.
    pub fn start(self) -> ProcessedStream<T> {
        let (out_rx, cancel, engine) = self.launch();
        tokio::spawn(async move {
            if let Ok(Err(err)) = engine.await {
                error!(error = %err, "Fatal error in processing pipeline");
            }
        });
        ProcessedStream::new(out_rx, cancel)
    }

    /// Start processing in the background with a built-in logging consumer.
    pub fn start_async(self) -> DispatcherHandle {
        let (mut out_rx, cancel, engine) = self.launch();
        let consumer = tokio::spawn(async move {
            while let Some(item) = out_rx.recv().await {
                debug!(partition_key = %item.partition_key(), "Item processed");
            }
        });
        DispatcherHandle {
            cancel,
            engine,
            consumer,
        }
    }

    fn launch(
        self,
    ) -> (
        mpsc::Receiver<T>,
        CancellationToken,
        JoinHandle<PipelineResult<()>>,
    ) {
        let id = Uuid::new_v4();
        if self.sources.is_empty() {
            warn!(dispatcher_id = %id, "No sources configured");
        }
        info!(
            dispatcher_id = %id,
            sources = self.sources.len(),
            max_concurrency = self.max_concurrency,
            "Starting dispatcher"
        );

        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel(self.max_concurrency.max(1) * 2);
        let shared = Arc::new(EngineShared {
            id,
            processor: self.processor,
            semaphore: Arc::new(Semaphore::new(self.max_concurrency.max(1))),
            continue_on_error: self.continue_on_error,
            pre_observer: self.pre_observer,
            success_observer: self.success_observer,
            error_observer: self.error_observer,
            out_tx,
            cancel: cancel.clone(),
            failure: OnceLock::new(),
        });
        let engine = tokio::spawn(engine::run(self.sources, shared, self.lane_capacity));
        (out_rx, cancel, engine)
    }
}

/// Builder for [`ReviewDispatcher`].
pub struct ReviewDispatcherBuilder<T> {
    sources: Vec<GatedStream<T>>,
    processor: Arc<dyn ItemProcessor<T>>,
    max_concurrency: usize,
    continue_on_error: bool,
    lane_capacity: usize,
    pre_observer: Option<ItemObserver<T>>,
    success_observer: Option<ItemObserver<T>>,
    error_observer: Option<ItemErrorObserver<T>>,
}

impl<T> ReviewDispatcherBuilder<T>
where
    T: Partitioned + Send + Sync + 'static,
{
    /// Add an upstream source. May be called any number of times.
    pub fn source(mut self, stream: impl Stream<Item = GatedItem<T>> + Send + 'static) -> Self {
        self.sources.push(Box::pin(stream));
        self
    }

    /// Global cap on concurrently running handler invocations.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn pre_observer(mut self, observer: ItemObserver<T>) -> Self {
        self.pre_observer = Some(observer);
        self
    }

    pub fn success_observer(mut self, observer: ItemObserver<T>) -> Self {
        self.success_observer = Some(observer);
        self
    }

    pub fn error_observer(mut self, observer: ItemErrorObserver<T>) -> Self {
        self.error_observer = Some(observer);
        self
    }

    pub fn build(self) -> ReviewDispatcher<T> {
        ReviewDispatcher {
            sources: self.sources,
            processor: self.processor,
            max_concurrency: self.max_concurrency,
            continue_on_error: self.continue_on_error,
            lane_capacity: self.lane_capacity,
            pre_observer: self.pre_observer,
            success_observer: self.success_observer,
            error_observer: self.error_observer,
        }
    }
}

/// Stream of successfully processed items. Dropping it cancels the
/// dispatcher and, transitively, every upstream publisher.
#[derive(Debug)]
pub struct ProcessedStream<T> {
    inner: ReceiverStream<T>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl<T> ProcessedStream<T> {
    fn new(rx: mpsc::Receiver<T>, cancel: CancellationToken) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            inner: ReceiverStream::new(rx),
            cancel,
            _guard: guard,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T> Stream for ProcessedStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Handle to a dispatcher started with [`ReviewDispatcher::start_async`].
#[derive(Debug)]
pub struct DispatcherHandle {
    cancel: CancellationToken,
    engine: JoinHandle<PipelineResult<()>>,
    consumer: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Request cancellation without waiting for the drain.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the dispatcher and wait until in-flight work has finished and
    /// the concurrency gate has drained. Returns the fatal error if the
    /// dispatcher stopped itself on one.
    pub async fn stop(self) -> PipelineResult<()> {
        self.cancel.cancel();
        let result = match self.engine.await {
            Ok(result) => result,
            Err(join_error) => Err(PipelineError::Terminated(format!(
                "dispatcher task panicked: {join_error}"
            ))),
        };
        let _ = self.consumer.await;
        result
    }

    /// Wait for the dispatcher to finish on its own (all sources complete
    /// or a fatal error), without cancelling it.
    pub async fn join(self) -> PipelineResult<()> {
        let result = match self.engine.await {
            Ok(result) => result,
            Err(join_error) => Err(PipelineError::Terminated(format!(
                "dispatcher task panicked: {join_error}"
            ))),
        };
        let _ = self.consumer.await;
        result
    }
}
