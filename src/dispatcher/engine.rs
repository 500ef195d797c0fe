//! Dispatch engine: the merge loop, per-account lanes, and handler
//! invocation under the global concurrency gate.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::{stream, FutureExt, StreamExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::Partitioned;
use crate::publisher::{GatedItem, GatedStream};

use super::{ItemErrorObserver, ItemObserver, ItemProcessor};

/// State shared by the merge loop and every lane runner.
pub(super) struct EngineShared<T> {
    pub(super) id: Uuid,
    pub(super) processor: Arc<dyn ItemProcessor<T>>,
    pub(super) semaphore: Arc<Semaphore>,
    pub(super) continue_on_error: bool,
    pub(super) pre_observer: Option<ItemObserver<T>>,
    pub(super) success_observer: Option<ItemObserver<T>>,
    pub(super) error_observer: Option<ItemErrorObserver<T>>,
    pub(super) out_tx: mpsc::Sender<T>,
    pub(super) cancel: CancellationToken,
    pub(super) failure: OnceLock<PipelineError>,
}

/// Senders feeding one account's two lanes.
struct AccountLane<T> {
    download_tx: mpsc::Sender<GatedItem<T>>,
    parallel_tx: mpsc::Sender<GatedItem<T>>,
}

impl<T> AccountLane<T>
where
    T: Partitioned + Send + Sync + 'static,
{
    fn open(
        account_id: String,
        shared: &Arc<EngineShared<T>>,
        capacity: usize,
        tasks: &mut JoinSet<()>,
    ) -> Self {
        debug!(
            dispatcher_id = %shared.id,
            account_id = %account_id,
            "Opening account lane"
        );
        let (download_tx, download_rx) = mpsc::channel(capacity);
        let (parallel_tx, parallel_rx) = mpsc::channel(capacity);
        tasks.spawn(run_download_lane(
            account_id.clone(),
            download_rx,
            Arc::clone(shared),
        ));
        tasks.spawn(run_parallel_lane(account_id, parallel_rx, Arc::clone(shared)));
        Self {
            download_tx,
            parallel_tx,
        }
    }
}

/// Merge all sources, route each item to its account lane, and on shutdown
/// drain every lane before reporting the outcome.
pub(super) async fn run<T>(
    sources: Vec<GatedStream<T>>,
    shared: Arc<EngineShared<T>>,
    lane_capacity: usize,
) -> Result<(), PipelineError>
where
    T: Partitioned + Send + Sync + 'static,
{
    let mut merged = stream::select_all(sources);
    let mut lanes: HashMap<String, AccountLane<T>> = HashMap::new();
    let mut lane_tasks: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = merged.next() => {
                let Some(gated) = next else { break };
                if let Some(pre) = &shared.pre_observer {
                    // A panicking observer fails this item, not the engine.
                    if let Err(err) = run_observer(pre, gated.item(), "pre") {
                        shared.handle_failure(&gated, err);
                        continue;
                    }
                }
                debug!(
                    dispatcher_id = %shared.id,
                    partition_key = %gated.item().partition_key(),
                    "Received item"
                );

                let account_id = gated.item().account_id().to_string();
                let lane = lanes.entry(account_id).or_insert_with_key(|account| {
                    AccountLane::open(account.clone(), &shared, lane_capacity, &mut lane_tasks)
                });
                let sender = if gated.item().is_download() {
                    &lane.download_tx
                } else {
                    &lane.parallel_tx
                };
                if sender.send(gated).await.is_err() {
                    // Lanes only close while shutting down.
                    break;
                }
            }
        }
    }

    // Cancelling upstream: dropping the merged streams cancels the
    // publisher loops, which release the locks they still hold.
    drop(merged);
    // Close lane channels; runners finish in-flight work and exit.
    drop(lanes);
    while lane_tasks.join_next().await.is_some() {}

    debug!(dispatcher_id = %shared.id, "Dispatcher stopped");
    match shared.failure.get() {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

/// Serial lane: downloads for one account, one at a time, arrival order.
async fn run_download_lane<T>(
    account_id: String,
    mut rx: mpsc::Receiver<GatedItem<T>>,
    shared: Arc<EngineShared<T>>,
) where
    T: Partitioned + Send + Sync + 'static,
{
    loop {
        let gated = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(gated) => gated,
                None => break,
            },
        };
        let permit = tokio::select! {
            // Queued item dropped on cancellation: no handler call, the
            // permit is never taken, and the partition claim is released.
            biased;
            _ = shared.cancel.cancelled() => break,
            acquired = Arc::clone(&shared.semaphore).acquire_owned() => match acquired {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        shared.process_one(gated, permit).await;
    }
    debug!(account_id = %account_id, "Download lane stopped");
}

/// Parallel lane: everything else for one account, bounded only by the
/// global semaphore.
async fn run_parallel_lane<T>(
    account_id: String,
    mut rx: mpsc::Receiver<GatedItem<T>>,
    shared: Arc<EngineShared<T>>,
) where
    T: Partitioned + Send + Sync + 'static,
{
    let mut running: JoinSet<()> = JoinSet::new();
    'receive: loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break 'receive,
            Some(_) = running.join_next(), if !running.is_empty() => {}
            next = rx.recv() => {
                let Some(gated) = next else { break 'receive };
                let permit = tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break 'receive,
                    acquired = Arc::clone(&shared.semaphore).acquire_owned() => match acquired {
                        Ok(permit) => permit,
                        Err(_) => break 'receive,
                    },
                };
                let worker = Arc::clone(&shared);
                running.spawn(async move {
                    worker.process_one(gated, permit).await;
                });
            }
        }
    }
    // Items past the permit finish before the lane reports stopped.
    while running.join_next().await.is_some() {}
    debug!(account_id = %account_id, "Parallel lane stopped");
}

impl<T> EngineShared<T>
where
    T: Partitioned + Send + Sync + 'static,
{
    /// Run the processor for one item. The permit, the partition claim, and
    /// the completion signal are all released on every path out.
    async fn process_one(&self, gated: GatedItem<T>, permit: OwnedSemaphorePermit) {
        let _permit = permit;
        let outcome = AssertUnwindSafe(self.processor.process(gated.item()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                debug!(
                    dispatcher_id = %self.id,
                    partition_key = %gated.item().partition_key(),
                    "Successfully processed item"
                );
                if let Some(observer) = &self.success_observer {
                    if let Err(err) = run_observer(observer, gated.item(), "success") {
                        self.handle_failure(&gated, err);
                        return;
                    }
                }
                let item = gated.into_inner();
                if self.out_tx.send(item).await.is_err() {
                    // The output consumer went away; stop pulling new work.
                    self.cancel.cancel();
                }
            }
            Ok(Err(err)) => {
                self.handle_failure(&gated, err);
            }
            Err(_) => {
                self.handle_failure(&gated, PipelineError::Handler("handler panicked".to_string()));
            }
        }
    }

    fn handle_failure(&self, gated: &GatedItem<T>, err: PipelineError) {
        error!(
            dispatcher_id = %self.id,
            partition_key = %gated.item().partition_key(),
            error = %err,
            "Failed to process item"
        );
        if let Some(observer) = &self.error_observer {
            let observed =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer(gated.item(), &err)));
            if observed.is_err() {
                error!(
                    dispatcher_id = %self.id,
                    partition_key = %gated.item().partition_key(),
                    "Error observer panicked"
                );
            }
        }
        if !self.continue_on_error {
            let _ = self.failure.set(err);
            self.cancel.cancel();
        }
    }
}

/// Run a user observer, converting a panic into a per-item handler error.
fn run_observer<T>(
    observer: &ItemObserver<T>,
    item: &T,
    stage: &str,
) -> Result<(), PipelineError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| observer(item)))
        .map_err(|_| PipelineError::Handler(format!("{stage} observer panicked")))
}
