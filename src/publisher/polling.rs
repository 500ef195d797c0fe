//! # Polling Publisher
//!
//! Polls a blocking fetch function at a fixed interval and emits the
//! results as a stream of partition-gated items.
//!
//! ## Stream semantics
//!
//! - Cold and restartable: every [`PollingPublisher::subscribe`] call starts
//!   its own polling loop; [`PollingPublisher::into_shared`] produces the hot
//!   variant that runs one loop and broadcasts to all subscribers.
//! - Ticks fire at `poll_interval`, starting immediately. A tick that lands
//!   while the previous fetch is still running is dropped, never queued.
//! - Each batch is observed, filtered, then grouped by partition key. A
//!   group whose lock cannot be acquired is dropped for the tick; the store
//!   re-serves its items on a later poll. An acquired group's items are
//!   emitted one at a time, each waiting for the previous item's completion,
//!   and the lock is released after the last item finishes downstream.
//! - Fetch errors are logged and forwarded to the error observer; polling
//!   resumes unless `continue_on_error` is false, in which case the stream
//!   ends.
//! - Dropping the subscription cancels the loop promptly. An in-flight
//!   fetch runs to completion on the blocking pool but its results are
//!   discarded, and all partition locks held by the loop are released.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::gated::{CompletionToken, GatedItem, PartitionedStream};
use super::DEFAULT_CHANNEL_CAPACITY;
use crate::error::{FetchResult, PipelineError};
use crate::models::Partitioned;
use crate::partition::{PartitionClaim, PartitionLockRegistry};

/// The blocking fetch invoked on every tick. Runs on the blocking worker
/// pool, so blocking I/O is expected.
pub type FetchFn<T> = Arc<dyn Fn() -> FetchResult<T> + Send + Sync>;

/// Side-effect hook invoked with each non-empty batch before filtering.
pub type BatchObserver<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

/// Predicate applied to each item before the partition gate.
pub type ItemFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Side-effect hook invoked with each publisher-level error.
pub type ErrorObserver = Arc<dyn Fn(&PipelineError) + Send + Sync>;

/// Publisher that polls a blocking data source at regular intervals and
/// emits items as a partition-gated stream.
#[derive(Builder)]
pub struct PollingPublisher<T> {
    /// Retrieves the next batch from the data source. Must be idempotent:
    /// unprocessed items may be returned again on later ticks.
    fetch: FetchFn<T>,
    /// Registry serializing items that share a partition key.
    lock_registry: Arc<PartitionLockRegistry>,
    /// Interval between polling attempts.
    #[builder(default = Duration::from_secs(5))]
    poll_interval: Duration,
    /// Whether to keep polling after a fetch error.
    #[builder(default = true)]
    continue_on_error: bool,
    /// Capacity of the channel feeding each subscriber.
    #[builder(default = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,
    /// Invoked with each non-empty batch, before filtering.
    batch_observer: Option<BatchObserver<T>>,
    /// Items failing the predicate are dropped before the gate.
    item_filter: Option<ItemFilter<T>>,
    /// Invoked with each fetch-level error.
    error_observer: Option<ErrorObserver>,
}

impl<T> PollingPublisher<T>
where
    T: Partitioned + Send + 'static,
{
    /// Start a new polling loop and return its stream. Each call is an
    /// independent subscription with its own loop and lifecycle.
    pub fn subscribe(&self) -> PartitionedStream<T> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = CancellationToken::new();
        let worker = PollWorker {
            id: Uuid::new_v4(),
            fetch: Arc::clone(&self.fetch),
            lock_registry: Arc::clone(&self.lock_registry),
            poll_interval: self.poll_interval,
            continue_on_error: self.continue_on_error,
            batch_observer: self.batch_observer.clone(),
            item_filter: self.item_filter.clone(),
            error_observer: self.error_observer.clone(),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run());
        PartitionedStream::new(rx, cancel)
    }

    /// Poll the source once and return a stream of that single gated batch.
    pub fn poll_once(&self) -> PartitionedStream<T> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let cancel = CancellationToken::new();
        let worker = PollWorker {
            id: Uuid::new_v4(),
            fetch: Arc::clone(&self.fetch),
            lock_registry: Arc::clone(&self.lock_registry),
            poll_interval: self.poll_interval,
            continue_on_error: self.continue_on_error,
            batch_observer: self.batch_observer.clone(),
            item_filter: self.item_filter.clone(),
            error_observer: self.error_observer.clone(),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run_once());
        PartitionedStream::new(rx, cancel)
    }
}

impl<T> PollingPublisher<T>
where
    T: Partitioned + Clone + Send + Sync + 'static,
{
    /// Convert into the hot variant: one polling loop shared by every
    /// subscriber, each receiving every gated item.
    pub fn into_shared(self) -> SharedPollingPublisher<T> {
        SharedPollingPublisher {
            inner: Arc::new(SharedInner {
                publisher: self,
                subscribers: Mutex::new(Vec::new()),
                running: Mutex::new(None),
            }),
        }
    }
}

enum TickOutcome {
    Continue,
    Stop,
}

/// One polling loop: the state behind a single cold subscription.
struct PollWorker<T> {
    id: Uuid,
    fetch: FetchFn<T>,
    lock_registry: Arc<PartitionLockRegistry>,
    poll_interval: Duration,
    continue_on_error: bool,
    batch_observer: Option<BatchObserver<T>>,
    item_filter: Option<ItemFilter<T>>,
    error_observer: Option<ErrorObserver>,
    tx: mpsc::Sender<GatedItem<T>>,
    cancel: CancellationToken,
}

impl<T> PollWorker<T>
where
    T: Partitioned + Send + 'static,
{
    async fn run(self) {
        info!(
            publisher_id = %self.id,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Polling publisher started"
        );
        let mut ticker = interval(self.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.tx.is_closed() {
                break;
            }
            if matches!(self.execute_tick().await, TickOutcome::Stop) {
                break;
            }
        }
        debug!(publisher_id = %self.id, "Polling publisher stopped");
    }

    async fn run_once(self) {
        let _ = self.execute_tick().await;
    }

    async fn execute_tick(&self) -> TickOutcome {
        let batch = match self.fetch_batch().await {
            Ok(Some(batch)) => batch,
            Ok(None) => return TickOutcome::Continue,
            Err(outcome) => return outcome,
        };

        // Observer and filter are user callbacks; contain a panic to this tick.
        let grouped = std::panic::catch_unwind(AssertUnwindSafe(|| self.prepare_batch(batch)));
        let groups = match grouped {
            Ok(groups) => groups,
            Err(_) => {
                return self
                    .handle_error(PipelineError::Fetch("batch callback panicked".to_string()))
            }
        };

        for (key, items) in groups {
            match self.lock_registry.try_claim(&key) {
                Some(claim) => {
                    let pump = GroupPump {
                        claim: Arc::new(claim),
                        items,
                        tx: self.tx.clone(),
                        cancel: self.cancel.clone(),
                    };
                    tokio::spawn(pump.run());
                }
                None => {
                    debug!(
                        publisher_id = %self.id,
                        partition_key = %key,
                        "Skipping partition - already in use"
                    );
                }
            }
        }
        TickOutcome::Continue
    }

    /// Run the blocking fetch. `Ok(None)` means an empty batch; an error
    /// has already been routed through the error policy.
    async fn fetch_batch(&self) -> Result<Option<Vec<T>>, TickOutcome> {
        let fetch = Arc::clone(&self.fetch);
        let started = Instant::now();
        let fetched = tokio::select! {
            // An in-flight fetch finishes on the blocking pool; its results
            // are discarded once the loop is cancelled.
            _ = self.cancel.cancelled() => return Err(TickOutcome::Stop),
            joined = tokio::task::spawn_blocking(move || fetch()) => joined,
        };
        self.note_dropped_ticks(started.elapsed());

        let batch = match fetched {
            Ok(Ok(batch)) => batch,
            Ok(Err(source)) => {
                return Err(self.handle_error(PipelineError::Fetch(source.to_string())))
            }
            Err(join_error) => {
                return Err(self.handle_error(PipelineError::Fetch(format!(
                    "fetch panicked: {join_error}"
                ))))
            }
        };
        if batch.is_empty() {
            debug!(publisher_id = %self.id, "Poll returned no items");
            return Ok(None);
        }
        debug!(publisher_id = %self.id, batch_size = batch.len(), "Polled batch");
        Ok(Some(batch))
    }

    fn prepare_batch(&self, batch: Vec<T>) -> Vec<(String, Vec<T>)> {
        if let Some(observer) = &self.batch_observer {
            observer(&batch);
        }
        let items: Vec<T> = match &self.item_filter {
            Some(filter) => batch.into_iter().filter(|item| filter(item)).collect(),
            None => batch,
        };
        group_by_partition(items)
    }

    fn note_dropped_ticks(&self, fetch_elapsed: Duration) {
        let dropped = fetch_elapsed.as_millis() / self.poll_interval.as_millis().max(1);
        if dropped > 0 {
            warn!(
                publisher_id = %self.id,
                dropped_ticks = dropped as u64,
                "Dropped polling ticks due to backpressure"
            );
        }
    }

    fn handle_error(&self, error: PipelineError) -> TickOutcome {
        error!(publisher_id = %self.id, error = %error, "Error during polling");
        if let Some(observer) = &self.error_observer {
            observer(&error);
        }
        if self.continue_on_error {
            TickOutcome::Continue
        } else {
            TickOutcome::Stop
        }
    }
}

/// Emits one gated group: items in source order, one at a time, each
/// waiting for the previous item's completion. The shared claim releases
/// the partition lock once the last item is done.
struct GroupPump<T> {
    claim: Arc<PartitionClaim>,
    items: Vec<T>,
    tx: mpsc::Sender<GatedItem<T>>,
    cancel: CancellationToken,
}

impl<T> GroupPump<T>
where
    T: Partitioned + Send + 'static,
{
    async fn run(self) {
        let GroupPump {
            claim,
            items,
            tx,
            cancel,
        } = self;
        for item in items {
            let (token, done) = CompletionToken::channel();
            let gated = GatedItem::tracked(item, Arc::clone(&claim), token);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = tx.send(gated) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            tokio::select! {
                _ = done => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

/// Group items by partition key, preserving first-seen key order and
/// source order within each group.
fn group_by_partition<T: Partitioned>(items: Vec<T>) -> Vec<(String, Vec<T>)> {
    use std::collections::hash_map::Entry;
    use std::collections::HashMap;

    let mut key_order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<T>> = HashMap::new();
    for item in items {
        match groups.entry(item.partition_key()) {
            Entry::Occupied(mut entry) => entry.get_mut().push(item),
            Entry::Vacant(entry) => {
                key_order.push(entry.key().clone());
                entry.insert(vec![item]);
            }
        }
    }
    key_order
        .into_iter()
        .filter_map(|key| groups.remove(&key).map(|group| (key, group)))
        .collect()
}

/// Hot variant of [`PollingPublisher`]: a single polling loop broadcasting
/// every gated item to every live subscriber. The loop starts with the
/// first subscriber and runs until [`SharedPollingPublisher::cancel`].
pub struct SharedPollingPublisher<T> {
    inner: Arc<SharedInner<T>>,
}

struct SharedInner<T> {
    publisher: PollingPublisher<T>,
    subscribers: Mutex<Vec<mpsc::Sender<GatedItem<T>>>>,
    running: Mutex<Option<CancellationToken>>,
}

impl<T> SharedInner<T> {
    /// Drop closed subscriber channels and return the live ones.
    fn live_subscribers(&self) -> Vec<mpsc::Sender<GatedItem<T>>> {
        let mut subscribers = lock_recovering(&self.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.clone()
    }
}

impl<T> Clone for SharedPollingPublisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SharedPollingPublisher<T>
where
    T: Partitioned + Clone + Send + Sync + 'static,
{
    /// Attach a subscriber. The shared loop starts on the first call; later
    /// subscribers receive items from the next tick onwards.
    pub fn subscribe(&self) -> PartitionedStream<T> {
        let (tx, rx) = mpsc::channel(self.inner.publisher.channel_capacity);
        lock_recovering(&self.inner.subscribers).push(tx);
        self.ensure_running();
        PartitionedStream::new(rx, CancellationToken::new())
    }

    /// Stop the shared loop. Existing subscribers see their streams end
    /// once in-flight groups complete.
    pub fn cancel(&self) {
        if let Some(token) = lock_recovering(&self.inner.running).take() {
            token.cancel();
        }
    }

    fn ensure_running(&self) {
        let mut running = lock_recovering(&self.inner.running);
        if running.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());
        tokio::spawn(shared_poll_loop(Arc::clone(&self.inner), token));
    }
}

async fn shared_poll_loop<T>(inner: Arc<SharedInner<T>>, cancel: CancellationToken)
where
    T: Partitioned + Clone + Send + Sync + 'static,
{
    let publisher = &inner.publisher;
    let id = Uuid::new_v4();
    info!(
        publisher_id = %id,
        interval_ms = publisher.poll_interval.as_millis() as u64,
        "Shared polling publisher started"
    );
    let mut ticker = interval(publisher.poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let subscribers = inner.live_subscribers();
        if subscribers.is_empty() {
            debug!(publisher_id = %id, "No live subscribers, skipping tick");
            continue;
        }

        let fetch = Arc::clone(&publisher.fetch);
        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            joined = tokio::task::spawn_blocking(move || fetch()) => joined,
        };
        let batch = match fetched {
            Ok(Ok(batch)) => batch,
            Ok(Err(source)) => {
                let error = PipelineError::Fetch(source.to_string());
                error!(publisher_id = %id, error = %error, "Error during polling");
                if let Some(observer) = &publisher.error_observer {
                    observer(&error);
                }
                if publisher.continue_on_error {
                    continue;
                }
                break;
            }
            Err(join_error) => {
                error!(publisher_id = %id, error = %join_error, "Fetch panicked");
                if publisher.continue_on_error {
                    continue;
                }
                break;
            }
        };
        if batch.is_empty() {
            continue;
        }
        // Observer and filter are user callbacks; contain a panic to this
        // tick, exactly as the cold loop does.
        let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| {
            if let Some(observer) = &publisher.batch_observer {
                observer(&batch);
            }
            let items: Vec<T> = match &publisher.item_filter {
                Some(filter) => batch.into_iter().filter(|item| filter(item)).collect(),
                None => batch,
            };
            group_by_partition(items)
        }));
        let groups = match prepared {
            Ok(groups) => groups,
            Err(_) => {
                let error = PipelineError::Fetch("batch callback panicked".to_string());
                error!(publisher_id = %id, error = %error, "Error during polling");
                if let Some(observer) = &publisher.error_observer {
                    observer(&error);
                }
                if publisher.continue_on_error {
                    continue;
                }
                break;
            }
        };

        for (key, items) in groups {
            match publisher.lock_registry.try_claim(&key) {
                Some(claim) => {
                    tokio::spawn(broadcast_group(
                        Arc::new(claim),
                        items,
                        subscribers.clone(),
                        cancel.clone(),
                    ));
                }
                None => {
                    debug!(
                        publisher_id = %id,
                        partition_key = %key,
                        "Skipping partition - already in use"
                    );
                }
            }
        }
    }
    debug!(publisher_id = %id, "Shared polling publisher stopped");
}

/// Broadcast one gated group to every subscriber, one item at a time; the
/// next item goes out only after every subscriber finished the previous one.
async fn broadcast_group<T>(
    claim: Arc<PartitionClaim>,
    items: Vec<T>,
    subscribers: Vec<mpsc::Sender<GatedItem<T>>>,
    cancel: CancellationToken,
) where
    T: Partitioned + Clone + Send + 'static,
{
    for item in items {
        let mut completions = Vec::with_capacity(subscribers.len());
        for tx in &subscribers {
            let (token, done) = CompletionToken::channel();
            let gated = GatedItem::tracked(item.clone(), Arc::clone(&claim), token);
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(gated) => {
                    if sent.is_ok() {
                        completions.push(done);
                    }
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = futures::future::join_all(completions) => {}
        }
    }
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
