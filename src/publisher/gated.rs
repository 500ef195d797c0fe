use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::partition::PartitionClaim;

/// A boxed stream of gated items, the shape every publisher produces and
/// the dispatcher consumes.
pub type GatedStream<T> = Pin<Box<dyn Stream<Item = GatedItem<T>> + Send>>;

/// Fires its signal when dropped, so completion reaches the publisher on
/// every path: handler success, handler failure, and cancellation.
#[derive(Debug)]
pub(crate) struct CompletionToken {
    tx: Option<oneshot::Sender<()>>,
}

impl CompletionToken {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A work item that has cleared the partition gate.
///
/// The claim is shared by every item of the same gated group; the partition
/// lock is released when the last of them is dropped. Dropping an item also
/// signals completion back to the publisher so it can emit the next item of
/// the group.
#[derive(Debug)]
pub struct GatedItem<T> {
    item: T,
    claim: Option<Arc<PartitionClaim>>,
    completion: Option<CompletionToken>,
}

impl<T> GatedItem<T> {
    /// Wrap an item with no partition claim. Used by tests and by callers
    /// feeding a dispatcher directly, bypassing the gate.
    pub fn untracked(item: T) -> Self {
        Self {
            item,
            claim: None,
            completion: None,
        }
    }

    pub(crate) fn claimed(item: T, claim: Arc<PartitionClaim>) -> Self {
        Self {
            item,
            claim: Some(claim),
            completion: None,
        }
    }

    pub(crate) fn tracked(item: T, claim: Arc<PartitionClaim>, completion: CompletionToken) -> Self {
        Self {
            item,
            claim: Some(claim),
            completion: Some(completion),
        }
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    /// Unwrap the item, releasing the claim share and firing the completion
    /// signal. Call only once processing has finished.
    pub fn into_inner(self) -> T {
        self.item
    }
}

/// Stream of gated items backed by a publisher loop. Dropping the stream
/// cancels the loop, which releases any partition locks it still holds.
#[derive(Debug)]
pub struct PartitionedStream<T> {
    inner: ReceiverStream<GatedItem<T>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl<T> PartitionedStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<GatedItem<T>>, cancel: CancellationToken) -> Self {
        let guard = cancel.clone().drop_guard();
        Self {
            inner: ReceiverStream::new(rx),
            cancel,
            _guard: guard,
        }
    }

    /// Cancel the producing loop without dropping the stream; buffered
    /// items can still be drained.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn boxed(self) -> GatedStream<T>
    where
        T: Send + 'static,
    {
        Box::pin(self)
    }
}

impl<T> Stream for PartitionedStream<T> {
    type Item = GatedItem<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}
