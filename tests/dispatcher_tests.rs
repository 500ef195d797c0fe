//! Dispatcher routing, concurrency, and error semantics.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use common::{feed_message, wait_until, RecordingProcessor};
use review_pipeline_core::{
    FeedReviewMessage, GatedItem, ItemProcessor, PipelineError, RegistryProcessor,
    ReviewDispatcher, ReviewHandler, ReviewHandlerRegistry,
};

/// A pre-loaded source stream of untracked items.
fn source_of(items: Vec<FeedReviewMessage>) -> ReceiverStream<GatedItem<FeedReviewMessage>> {
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        tx.try_send(GatedItem::untracked(item))
            .expect("source channel should hold the whole fixture");
    }
    ReceiverStream::new(rx)
}

#[tokio::test]
async fn downloads_serialize_within_an_account_while_other_operations_run() {
    let processor = RecordingProcessor::new(Duration::from_millis(100));
    let items = vec![
        feed_message("client-1", "account-A", "download", "1"),
        feed_message("client-2", "account-A", "download", "2"),
        feed_message("client-3", "account-A", "update", "3"),
        feed_message("client-4", "account-A", "download", "4"),
    ];
    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(source_of(items))
        .max_concurrency(10)
        .build();

    dispatcher.start_async().join().await.expect("dispatch");

    // Downloads complete strictly in arrival order.
    let completed_downloads: Vec<String> = processor
        .completed_labels()
        .into_iter()
        .filter(|l| l != "3")
        .collect();
    assert_eq!(completed_downloads, ["1", "2", "4"]);

    // The update ran concurrently with the first download.
    let update_started = processor.started_at("3").expect("update started");
    let first_download_done = processor.completed_at("1").expect("download done");
    assert!(
        update_started < first_download_done,
        "update should not wait for the download lane"
    );

    // Each later download waits for the previous one to finish.
    assert!(processor.started_at("2").expect("2") >= processor.completed_at("1").expect("1"));
    assert!(processor.started_at("4").expect("4") >= processor.completed_at("2").expect("2"));
}

#[tokio::test]
async fn accounts_process_independently() {
    let processor = RecordingProcessor::new(Duration::from_millis(100));
    let items = vec![
        feed_message("client-1", "account-A", "download", "a"),
        feed_message("client-2", "account-B", "download", "b"),
    ];
    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(source_of(items))
        .max_concurrency(10)
        .build();

    dispatcher.start_async().join().await.expect("dispatch");

    // Both downloads overlapped: each started before the other finished.
    let a_started = processor.started_at("a").expect("a started");
    let b_started = processor.started_at("b").expect("b started");
    assert!(a_started < processor.completed_at("b").expect("b done"));
    assert!(b_started < processor.completed_at("a").expect("a done"));
}

#[tokio::test]
async fn unknown_review_type_reaches_the_error_observer_without_stopping() {
    let registry = Arc::new(
        ReviewHandlerRegistry::new(Vec::<Arc<dyn ReviewHandler>>::new()).expect("registry"),
    );
    let processor: Arc<dyn ItemProcessor<FeedReviewMessage>> =
        Arc::new(RegistryProcessor::new(registry));

    let mut item = feed_message("client-X", "account-A", "update", "x");
    item.review_type = "MISSING".to_string();

    let errors: Arc<Mutex<Vec<PipelineError>>> = Arc::new(Mutex::new(Vec::new()));
    let successes = Arc::new(AtomicUsize::new(0));
    let observed_errors = Arc::clone(&errors);
    let observed_successes = Arc::clone(&successes);

    let dispatcher = ReviewDispatcher::builder(processor)
        .source(source_of(vec![item]))
        .error_observer(Arc::new(move |_item, err| {
            observed_errors.lock().expect("errors lock").push(err.clone());
        }))
        .success_observer(Arc::new(move |_item| {
            observed_successes.fetch_add(1, Ordering::SeqCst);
        }))
        .build();

    // The default continue-on-error policy swallows the failure.
    dispatcher.start_async().join().await.expect("dispatch");

    let errors = errors.lock().expect("errors lock");
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0],
        PipelineError::UnknownReviewType("MISSING".to_string())
    );
    assert_eq!(successes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn global_concurrency_cap_is_never_exceeded() {
    let processor = RecordingProcessor::new(Duration::from_millis(30));
    let items: Vec<FeedReviewMessage> = (0..20)
        .map(|i| {
            feed_message(
                &format!("client-{i}"),
                &format!("account-{i}"),
                "update",
                &i.to_string(),
            )
        })
        .collect();
    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(source_of(items))
        .max_concurrency(3)
        .build();

    dispatcher.start_async().join().await.expect("dispatch");

    assert_eq!(processor.completed_labels().len(), 20);
    assert!(
        processor.max_in_flight() <= 3,
        "observed {} concurrent invocations with a cap of 3",
        processor.max_in_flight()
    );
    assert!(
        processor.max_in_flight() >= 2,
        "independent accounts should actually run in parallel"
    );
}

#[tokio::test]
async fn failure_stops_the_dispatcher_when_continue_on_error_is_off() {
    let processor = RecordingProcessor::failing_on(Duration::from_millis(10), &["poison"]);
    let items = vec![
        feed_message("client-1", "account-A", "update", "poison"),
        feed_message("client-2", "account-B", "update", "after"),
    ];
    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(source_of(items))
        .continue_on_error(false)
        .build();

    let result = dispatcher.start_async().join().await;
    assert!(matches!(result, Err(PipelineError::Handler(_))));
}

#[tokio::test]
async fn start_emits_only_successfully_processed_items() {
    let processor = RecordingProcessor::failing_on(Duration::from_millis(5), &["bad"]);
    let items = vec![
        feed_message("client-1", "account-A", "update", "good-1"),
        feed_message("client-2", "account-A", "update", "bad"),
        feed_message("client-3", "account-B", "update", "good-2"),
    ];
    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(source_of(items))
        .build();

    let mut labels: Vec<String> = dispatcher
        .start()
        .map(|item| item.payload.clone())
        .collect()
        .await;
    labels.sort();
    assert_eq!(labels, ["good-1", "good-2"]);
}

#[tokio::test]
async fn pre_observer_fires_before_processing() {
    let processor = RecordingProcessor::new(Duration::from_millis(5));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_observer = Arc::clone(&seen);

    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(source_of(vec![feed_message(
            "client-1",
            "account-A",
            "update",
            "only",
        )]))
        .pre_observer(Arc::new(move |item: &FeedReviewMessage| {
            seen_by_observer
                .lock()
                .expect("seen lock")
                .push(item.payload.clone());
        }))
        .build();

    dispatcher.start_async().join().await.expect("dispatch");
    assert_eq!(*seen.lock().expect("seen lock"), ["only"]);
}

#[tokio::test]
async fn panicking_pre_observer_fails_only_that_item() {
    let processor = RecordingProcessor::new(Duration::from_millis(5));
    let items = vec![
        feed_message("client-1", "account-A", "update", "boom"),
        feed_message("client-2", "account-B", "update", "fine"),
    ];
    let errors = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&errors);

    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(source_of(items))
        .pre_observer(Arc::new(|item: &FeedReviewMessage| {
            if item.payload == "boom" {
                panic!("observer exploded");
            }
        }))
        .error_observer(Arc::new(move |_item, _err| {
            observed.fetch_add(1, Ordering::SeqCst);
        }))
        .build();

    // With the default continue-on-error policy the dispatcher keeps going.
    dispatcher.start_async().join().await.expect("dispatch");

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    let completed = processor.completed_labels();
    assert!(completed.contains(&"fine".to_string()));
    assert!(
        !completed.contains(&"boom".to_string()),
        "the item whose observer panicked must not reach the handler"
    );
}

#[tokio::test]
async fn stop_drains_in_flight_work_and_skips_queued_items() {
    let processor = RecordingProcessor::new(Duration::from_millis(200));
    let (tx, rx) = mpsc::channel(4);
    // Two downloads on one account: the second queues behind the first.
    tx.try_send(GatedItem::untracked(feed_message(
        "client-1",
        "account-A",
        "download",
        "first",
    )))
    .expect("send");
    tx.try_send(GatedItem::untracked(feed_message(
        "client-2",
        "account-A",
        "download",
        "second",
    )))
    .expect("send");

    let dispatcher = ReviewDispatcher::builder(processor.as_processor())
        .source(ReceiverStream::new(rx))
        .build();
    let handle = dispatcher.start_async();

    // Wait until the first item is actually running, then stop.
    assert!(
        wait_until(
            || processor.started_labels().contains(&"first".to_string()),
            Duration::from_secs(2),
        )
        .await
    );
    handle.stop().await.expect("stop");

    assert!(processor.completed_labels().contains(&"first".to_string()));
    assert!(
        !processor.started_labels().contains(&"second".to_string()),
        "queued item must not be dequeued after cancellation"
    );
    drop(tx);
}
