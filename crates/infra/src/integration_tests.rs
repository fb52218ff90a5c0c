//! Integration tests for the full indexing pipeline.
//!
//! Publisher → broker queue → Consumer → JobHandler → index | RetryScheduler
//!
//! Verifies:
//! - Found records are indexed and acked; missing records are acked only
//! - Failed jobs are republished with attempts + 1 until the budget runs out
//! - Prefetch bounds the unsettled deliveries
//! - The consumer comes back after the broker drops its channel

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use newsflow_core::{ATTEMPTS_HEADER, IndexDocument, Job, Record, RecordId};
use newsflow_events::{
    BrokerConnection, BrokerError, ConnectionSettings, InMemoryBroker, OutgoingMessage, Publisher,
    RetryPolicy,
};

use crate::jobs::{Consumer, ConsumerSettings, JobHandler, RetryScheduler};
use crate::record_store::InMemoryRecordStore;
use crate::search::{InMemorySearchIndex, IndexEnsurer, IndexSchema, SearchIndex};

const QUEUE: &str = "news.index";
const INDEX: &str = "news";

struct Pipeline {
    broker: InMemoryBroker,
    store: Arc<InMemoryRecordStore>,
    index: Arc<InMemorySearchIndex>,
    publisher: Publisher,
    consumer: Consumer,
}

fn pipeline(max_attempts: u32, prefetch: usize) -> Pipeline {
    pipeline_with_connect_budget(max_attempts, prefetch, 5)
}

fn pipeline_with_connect_budget(
    max_attempts: u32,
    prefetch: usize,
    connect_attempts: u32,
) -> Pipeline {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryRecordStore::new());
    let index = Arc::new(InMemorySearchIndex::new());

    let connection = BrokerConnection::new(
        Arc::new(broker.clone()),
        ConnectionSettings {
            queue: QUEUE.to_string(),
            retry: RetryPolicy::linear(connect_attempts, Duration::from_millis(2000)),
        },
    );
    let publisher = Publisher::new(connection.clone());
    let handler = JobHandler::new(store.clone(), index.clone(), INDEX);
    let retry = RetryScheduler::new(
        publisher.clone(),
        RetryPolicy::linear(max_attempts, Duration::from_millis(2000)),
    );
    let ensurer = IndexEnsurer::new(index.clone(), INDEX, IndexSchema::news());
    let consumer = Consumer::new(
        connection,
        handler,
        retry,
        Some(ensurer),
        ConsumerSettings {
            prefetch,
            restart_delay: Duration::from_millis(1000),
        },
    );

    Pipeline {
        broker,
        store,
        index,
        publisher,
        consumer,
    }
}

fn record(id: i64) -> Record {
    Record {
        id: RecordId::new(id),
        title: format!("Headline {id}"),
        content: "Markets were calm.".to_string(),
        author: "J. Doe".to_string(),
        source: "wire".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    }
}

/// Poll `check` on virtual time until it holds.
async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..5000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn attempts_headers(broker: &InMemoryBroker) -> Vec<Option<String>> {
    broker
        .published(QUEUE)
        .iter()
        .map(|m| m.header(ATTEMPTS_HEADER).map(str::to_string))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn existing_record_is_indexed_and_acked() {
    let p = pipeline(3, 1);
    p.store.put(record(42));
    p.consumer.start().await.unwrap();

    p.publisher.publish_job(&Job::new(RecordId::new(42))).await.unwrap();

    eventually("document 42", || p.index.document(INDEX, "42").is_some()).await;
    eventually("ack", || p.broker.acked().len() == 1).await;

    let doc = p.index.document(INDEX, "42").unwrap();
    assert_eq!(doc.title, "Headline 42");
    assert_eq!(p.broker.unacked_count(), 0);
    assert_eq!(p.consumer.stats().indexed, 1);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn absent_record_is_acked_without_retry() {
    let p = pipeline(3, 1);
    p.consumer.start().await.unwrap();

    p.publisher.publish_job(&Job::new(RecordId::new(99))).await.unwrap();

    eventually("ack", || p.broker.acked().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(p.index.document_count(INDEX), 0);
    assert_eq!(attempts_headers(&p.broker), vec![None]);
    assert!(p.broker.dead_letters().is_empty());
    assert_eq!(p.consumer.stats().skipped, 1);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_then_succeed() {
    let p = pipeline(3, 1);
    p.store.put(record(42));
    p.index.fail_next_writes(2);
    p.consumer.start().await.unwrap();

    p.publisher.publish_job(&Job::new(RecordId::new(42))).await.unwrap();

    eventually("document 42", || p.index.document(INDEX, "42").is_some()).await;
    eventually("three acks", || p.broker.acked().len() == 3).await;

    assert_eq!(
        attempts_headers(&p.broker),
        vec![None, Some("1".to_string()), Some("2".to_string())]
    );
    assert!(p.broker.dead_letters().is_empty());
    assert_eq!(p.broker.unacked_count(), 0);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_is_discarded_after_budget() {
    let p = pipeline(3, 1);
    p.store.put(record(42));
    p.index.fail_next_writes(u32::MAX);
    p.consumer.start().await.unwrap();

    p.publisher.publish_job(&Job::new(RecordId::new(42))).await.unwrap();

    eventually("dead letter", || p.broker.dead_letters().len() == 1).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(
        attempts_headers(&p.broker),
        vec![None, Some("1".to_string()), Some("2".to_string())]
    );
    assert_eq!(p.broker.acked().len(), 2);
    assert_eq!(p.broker.dead_letters()[0].headers.get(ATTEMPTS_HEADER).map(String::as_str), Some("2"));
    assert_eq!(p.index.document_count(INDEX), 0);
    let stats = p.consumer.stats();
    assert_eq!((stats.requeued, stats.discarded), (2, 1));
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn retry_waits_grow_linearly() {
    let p = pipeline(3, 1);
    p.store.put(record(1));
    p.index.fail_next_writes(2);
    p.consumer.start().await.unwrap();

    let started = tokio::time::Instant::now();
    p.publisher.publish_job(&Job::new(RecordId::new(1))).await.unwrap();
    eventually("document 1", || p.index.document(INDEX, "1").is_some()).await;

    // 2000ms before the first retry, 4000ms before the second.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(6000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(7000), "{elapsed:?}");
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_discarded() {
    let p = pipeline(3, 1);
    p.consumer.start().await.unwrap();

    p.broker
        .push(QUEUE, OutgoingMessage::persistent(br#"{"newsId":1}"#.to_vec()));

    eventually("dead letter", || p.broker.dead_letters().len() == 1).await;
    assert_eq!(p.broker.dead_letters()[0].reason, "malformed payload");
    assert_eq!(attempts_headers(&p.broker).len(), 1);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn prefetch_bounds_unsettled_deliveries() {
    let p = pipeline(3, 2);
    for id in 1..=5 {
        p.store.put(record(id));
    }
    p.index.fail_next_writes(u32::MAX);
    p.consumer.start().await.unwrap();

    for id in 1..=5 {
        p.publisher.publish_job(&Job::new(RecordId::new(id))).await.unwrap();
    }

    eventually("two in flight", || p.broker.unacked_count() == 2).await;
    // Both handlers now sit in their retry delay holding the permits.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(p.broker.unacked_count(), 2);
    assert_eq!(p.broker.ready_count(QUEUE), 3);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn consumer_restarts_after_broker_drops_channel() {
    let p = pipeline(3, 1);
    p.store.put(record(7));
    p.consumer.start().await.unwrap();
    assert_eq!(p.broker.open_attempts(), 1);

    p.broker.drop_connections("broker restarted");
    eventually("restart scheduled", || p.consumer.restart_pending()).await;
    eventually("reconnect", || p.broker.open_attempts() == 2).await;
    eventually("restart finished", || !p.consumer.restart_pending()).await;

    p.publisher.publish_job(&Job::new(RecordId::new(7))).await.unwrap();
    eventually("document 7", || p.index.document(INDEX, "7").is_some()).await;
    assert_eq!(p.consumer.stats().restarts, 1);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unacked_delivery_is_redelivered_after_channel_loss() {
    let p = pipeline(3, 1);
    p.store.put(record(3));
    p.index.fail_next_writes(1);
    p.consumer.start().await.unwrap();

    p.publisher.publish_job(&Job::new(RecordId::new(3))).await.unwrap();
    // The first attempt failed and is waiting out its retry delay.
    eventually("in flight", || p.broker.unacked_count() == 1).await;
    p.broker.drop_connections("broker restarted");

    eventually("document 3", || p.index.document(INDEX, "3").is_some()).await;
    assert_eq!(p.index.document_count(INDEX), 1);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_declare_at_startup_does_not_restart_healthy_consumer() {
    let p = pipeline(3, 1);
    p.store.put(record(11));
    p.broker.fail_next_declares(1);

    p.consumer.start().await.unwrap();
    assert_eq!(p.broker.open_attempts(), 2);
    assert!(!p.consumer.restart_pending());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(p.consumer.stats().restarts, 0);
    assert!(!p.consumer.restart_pending());

    p.publisher.publish_job(&Job::new(RecordId::new(11))).await.unwrap();
    eventually("document 11", || p.index.document(INDEX, "11").is_some()).await;
    eventually("ack", || p.broker.acked().len() == 1).await;
    assert_eq!(p.broker.unacked_count(), 0);
    p.consumer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnect_is_fatal() {
    let p = pipeline_with_connect_budget(3, 1, 2);
    p.consumer.start().await.unwrap();

    p.broker.fail_next_opens(10);
    p.broker.drop_connections("broker gone");

    let err = tokio::time::timeout(Duration::from_secs(60), p.consumer.fatal_error())
        .await
        .unwrap();
    assert!(matches!(err, BrokerError::ConnectionExhausted { attempts: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_in_flight_jobs() {
    let p = pipeline(3, 1);
    p.store.put(record(5));
    p.index.fail_next_writes(1);
    p.consumer.start().await.unwrap();

    p.publisher.publish_job(&Job::new(RecordId::new(5))).await.unwrap();
    eventually("in flight", || p.broker.unacked_count() == 1).await;

    p.consumer.shutdown().await;

    // The retry finished (republish + ack) before shutdown returned.
    assert_eq!(p.broker.unacked_count(), 0);
    assert_eq!(p.broker.acked().len(), 1);
    assert_eq!(attempts_headers(&p.broker), vec![None, Some("1".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn start_provisions_the_index() {
    let p = pipeline(3, 1);
    p.consumer.start().await.unwrap();

    assert!(p.index.index_exists(INDEX).await.unwrap());
    assert_eq!(p.index.schema(INDEX), Some(IndexSchema::news()));
    p.consumer.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn replaying_a_job_converges_to_one_document(
        id in 1i64..10_000,
        title in "[A-Za-z ]{1,40}",
        replays in 1usize..6,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let store = Arc::new(InMemoryRecordStore::new());
            let index = Arc::new(InMemorySearchIndex::new());
            index.create_index(INDEX, &IndexSchema::news()).await.unwrap();
            let mut rec = record(id);
            rec.title = title;
            store.put(rec.clone());

            let handler = JobHandler::new(store, index.clone(), INDEX);
            for attempts in 0..replays {
                handler
                    .handle(&Job::with_attempts(rec.id, attempts as u32))
                    .await
                    .unwrap();
            }

            let expected = IndexDocument::from_record(&rec);
            prop_assert_eq!(index.document_count(INDEX), 1);
            prop_assert_eq!(index.document(INDEX, &expected.id), Some(expected.fields));
            Ok(())
        })?;
    }

    #[test]
    fn retry_delay_is_base_times_attempt(base_ms in 1u64..10_000, attempt in 1u32..50) {
        let policy = RetryPolicy::linear(attempt + 1, Duration::from_millis(base_ms));
        prop_assert_eq!(
            policy.delay_for_attempt(attempt),
            Duration::from_millis(base_ms * u64::from(attempt))
        );
        prop_assert!(policy.should_retry(attempt));
        prop_assert!(!policy.should_retry(attempt + 1));
    }
}
