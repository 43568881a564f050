//! Integration tests for the orchestrator, queue and scheduler.
//!
//! Collaborators are stubs; the store is a real libSQL database, in memory or
//! in a temp file shared by two backends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use uuid::Uuid;

use feedflow::config::{RetryPolicy, SchedulerConfig};
use feedflow::error::{FetchError, SchedulerError};
use feedflow::ingest::{FetchOutcome, Fetcher, FollowUp};
use feedflow::orchestrator::Orchestrator;
use feedflow::queue::{
    Disposition, ProcessOutcome, Processor, QueueName, WorkQueue, WorkStatus, WorkerLoop,
};
use feedflow::scheduler::{NewSource, SchedulerState, Source};
use feedflow::store::{Database, LibSqlBackend};

/// Maximum time any wait in these tests may take before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Emits one new summarize item per fetch, named after the source and a counter.
struct CountingFetcher {
    fetches: AtomicU32,
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome, FetchError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(FetchOutcome {
            new_items: 1,
            follow_ups: vec![FollowUp::new(
                QueueName::SUMMARIZE,
                format!("{}/article-{n}", source.url),
            )],
        })
    }
}

/// Fails the first attempt on every payload, succeeds afterwards.
struct FlakyProcessor {
    seen: Mutex<HashSet<String>>,
}

#[async_trait]
impl Processor for FlakyProcessor {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn process(&self, payload_ref: &str) -> ProcessOutcome {
        if self.seen.lock().unwrap().insert(payload_ref.to_string()) {
            ProcessOutcome::Retryable("first attempt always fails".into())
        } else {
            ProcessOutcome::Success(Some(format!("summary of {payload_ref}")))
        }
    }
}

struct AlwaysOk;

/// Counts calls and never succeeds.
struct AlwaysDown {
    calls: AtomicU32,
}

#[async_trait]
impl Processor for AlwaysDown {
    fn name(&self) -> &str {
        "down"
    }

    async fn process(&self, _payload_ref: &str) -> ProcessOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ProcessOutcome::Retryable("endpoint down".into())
    }
}

#[async_trait]
impl Processor for AlwaysOk {
    fn name(&self) -> &str {
        "ok"
    }

    async fn process(&self, _payload_ref: &str) -> ProcessOutcome {
        ProcessOutcome::Success(None)
    }
}

fn fast_scheduler() -> SchedulerConfig {
    SchedulerConfig {
        max_fetch_workers: 2,
        tick: Duration::from_millis(10),
        eval_every_ticks: 2,
        maintenance_time: NaiveTime::MIN,
        maintenance_retry: Duration::ZERO,
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        backoff: Duration::from_millis(5),
        idle_poll: Duration::from_millis(10),
        process_timeout: Duration::from_secs(1),
        stale_after: None,
    }
}

/// Short attempts so the stale window (twice attempt plus backoff) is 50ms.
fn stale_policy() -> RetryPolicy {
    RetryPolicy {
        process_timeout: Duration::from_millis(20),
        stale_after: Some(Duration::from_millis(50)),
        ..fast_policy()
    }
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn sources_flow_through_to_completed_work() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let fetcher = Arc::new(CountingFetcher {
        fetches: AtomicU32::new(0),
    });
    let orchestrator = Orchestrator::new(Arc::clone(&db), fast_scheduler(), fetcher.clone())
        .with_worker(
            QueueName::SUMMARIZE,
            Arc::new(FlakyProcessor {
                seen: Mutex::new(HashSet::new()),
            }),
            fast_policy(),
        );

    for name in ["alpha", "beta", "gamma"] {
        orchestrator
            .add_source(&NewSource::new(name, format!("https://{name}.example/rss")))
            .await
            .unwrap();
    }

    orchestrator.start().await;
    assert_eq!(orchestrator.scheduler_state().await, SchedulerState::Running);

    let queue = orchestrator.queue(QueueName::SUMMARIZE);
    wait_until(|| {
        let queue = queue.clone();
        async move { queue.stats().await.unwrap().completed == 3 }
    })
    .await;

    orchestrator.shutdown().await;
    assert_eq!(orchestrator.scheduler_state().await, SchedulerState::Stopped);

    // Every source fetched exactly once: the 60-minute interval has not elapsed.
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 3);
    for source in orchestrator.sources().await.unwrap() {
        assert!(source.last_fetch_time.is_some(), "{} never fetched", source.name);
    }

    let stats = orchestrator.stats().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].1.completed, 3);
    assert_eq!(stats[0].1.total(), 3);

    for id in 1..=3 {
        let item = queue.get(id).await.unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Completed);
        assert_eq!(item.retry_count, 1);
        assert!(item.result.unwrap().starts_with("summary of https://"));
    }
}

#[tokio::test]
async fn operator_surface() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let fetcher = Arc::new(CountingFetcher {
        fetches: AtomicU32::new(0),
    });
    let orchestrator = Orchestrator::new(Arc::clone(&db), fast_scheduler(), fetcher.clone());

    let source = orchestrator
        .add_source(&NewSource::new("paused", "https://paused.example/rss").inactive())
        .await
        .unwrap();

    // Manual trigger ignores the active flag.
    assert!(orchestrator.trigger_now(source.id).await.unwrap());
    orchestrator.stop_scheduler().await;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    assert!(!db.get_source(source.id).await.unwrap().unwrap().is_active);

    orchestrator.activate(source.id).await.unwrap();
    orchestrator.stop_scheduler().await;
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
    assert!(db.get_source(source.id).await.unwrap().unwrap().is_active);

    orchestrator.deactivate(source.id).await.unwrap();
    assert!(!db.get_source(source.id).await.unwrap().unwrap().is_active);

    assert!(matches!(
        orchestrator.trigger_now(999).await,
        Err(SchedulerError::SourceNotFound { id: 999 })
    ));

    // Both fetches enqueued their follow-up.
    let queue = orchestrator.queue(QueueName::SUMMARIZE);
    assert_eq!(queue.stats().await.unwrap().pending, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claims_are_exclusive_across_backends_on_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let first: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let second: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());

    let total = 12;
    for i in 0..total {
        first
            .enqueue_work(&QueueName::ANALYZE_IMAGE, &format!("/images/{i}.jpg"))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for backend in [&first, &second] {
        for _ in 0..3 {
            let queue = WorkQueue::new(Arc::clone(backend), QueueName::ANALYZE_IMAGE);
            handles.push(tokio::spawn(async move {
                let worker = Uuid::new_v4();
                let mut claimed = Vec::new();
                while let Some(item) = queue.claim_next(worker, None).await {
                    claimed.push(item.id);
                }
                claimed
            }));
        }
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "item {id} claimed twice");
        }
    }

    // Anything left behind by a lock timeout is still claimable, once.
    let queue = WorkQueue::new(Arc::clone(&second), QueueName::ANALYZE_IMAGE);
    while let Some(item) = queue.claim_next(Uuid::new_v4(), None).await {
        assert!(seen.insert(item.id), "item {} claimed twice", item.id);
    }
    assert_eq!(seen.len(), total);

    let stats = first.work_stats(&QueueName::ANALYZE_IMAGE).await.unwrap();
    assert_eq!(stats.processing, total as u64);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn stale_item_is_finished_after_restart() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let queue = WorkQueue::new(Arc::clone(&db), QueueName::SUMMARIZE);
    let item = queue.enqueue("https://a.example/1").await.unwrap();

    // A worker claims the item, fails twice and dies without acknowledging.
    let crashed = Uuid::new_v4();
    queue.claim_next(crashed, None).await.unwrap();
    assert_eq!(queue.record_failure_and_retry(item.id, "timeout").await, 1);
    assert_eq!(queue.record_failure_and_retry(item.id, "timeout").await, 2);

    // Without staleness the item is stuck.
    let strict = WorkerLoop::new(queue.clone(), Arc::new(AlwaysOk), fast_policy());
    assert!(strict.run_once().await.is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let restarted = WorkerLoop::new(queue.clone(), Arc::new(AlwaysOk), stale_policy());
    let report = restarted.run_once().await.unwrap();
    assert_eq!(report.item_id, item.id);
    assert_eq!(report.disposition, Disposition::Completed);

    let stored = queue.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkStatus::Completed);
    assert_eq!(stored.retry_count, 2);
    assert_eq!(stored.claimed_by, Some(restarted.id()));
}

#[tokio::test]
async fn reclaimed_item_out_of_retries_is_failed_without_processing() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let queue = WorkQueue::new(Arc::clone(&db), QueueName::SUMMARIZE);
    let item = queue.enqueue("https://a.example/2").await.unwrap();

    // The holder records its last allowed failure and dies before marking it.
    queue.claim_next(Uuid::new_v4(), None).await.unwrap();
    for expected in 1..=3 {
        assert_eq!(queue.record_failure_and_retry(item.id, "timeout").await, expected);
    }

    tokio::time::sleep(Duration::from_millis(80)).await;
    let processor = Arc::new(AlwaysDown {
        calls: AtomicU32::new(0),
    });
    let restarted = WorkerLoop::new(queue.clone(), processor.clone(), stale_policy());
    let report = restarted.run_once().await.unwrap();
    assert_eq!(report.item_id, item.id);
    assert_eq!(report.disposition, Disposition::Failed);
    assert_eq!(report.attempts, 0);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);

    let stored = queue.get(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkStatus::Failed);
    assert_eq!(stored.retry_count, 3);
}
