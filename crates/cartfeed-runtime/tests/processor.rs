use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cartfeed_runtime::{
    handler_fn, ChangeHandler, FeedError, HandlerError, InMemoryChangeFeed,
    InMemoryLeaseRepository, LeaseRecord, LeaseRepository, ProcessorBuilder, ProcessorController,
    ProcessorOptions, RetryPolicy, Seq, StartFrom,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;

/// Polls a condition (which may `.await`) until it holds or ten seconds pass.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !$cond {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                $what
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }};
}

const PROCESSOR: &str = "cart-monitor";

#[derive(Clone, Debug, PartialEq)]
struct Seen {
    partition_id: String,
    seq: Seq,
    worker: String,
}

fn fast_options() -> ProcessorOptions {
    ProcessorOptions {
        lease_ttl: Duration::from_millis(1500),
        renew_interval: Duration::from_millis(200),
        acquire_interval: Duration::from_millis(50),
        feed_poll_delay: Duration::from_millis(20),
        max_items_per_page: 5,
        handler_timeout: Duration::from_secs(1),
        handler_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
        },
        io_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        },
        shutdown_grace: Duration::from_secs(2),
        ..ProcessorOptions::default()
    }
}

fn recording_handler(seen: Arc<Mutex<Vec<Seen>>>) -> Arc<dyn ChangeHandler> {
    Arc::new(handler_fn(move |ctx, batch| {
        let seen = seen.clone();
        async move {
            let mut seen = seen.lock().await;
            for record in &batch.records {
                seen.push(Seen {
                    partition_id: record.partition_id.clone(),
                    seq: record.seq,
                    worker: ctx.instance_name.clone(),
                });
            }
            Ok::<(), HandlerError>(())
        }
    }))
}

fn worker(
    name: &str,
    feed: &Arc<InMemoryChangeFeed>,
    repo: &Arc<InMemoryLeaseRepository>,
    seen: &Arc<Mutex<Vec<Seen>>>,
) -> ProcessorController {
    ProcessorBuilder::new(PROCESSOR, feed.clone(), recording_handler(seen.clone()))
        .with_instance_name(name)
        .with_lease_repository(repo.clone())
        .with_options(fast_options())
        .build()
        .expect("build processor")
}

async fn seqs_seen(seen: &Arc<Mutex<Vec<Seen>>>) -> Vec<Seq> {
    let mut seqs: Vec<Seq> = seen.lock().await.iter().map(|s| s.seq).collect();
    seqs.sort_unstable();
    seqs.dedup();
    seqs
}

async fn ownership(workers: &[&ProcessorController]) -> Vec<usize> {
    let mut counts = Vec::with_capacity(workers.len());
    for worker in workers {
        counts.push(worker.owned_partitions().await.len());
    }
    counts.sort_unstable();
    counts
}

fn write_carts(feed: &InMemoryChangeFeed, count: usize, tag: &str) {
    for i in 0..count {
        feed.upsert(&format!("{tag}-{i}"), json!({ "id": format!("{tag}-{i}") }))
            .expect("upsert");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_workers_split_four_partitions_evenly() {
    let feed = Arc::new(InMemoryChangeFeed::new(4));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    write_carts(&feed, 40, "cart");

    let a = worker("worker-a", &feed, &repo, &seen);
    a.start().await.expect("start a");
    eventually!("worker-a to own every partition", a.owned_partitions().await.len() == 4);

    let b = worker("worker-b", &feed, &repo, &seen);
    b.start().await.expect("start b");
    eventually!(
        "a 2/2 split",
        a.owned_partitions().await.len() == 2 && b.owned_partitions().await.len() == 2
    );

    let owned_a = a.owned_partitions().await;
    let owned_b = b.owned_partitions().await;
    assert!(owned_a.iter().all(|p| !owned_b.contains(p)));

    write_carts(&feed, 40, "late");
    eventually!("all 80 changes delivered", seqs_seen(&seen).await.len() == 80);

    let late: Vec<Seen> = seen
        .lock()
        .await
        .iter()
        .filter(|s| s.seq > 40)
        .cloned()
        .collect();
    for s in &late {
        let owner = if owned_a.contains(&s.partition_id) {
            "worker-a"
        } else {
            "worker-b"
        };
        assert_eq!(s.worker, owner, "partition {} delivered by non-owner", s.partition_id);
    }

    a.stop().await.expect("stop a");
    b.stop().await.expect("stop b");
    for lease in repo.list(PROCESSOR).await.expect("list") {
        assert!(lease.owner.is_none(), "lease {} still owned", lease.partition_id);
    }
    assert!(repo.list_workers(PROCESSOR).await.expect("workers").is_empty());
}

#[tokio::test]
async fn checkpoint_outside_retention_halts_only_that_partition() {
    let feed = Arc::new(InMemoryChangeFeed::new(2));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    write_carts(&feed, 20, "cart");
    let doomed = feed.partition_of("cart-0").expect("route");
    let healthy = if doomed == "0" { "1" } else { "0" };
    repo.create_if_absent(&LeaseRecord::new(PROCESSOR, doomed.clone(), Some(0)))
        .await
        .expect("seed lease");
    feed.trim_through(10).expect("trim");

    let processor = worker("worker-a", &feed, &repo, &seen);
    processor.start().await.expect("start");
    eventually!(
        "the trimmed partition to halt",
        !processor.halted_partitions().await.is_empty()
    );

    let halted = processor.halted_partitions().await;
    assert_eq!(halted.len(), 1);
    assert_eq!(halted[0].partition_id, doomed);
    assert!(matches!(halted[0].error, FeedError::CheckpointOutOfRange { .. }));
    assert!(processor.is_running().await);
    assert_eq!(processor.terminal_error().await, None);

    let healthy_key = (0..)
        .map(|i| format!("after-{i}"))
        .find(|key| feed.partition_of(key).expect("route") == healthy)
        .expect("some key routes to the healthy partition");
    feed.upsert(&healthy_key, json!({ "id": healthy_key.clone() }))
        .expect("upsert");
    eventually!(
        "the healthy partition to keep flowing",
        seen.lock()
            .await
            .iter()
            .any(|s| s.seq > 20 && s.partition_id == healthy)
    );
    assert!(seen.lock().await.iter().all(|s| s.partition_id != doomed));

    processor.stop().await.expect("stop");
    let lease = repo
        .get(PROCESSOR, &doomed)
        .await
        .expect("get")
        .expect("lease");
    assert_eq!(lease.checkpoint, Some(0));
}

#[tokio::test]
async fn start_time_before_retention_is_reported_as_halted() {
    let feed = Arc::new(InMemoryChangeFeed::new(1));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let long_ago = Utc::now() - chrono::Duration::days(1);
    write_carts(&feed, 5, "cart");
    feed.trim_through(2).expect("trim");

    let processor = ProcessorBuilder::new(PROCESSOR, feed.clone(), recording_handler(seen.clone()))
        .with_instance_name("worker-a")
        .with_lease_repository(repo.clone())
        .with_options(fast_options())
        .with_start_time(long_ago)
        .build()
        .expect("build");
    processor.start().await.expect("start");
    eventually!("the partition to halt", !processor.halted_partitions().await.is_empty());
    assert!(seen.lock().await.is_empty());
    processor.stop().await.expect("stop");
}

#[tokio::test]
async fn restart_resumes_from_persisted_checkpoint() {
    let feed = Arc::new(InMemoryChangeFeed::new(1));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    write_carts(&feed, 12, "cart");

    let first = worker("worker-a", &feed, &repo, &seen);
    first.start().await.expect("start");
    eventually!(
        "first run to checkpoint everything",
        repo.get(PROCESSOR, "0")
            .await
            .ok()
            .flatten()
            .and_then(|l| l.checkpoint)
            == Some(12)
    );
    first.stop().await.expect("stop");

    write_carts(&feed, 3, "more");
    let second_seen = Arc::new(Mutex::new(Vec::new()));
    let second = worker("worker-a", &feed, &repo, &second_seen);
    second.start().await.expect("restart");
    eventually!("new changes after restart", seqs_seen(&second_seen).await.len() == 3);
    assert_eq!(seqs_seen(&second_seen).await, vec![13, 14, 15]);
    second.stop().await.expect("stop");
}

#[tokio::test]
async fn expired_leases_of_crashed_worker_are_taken_over() {
    let feed = Arc::new(InMemoryChangeFeed::new(2));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    write_carts(&feed, 10, "cart");
    let head = feed.head_seq().expect("head");

    for partition in ["0", "1"] {
        let mut lease = LeaseRecord::new(PROCESSOR, partition, Some(head));
        lease.owner = Some("crashed".into());
        lease.acquired_at = Some(Utc::now() - chrono::Duration::minutes(5));
        lease.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        repo.create_if_absent(&lease).await.expect("seed");
    }
    write_carts(&feed, 6, "after-crash");

    let survivor = worker("survivor", &feed, &repo, &seen);
    survivor.start().await.expect("start");
    eventually!(
        "survivor to own both partitions",
        survivor.owned_partitions().await.len() == 2
    );
    eventually!("changes after the crash", seqs_seen(&seen).await.len() == 6);
    assert!(seqs_seen(&seen).await.iter().all(|seq| *seq > head));
    survivor.stop().await.expect("stop");
}

#[tokio::test]
async fn split_partition_hands_over_to_children() {
    let feed = Arc::new(InMemoryChangeFeed::new(1));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    write_carts(&feed, 8, "cart");

    let processor = worker("worker-a", &feed, &repo, &seen);
    processor.start().await.expect("start");
    eventually!("initial changes", seqs_seen(&seen).await.len() == 8);

    let (left, right) = feed.split("0").expect("split");
    write_carts(&feed, 20, "post-split");
    eventually!(
        "children to be owned",
        processor.owned_partitions().await == vec![left.clone(), right.clone()]
    );
    eventually!("post-split changes", seqs_seen(&seen).await.len() == 28);
    assert!(repo.get(PROCESSOR, "0").await.expect("get").is_none());
    processor.stop().await.expect("stop");
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected() {
    let feed = Arc::new(InMemoryChangeFeed::new(1));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = worker("worker-a", &feed, &repo, &seen);

    assert!(matches!(processor.stop().await, Err(FeedError::Lifecycle(_))));
    processor.start().await.expect("start");
    assert!(matches!(processor.start().await, Err(FeedError::Lifecycle(_))));
    processor.stop().await.expect("stop");
    assert!(!processor.is_running().await);
    assert!(matches!(processor.stop().await, Err(FeedError::Lifecycle(_))));
}

#[tokio::test]
async fn unreachable_source_fails_start() {
    let feed = Arc::new(InMemoryChangeFeed::new(1));
    feed.set_unavailable(true).expect("toggle");
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let processor = worker("worker-a", &feed, &repo, &Arc::new(Mutex::new(Vec::new())));
    let err = processor.start().await.unwrap_err();
    assert!(matches!(err, FeedError::Unavailable(_)));
    assert!(!processor.is_running().await);
}

#[tokio::test]
async fn lease_store_outage_stops_the_processor() {
    let feed = Arc::new(InMemoryChangeFeed::new(2));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let processor = worker("worker-a", &feed, &repo, &seen);
    processor.start().await.expect("start");

    repo.set_offline(true);
    eventually!("the processor to give up", !processor.is_running().await);
    assert!(matches!(
        processor.terminal_error().await,
        Some(FeedError::Unavailable(_))
    ));
    assert!(matches!(
        processor.stop().await,
        Err(FeedError::Unavailable(_))
    ));
}

#[tokio::test]
async fn start_now_skips_history() {
    let feed = Arc::new(InMemoryChangeFeed::new(1));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    write_carts(&feed, 5, "old");
    let processor = ProcessorBuilder::new(PROCESSOR, feed.clone(), recording_handler(seen.clone()))
        .with_lease_repository(repo.clone())
        .with_options(fast_options())
        .start_from(StartFrom::Now)
        .build()
        .expect("build");
    processor.start().await.expect("start");
    eventually!("partition to be owned", processor.owned_partitions().await.len() == 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    write_carts(&feed, 2, "new");
    eventually!("only new changes", seqs_seen(&seen).await.len() == 2);
    assert_eq!(seqs_seen(&seen).await, vec![6, 7]);
    processor.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn third_worker_takes_a_partition_from_an_even_split() {
    let feed = Arc::new(InMemoryChangeFeed::new(4));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let a = worker("worker-a", &feed, &repo, &seen);
    let b = worker("worker-b", &feed, &repo, &seen);
    a.start().await.expect("start a");
    b.start().await.expect("start b");
    eventually!("a 2/2 split", ownership(&[&a, &b]).await == vec![2, 2]);

    let c = worker("worker-c", &feed, &repo, &seen);
    c.start().await.expect("start c");
    eventually!(
        "a 2/1/1 split",
        ownership(&[&a, &b, &c]).await == vec![1, 1, 2]
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ownership(&[&a, &b, &c]).await, vec![1, 1, 2]);

    write_carts(&feed, 20, "cart");
    eventually!("every change", seqs_seen(&seen).await.len() == 20);

    for processor in [&a, &b, &c] {
        processor.stop().await.expect("stop");
    }
}

#[tokio::test]
async fn now_start_keeps_unacknowledged_changes_for_the_next_owner() {
    let feed = Arc::new(InMemoryChangeFeed::new(1));
    let repo = Arc::new(InMemoryLeaseRepository::new());
    write_carts(&feed, 3, "old");

    let attempts = Arc::new(AtomicU32::new(0));
    let failing: Arc<dyn ChangeHandler> = {
        let attempts = attempts.clone();
        Arc::new(handler_fn(move |_ctx, _batch| {
            let attempts = attempts.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), HandlerError>("buyer directory unavailable".into())
            }
        }))
    };
    let patient = ProcessorOptions {
        handler_retry: RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        },
        ..fast_options()
    };
    let first = ProcessorBuilder::new(PROCESSOR, feed.clone(), failing)
        .with_instance_name("worker-a")
        .with_lease_repository(repo.clone())
        .with_options(patient)
        .start_from(StartFrom::Now)
        .build()
        .expect("build");
    first.start().await.expect("start");
    eventually!(
        "the start position to be pinned",
        repo.get(PROCESSOR, "0")
            .await
            .expect("get")
            .and_then(|l| l.checkpoint)
            == Some(3)
    );
    write_carts(&feed, 1, "new");
    eventually!(
        "the first delivery attempt",
        attempts.load(Ordering::SeqCst) > 0
    );
    first.stop().await.expect("stop");

    let lease = repo
        .get(PROCESSOR, "0")
        .await
        .expect("get")
        .expect("lease");
    assert_eq!(lease.owner, None);
    assert_eq!(lease.checkpoint, Some(3));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let second = ProcessorBuilder::new(PROCESSOR, feed.clone(), recording_handler(seen.clone()))
        .with_instance_name("worker-b")
        .with_lease_repository(repo.clone())
        .with_options(fast_options())
        .start_from(StartFrom::Now)
        .build()
        .expect("build");
    second.start().await.expect("start");
    eventually!(
        "the unacknowledged change",
        seqs_seen(&seen).await == vec![4]
    );
    second.stop().await.expect("stop");
}
