//! Behaviour every `LeaseRepository` implementation must share.

use chrono::{Duration, Utc};

use super::LeaseRepository;
use crate::error::FeedError;
use crate::models::{LeaseRecord, WorkerPresence};

pub(crate) async fn assert_lease_repository_contract<R: LeaseRepository + ?Sized>(
    repo: &R,
    processor: &str,
) {
    let now = Utc::now();

    let created = repo
        .create_if_absent(&LeaseRecord::new(processor, "p1", Some(3)))
        .await
        .expect("create lease")
        .expect("lease was absent");
    assert_eq!(created.version, 1);
    assert_eq!(created.checkpoint, Some(3));

    let again = repo
        .create_if_absent(&LeaseRecord::new(processor, "p1", None))
        .await
        .expect("create twice");
    assert!(again.is_none());
    repo.create_if_absent(&LeaseRecord::new(processor, "p0", None))
        .await
        .expect("create second lease");

    let listed = repo.list(processor).await.expect("list leases");
    let ids: Vec<_> = listed.iter().map(|l| l.partition_id.as_str()).collect();
    assert_eq!(ids, vec!["p0", "p1"]);

    let mut next = created.clone();
    next.owner = Some("worker-a".into());
    next.expires_at = Some(now + Duration::seconds(30));
    next.acquired_at = Some(now);
    let acquired = repo
        .compare_and_swap(created.version, &next)
        .await
        .expect("cas from current version");
    assert_eq!(acquired.version, 2);
    assert_eq!(acquired.owner.as_deref(), Some("worker-a"));

    let mut stale = created.clone();
    stale.owner = Some("worker-b".into());
    let err = repo
        .compare_and_swap(created.version, &stale)
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Conflict { .. }));

    let stored = repo
        .get(processor, "p1")
        .await
        .expect("get lease")
        .expect("lease exists");
    assert_eq!(stored.owner.as_deref(), Some("worker-a"));
    assert_eq!(stored.version, 2);
    let stored_expiry = stored.expires_at.expect("expiry persisted");
    assert!((stored_expiry - (now + Duration::seconds(30))).num_milliseconds().abs() <= 1);

    let err = repo.delete(processor, "p1", 1).await.unwrap_err();
    assert!(matches!(err, FeedError::Conflict { .. }));
    repo.delete(processor, "p1", 2).await.expect("versioned delete");
    assert!(repo.get(processor, "p1").await.expect("get").is_none());

    let mut missing = LeaseRecord::new(processor, "p9", None);
    missing.version = 4;
    let err = repo.compare_and_swap(4, &missing).await.unwrap_err();
    assert!(matches!(err, FeedError::Conflict { .. }));

    let presence = WorkerPresence {
        processor: processor.to_string(),
        worker_id: "worker-a".into(),
        expires_at: now + Duration::seconds(10),
    };
    repo.heartbeat_worker(&presence).await.expect("heartbeat");
    let refreshed = WorkerPresence {
        expires_at: now + Duration::seconds(20),
        ..presence.clone()
    };
    repo.heartbeat_worker(&refreshed).await.expect("heartbeat again");
    let workers = repo.list_workers(processor).await.expect("list workers");
    assert_eq!(workers.len(), 1);
    assert!(workers[0].expires_at > presence.expires_at);

    let crashed = WorkerPresence {
        worker_id: "worker-crashed".into(),
        expires_at: now - Duration::seconds(5),
        ..presence.clone()
    };
    repo.heartbeat_worker(&crashed).await.expect("stale heartbeat");
    assert_eq!(repo.list_workers(processor).await.expect("list workers").len(), 2);
    assert_eq!(repo.prune_workers(processor, now).await.expect("prune"), 1);
    let workers = repo.list_workers(processor).await.expect("list workers");
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].worker_id, "worker-a");

    repo.remove_worker(processor, "worker-a")
        .await
        .expect("remove worker");
    assert!(repo
        .list_workers(processor)
        .await
        .expect("list workers")
        .is_empty());

    assert!(repo
        .list("some-other-processor")
        .await
        .expect("list other")
        .is_empty());
}
