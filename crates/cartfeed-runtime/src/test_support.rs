use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::lease::{InMemoryLeaseRepository, LeaseHandle, LeaseManager, LeaseRepository};
use crate::models::LeaseRecord;
use crate::options::ProcessorOptions;
use crate::retry::RetryPolicy;

pub(crate) fn fast_options() -> ProcessorOptions {
    ProcessorOptions {
        lease_ttl: Duration::from_secs(2),
        renew_interval: Duration::from_millis(300),
        acquire_interval: Duration::from_millis(50),
        feed_poll_delay: Duration::from_millis(20),
        max_items_per_page: 10,
        handler_timeout: Duration::from_secs(1),
        handler_retry: RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
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

/// Lease manager for worker `"worker"` holding a fresh lease on `partition_id`.
pub(crate) async fn owned_partition(
    partition_id: &str,
) -> (Arc<LeaseManager>, Arc<LeaseHandle>, Arc<InMemoryLeaseRepository>) {
    let repo = Arc::new(InMemoryLeaseRepository::new());
    let options = fast_options();
    let manager = Arc::new(LeaseManager::new(
        repo.clone(),
        "proc",
        "worker",
        chrono::Duration::from_std(options.lease_ttl).expect("ttl"),
        options.io_retry.clone(),
    ));
    let lease = repo
        .create_if_absent(&LeaseRecord::new("proc", partition_id, None))
        .await
        .expect("create lease")
        .expect("fresh lease");
    let handle = manager
        .acquire(&lease, Utc::now())
        .await
        .expect("acquire")
        .expect("uncontended");
    (manager, handle, repo)
}
