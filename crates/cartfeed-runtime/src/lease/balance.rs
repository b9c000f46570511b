//! Even distribution of partition leases across active workers.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::identity::PartitionId;
use crate::models::{LeaseRecord, WorkerPresence};

/// What one worker should do with the leases it observed in a coordination tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RebalancePlan {
    /// Available leases to try to acquire, in preference order.
    pub acquire: Vec<LeaseRecord>,
    /// Owned partitions to give up, most recently acquired first.
    pub release: Vec<PartitionId>,
    /// Owned partitions to keep.
    pub retained: Vec<PartitionId>,
    /// Number of workers the share was computed for.
    pub active_workers: usize,
    pub max_share: usize,
    /// This worker's fair share: `floor(total / active)`, plus one if it
    /// ranks among the workers entitled to the remainder.
    pub share: usize,
}

/// Rendezvous weight so concurrently starting workers prefer different partitions.
fn preference(worker_id: &str, partition_id: &str) -> u64 {
    let digest = Sha256::new()
        .chain_update(worker_id.as_bytes())
        .chain_update(b":")
        .chain_update(partition_id.as_bytes())
        .finalize();
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(buffer)
}

/// Target lease count of every active worker.
///
/// Everyone gets `total / active`; the `total % active` extra leases go to the
/// workers already holding the most, ties broken by worker id. Every worker
/// derives the same assignment from the same snapshot.
fn fair_shares<'a>(
    held: &BTreeMap<&'a str, usize>,
    total: usize,
) -> BTreeMap<&'a str, usize> {
    let floor = total / held.len();
    let remainder = total % held.len();
    let mut ranked: Vec<(&str, usize)> = held.iter().map(|(w, n)| (*w, *n)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, (worker, _))| (worker, floor + usize::from(rank < remainder)))
        .collect()
}

/// Computes the rebalance plan for `worker_id`.
///
/// Active workers are this worker, owners of live leases and workers with an
/// unexpired presence record. A worker above `ceil(total / active)` always
/// sheds its newest leases; a worker above its fair share also sheds while
/// some other worker is below its own. Leases in `excluded` count towards the
/// total but are never proposed for acquisition.
pub fn plan(
    worker_id: &str,
    leases: &[LeaseRecord],
    workers: &[WorkerPresence],
    excluded: &HashSet<PartitionId>,
    now: DateTime<Utc>,
) -> RebalancePlan {
    let mut held: BTreeMap<&str, usize> = BTreeMap::new();
    held.insert(worker_id, 0);
    for presence in workers.iter().filter(|w| w.expires_at >= now) {
        held.entry(presence.worker_id.as_str()).or_default();
    }
    for lease in leases {
        if let (Some(owner), false) = (lease.owner.as_deref(), lease.is_available(now)) {
            *held.entry(owner).or_default() += 1;
        }
    }

    let total = leases.len();
    let active_workers = held.len();
    let max_share = total.div_ceil(active_workers);
    let shares = fair_shares(&held, total);
    let share = shares.get(worker_id).copied().unwrap_or(max_share);
    let shortfall: usize = shares
        .iter()
        .filter(|(w, _)| **w != worker_id)
        .map(|(w, target)| target.saturating_sub(held.get(w).copied().unwrap_or(0)))
        .sum();

    let mut mine: Vec<&LeaseRecord> = leases
        .iter()
        .filter(|l| l.is_held_by(worker_id, now))
        .collect();
    mine.sort_by(|a, b| {
        b.acquired_at
            .cmp(&a.acquired_at)
            .then_with(|| b.partition_id.cmp(&a.partition_id))
    });

    let mut result = RebalancePlan {
        active_workers,
        max_share,
        share,
        ..RebalancePlan::default()
    };
    let keep = if shortfall > 0 { share } else { max_share };
    if mine.len() > keep {
        let excess = mine.len() - keep;
        result.release = mine[..excess]
            .iter()
            .map(|l| l.partition_id.clone())
            .collect();
        result.retained = mine[excess..]
            .iter()
            .map(|l| l.partition_id.clone())
            .collect();
        return result;
    }

    result.retained = mine.iter().map(|l| l.partition_id.clone()).collect();
    let mut available: Vec<&LeaseRecord> = leases
        .iter()
        .filter(|l| l.is_available(now) && !excluded.contains(&l.partition_id))
        .collect();
    // Leases beyond what short peers still need may be taken up to `max_share`.
    let spare = available.len().saturating_sub(shortfall);
    let wanted = (share.saturating_sub(mine.len()) + spare).min(max_share - mine.len());
    available.sort_by_key(|l| Reverse(preference(worker_id, &l.partition_id)));
    result.acquire = available.into_iter().take(wanted).cloned().collect();
    result
}
