//! One partition pipeline: lease keeper joined with reader and dispatcher.

use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use tokio_stream::StreamExt;

use super::coordinator::Coordinator;
use crate::dispatcher::{Delivery, Dispatcher};
use crate::error::FeedError;
use crate::lease::LeaseHandle;
use crate::reader::FeedReader;
use crate::retry::retry_transient;
use crate::signal::{stop_channel, StopSignal};
use crate::source::ReadPosition;

/// Why a pipeline ended.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PipelineExit {
    Stopped,
    OwnershipLost,
    PartitionGone,
    Halted(FeedError),
    Fatal(FeedError),
}

impl PipelineExit {
    fn from_error(err: FeedError) -> Self {
        match err {
            FeedError::OwnershipLost { .. } | FeedError::Conflict { .. } => {
                PipelineExit::OwnershipLost
            }
            FeedError::PartitionGone { .. } => PipelineExit::PartitionGone,
            err if err.halts_partition() => PipelineExit::Halted(err),
            err => PipelineExit::Fatal(err),
        }
    }
}

/// Renews the lease every `renew_interval` until stopped. Returns the error
/// that made renewal impossible, if any.
async fn keep_lease(
    coordinator: &Coordinator,
    lease: &LeaseHandle,
    stop: StopSignal,
) -> Option<FeedError> {
    loop {
        if stop.sleep_or_stop(coordinator.options.renew_interval).await {
            return None;
        }
        match coordinator.leases.renew(lease, Utc::now()).await {
            Ok(()) => {}
            Err(FeedError::OwnershipLost { .. }) => return None,
            Err(err) => {
                error!(
                    "cannot renew lease of partition {}: {err}",
                    lease.partition_id()
                );
                lease.mark_lost();
                return Some(err);
            }
        }
    }
}

/// Pins a `Now` start to a concrete sequence number and checkpoints it
/// before anything is delivered, so a later owner resumes from the same
/// place instead of from its own idea of "now".
async fn anchor_start(
    coordinator: &Coordinator,
    lease: &LeaseHandle,
    position: ReadPosition,
) -> Result<ReadPosition, FeedError> {
    if position != ReadPosition::Now {
        return Ok(position);
    }
    let partition_id = lease.partition_id();
    let page = retry_transient(&coordinator.options.io_retry, "resolve start position", || {
        coordinator
            .source
            .read_page(partition_id, &ReadPosition::Now, 1)
    })
    .await?;
    let anchor = page
        .records
        .first()
        .map_or(page.continuation, |record| record.seq.saturating_sub(1));
    coordinator.leases.checkpoint(lease, anchor, Utc::now()).await?;
    Ok(ReadPosition::After(anchor))
}

async fn pump(
    coordinator: &Coordinator,
    lease: &Arc<LeaseHandle>,
    stop: StopSignal,
) -> PipelineExit {
    let resumed = ReadPosition::resume(lease.checkpoint().await, &coordinator.start_from);
    let position = match anchor_start(coordinator, lease, resumed).await {
        Ok(position) => position,
        Err(err) => return PipelineExit::from_error(err),
    };
    info!(
        "partition {} pipeline starting at {:?}",
        lease.partition_id(),
        position
    );
    let reader = FeedReader::new(
        coordinator.source.clone(),
        lease.clone(),
        coordinator.leases.worker_id(),
        &coordinator.options,
        stop.clone(),
    );
    let dispatcher = Dispatcher::new(
        coordinator.handler.clone(),
        coordinator.leases.clone(),
        lease.clone(),
        coordinator.instance_name.clone(),
        &coordinator.options,
        stop,
    );
    let batches = reader.read(position);
    futures::pin_mut!(batches);
    while let Some(batch) = batches.next().await {
        let delivered = match batch {
            Ok(batch) => dispatcher.deliver(batch).await,
            Err(err) => return PipelineExit::from_error(err),
        };
        match delivered {
            Ok(Delivery::Aborted) => break,
            Ok(_) => {}
            Err(err) => return PipelineExit::from_error(err),
        }
    }
    if lease.is_held(coordinator.leases.worker_id(), Utc::now()).await {
        PipelineExit::Stopped
    } else {
        PipelineExit::OwnershipLost
    }
}

/// Runs a partition until it is stopped, lost, gone, halted or hits a fatal error.
///
/// Leases of stopped, halted and gone partitions are released on the way out
/// so another worker (or a later sync) can pick them up.
pub(crate) async fn run_pipeline(
    coordinator: Arc<Coordinator>,
    lease: Arc<LeaseHandle>,
    stop: StopSignal,
) -> PipelineExit {
    let (keeper_stop, keeper_signal) = stop_channel();
    let (renew_error, exit) = tokio::join!(
        keep_lease(&coordinator, &lease, keeper_signal),
        async {
            let exit = pump(&coordinator, &lease, stop).await;
            keeper_stop.stop();
            exit
        }
    );
    let exit = match (renew_error, exit) {
        (Some(err), PipelineExit::Stopped | PipelineExit::OwnershipLost) if err.is_fatal() => {
            PipelineExit::Fatal(err)
        }
        (_, exit) => exit,
    };

    match &exit {
        PipelineExit::Stopped | PipelineExit::Halted(_) | PipelineExit::PartitionGone => {
            if let Err(err) = coordinator.leases.release(&lease).await {
                warn!(
                    "could not release lease of partition {}: {err}",
                    lease.partition_id()
                );
            }
        }
        PipelineExit::OwnershipLost | PipelineExit::Fatal(_) => {}
    }
    exit
}
