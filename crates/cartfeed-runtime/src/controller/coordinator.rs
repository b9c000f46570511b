//! Coordination loop: discovery, rebalancing and pipeline supervision.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::pipeline::{run_pipeline, PipelineExit};
use crate::enumerator::PartitionEnumerator;
use crate::error::FeedError;
use crate::handler::ChangeHandler;
use crate::identity::PartitionId;
use crate::lease::{LeaseHandle, LeaseManager};
use crate::models::LeaseRecord;
use crate::options::{ProcessorOptions, StartFrom};
use crate::signal::{StopHandle, StopSignal};
use crate::source::ChangeFeedSource;

struct PipelineSlot {
    stop: StopHandle,
    lease: Arc<LeaseHandle>,
    task: JoinHandle<PipelineExit>,
}

#[derive(Default)]
pub(crate) struct CoordinatorState {
    pipelines: HashMap<PartitionId, PipelineSlot>,
    pub(crate) halted: BTreeMap<PartitionId, FeedError>,
    pub(crate) terminal: Option<FeedError>,
}

impl CoordinatorState {
    pub(crate) fn owned(&self) -> Vec<PartitionId> {
        let mut owned: Vec<_> = self
            .pipelines
            .iter()
            .filter(|(_, slot)| !slot.lease.is_lost() && !slot.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        owned.sort();
        owned
    }
}

/// Collaborators and state shared by the coordination task and its pipelines.
pub(crate) struct Coordinator {
    pub(crate) processor_name: String,
    pub(crate) instance_name: String,
    pub(crate) source: Arc<dyn ChangeFeedSource>,
    pub(crate) handler: Arc<dyn ChangeHandler>,
    pub(crate) leases: Arc<LeaseManager>,
    pub(crate) enumerator: PartitionEnumerator,
    pub(crate) options: ProcessorOptions,
    pub(crate) start_from: StartFrom,
    pub(crate) state: Mutex<CoordinatorState>,
}

impl Coordinator {
    /// Records the outcome of finished pipelines. A fatal exit is returned as an error.
    fn reap(
        &self,
        state: &mut CoordinatorState,
        finished: Vec<(PartitionId, PipelineExit)>,
    ) -> Result<(), FeedError> {
        let mut fatal = None;
        for (partition_id, exit) in finished {
            match exit {
                PipelineExit::Stopped => debug!("partition {partition_id} pipeline stopped"),
                PipelineExit::OwnershipLost => {
                    info!("partition {partition_id} is now owned elsewhere")
                }
                PipelineExit::PartitionGone => {
                    info!("partition {partition_id} was split or merged; its children take over")
                }
                PipelineExit::Halted(err) => {
                    error!("partition {partition_id} halted: {err}");
                    state.halted.insert(partition_id, err);
                }
                PipelineExit::Fatal(err) => {
                    error!("partition {partition_id} hit a fatal error: {err}");
                    fatal.get_or_insert(err);
                }
            }
        }
        fatal.map_or(Ok(()), Err)
    }

    async fn collect_finished(
        &self,
        state: &mut CoordinatorState,
    ) -> Vec<(PartitionId, PipelineExit)> {
        let done: Vec<PartitionId> = state
            .pipelines
            .iter()
            .filter(|(_, slot)| slot.task.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        let mut finished = Vec::with_capacity(done.len());
        for partition_id in done {
            if let Some(slot) = state.pipelines.remove(&partition_id) {
                let exit = join_exit(&partition_id, slot.task.await);
                finished.push((partition_id, exit));
            }
        }
        finished
    }

    fn spawn(self: &Arc<Self>, state: &mut CoordinatorState, lease: Arc<LeaseHandle>) {
        let stop = StopHandle::new();
        let task = tokio::spawn(run_pipeline(self.clone(), lease.clone(), stop.signal()));
        state
            .pipelines
            .insert(lease.partition_id().to_string(), PipelineSlot { stop, lease, task });
    }

    async fn adopt(
        self: &Arc<Self>,
        state: &mut CoordinatorState,
        lease: &LeaseRecord,
    ) -> Result<(), FeedError> {
        if let Some(handle) = self.leases.acquire(lease, Utc::now()).await? {
            self.spawn(state, handle);
        }
        Ok(())
    }

    /// One coordination pass.
    pub(crate) async fn tick(self: &Arc<Self>) -> Result<(), FeedError> {
        self.leases.heartbeat(Utc::now()).await?;
        let outcome = self.enumerator.sync(&self.leases).await?;
        if !outcome.discovered.is_empty() || !outcome.retired.is_empty() {
            info!(
                "partition sync: {} live, discovered {:?}, retired {:?}",
                outcome.partitions.len(),
                outcome.discovered,
                outcome.retired
            );
        }

        let mut state = self.state.lock().await;
        let finished = self.collect_finished(&mut state).await;
        self.reap(&mut state, finished)?;

        let leases = self.leases.list_leases().await?;
        let workers = self.leases.list_workers().await?;
        let excluded: HashSet<PartitionId> = state.halted.keys().cloned().collect();
        let now = Utc::now();
        let plan = self.leases.plan(&leases, &workers, &excluded, now);
        debug!(
            "rebalance: {} leases over {} workers (share {}, max {}), acquire {}, release {}",
            leases.len(),
            plan.active_workers,
            plan.share,
            plan.max_share,
            plan.acquire.len(),
            plan.release.len()
        );

        let by_id: HashMap<&str, &LeaseRecord> = leases
            .iter()
            .map(|l| (l.partition_id.as_str(), l))
            .collect();

        for partition_id in &plan.release {
            if let Some(slot) = state.pipelines.get(partition_id) {
                if !slot.stop.is_stopped() {
                    info!("rebalancing: handing off partition {partition_id}");
                    slot.stop.stop();
                }
            } else if let Some(lease) = by_id.get(partition_id.as_str()) {
                if let Some(handle) = self.leases.acquire(lease, now).await? {
                    self.leases.release(&handle).await?;
                }
            }
        }

        for partition_id in &plan.retained {
            if state.pipelines.contains_key(partition_id) || excluded.contains(partition_id) {
                continue;
            }
            if let Some(lease) = by_id.get(partition_id.as_str()) {
                self.adopt(&mut state, lease).await?;
            }
        }

        for lease in &plan.acquire {
            if state.pipelines.contains_key(&lease.partition_id) {
                continue;
            }
            self.adopt(&mut state, lease).await?;
        }
        Ok(())
    }

    /// Ticks every `acquire_interval` until stopped or a fatal error occurs, then shuts down.
    pub(crate) async fn run(self: Arc<Self>, stop: StopSignal) -> Result<(), FeedError> {
        let result = loop {
            if stop.sleep_or_stop(self.options.acquire_interval).await {
                break Ok(());
            }
            match self.tick().await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!("processor {} stopping: {err}", self.processor_name);
                    self.state.lock().await.terminal = Some(err.clone());
                    break Err(err);
                }
                Err(err) => warn!("coordination pass failed: {err}"),
            }
        };
        self.shutdown().await;
        result
    }

    /// Stops every pipeline, waits up to `shutdown_grace`, then releases what is left.
    pub(crate) async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let slots: Vec<(PartitionId, PipelineSlot)> = state.pipelines.drain().collect();
        for (_, slot) in &slots {
            slot.stop.stop();
        }
        let deadline = tokio::time::Instant::now() + self.options.shutdown_grace;
        let mut finished = Vec::new();
        for (partition_id, slot) in slots {
            let abort = slot.task.abort_handle();
            match tokio::time::timeout_at(deadline, slot.task).await {
                Ok(joined) => {
                    finished.push((partition_id.clone(), join_exit(&partition_id, joined)))
                }
                Err(_) => {
                    warn!(
                        "partition {partition_id} did not stop within {:?}; aborting",
                        self.options.shutdown_grace
                    );
                    abort.abort();
                    if let Err(err) = self.leases.release(&slot.lease).await {
                        warn!("could not release lease of partition {partition_id}: {err}");
                    }
                }
            }
        }
        if let Err(err) = self.reap(&mut state, finished) {
            state.terminal.get_or_insert(err);
        }
        if let Err(err) = self.leases.deregister().await {
            warn!("could not remove presence of {}: {err}", self.instance_name);
        }
        info!("processor {} ({}) stopped", self.processor_name, self.instance_name);
    }
}

fn join_exit(
    partition_id: &str,
    joined: Result<PipelineExit, tokio::task::JoinError>,
) -> PipelineExit {
    match joined {
        Ok(exit) => exit,
        Err(err) => PipelineExit::Halted(FeedError::HandlerFailure {
            partition_id: partition_id.to_string(),
            attempts: 1,
            message: format!("pipeline task failed: {err}"),
        }),
    }
}
