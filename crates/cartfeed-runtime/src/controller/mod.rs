//! Public façade: start, stop and observe a change-feed processor.

mod builder;
mod coordinator;
mod pipeline;

pub use builder::ProcessorBuilder;

use std::sync::Arc;

use log::info;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use self::coordinator::Coordinator;
use crate::error::FeedError;
use crate::identity::PartitionId;
use crate::signal::{stop_channel, StopHandle};

/// A partition whose pipeline stopped on a non-retryable error.
#[derive(Clone, Debug, PartialEq)]
pub struct HaltedPartition {
    pub partition_id: PartitionId,
    pub error: FeedError,
}

struct Running {
    stop: StopHandle,
    task: JoinHandle<Result<(), FeedError>>,
}

/// Runs one worker of a named processor.
pub struct ProcessorController {
    coordinator: Arc<Coordinator>,
    running: Mutex<Option<Running>>,
}

impl ProcessorController {
    fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            running: Mutex::new(None),
        }
    }

    pub fn processor_name(&self) -> &str {
        &self.coordinator.processor_name
    }

    pub fn instance_name(&self) -> &str {
        &self.coordinator.instance_name
    }

    /// Runs one coordination pass and then keeps coordinating in the background.
    ///
    /// Fails when the source or lease store cannot be reached.
    pub async fn start(&self) -> Result<(), FeedError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(FeedError::Lifecycle("processor is already started"));
        }
        {
            let mut state = self.coordinator.state.lock().await;
            state.halted.clear();
            state.terminal = None;
        }
        info!(
            "starting processor {} as instance {}",
            self.coordinator.processor_name, self.coordinator.instance_name
        );
        if let Err(err) = self.coordinator.tick().await {
            self.coordinator.shutdown().await;
            return Err(err);
        }
        let (stop, signal) = stop_channel();
        let task = tokio::spawn(self.coordinator.clone().run(signal));
        *running = Some(Running { stop, task });
        Ok(())
    }

    /// Stops every pipeline, waits for in-flight handler calls and releases leases.
    ///
    /// Returns the fatal error that ended the processor, if any.
    pub async fn stop(&self) -> Result<(), FeedError> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(FeedError::Lifecycle("processor is not started"))?;
        info!("stopping processor {}", self.coordinator.processor_name);
        running.stop.stop();
        match running.task.await {
            Ok(result) => result,
            Err(err) => Err(FeedError::Unavailable(format!(
                "coordination task failed: {err}"
            ))),
        }
    }

    /// `true` between a successful `start` and `stop`, unless a fatal error ended it.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    pub async fn owned_partitions(&self) -> Vec<PartitionId> {
        self.coordinator.state.lock().await.owned()
    }

    pub async fn halted_partitions(&self) -> Vec<HaltedPartition> {
        self.coordinator
            .state
            .lock()
            .await
            .halted
            .iter()
            .map(|(partition_id, error)| HaltedPartition {
                partition_id: partition_id.clone(),
                error: error.clone(),
            })
            .collect()
    }

    pub async fn terminal_error(&self) -> Option<FeedError> {
        self.coordinator.state.lock().await.terminal.clone()
    }
}
