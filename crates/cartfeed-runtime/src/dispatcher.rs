//! Delivers batches to the handler and commits checkpoints.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, warn};

use crate::error::FeedError;
use crate::handler::{ChangeHandler, PartitionContext};
use crate::identity::Seq;
use crate::lease::{LeaseHandle, LeaseManager};
use crate::models::HandlerBatch;
use crate::options::{FailurePolicy, ProcessorOptions};
use crate::retry::RetryPolicy;
use crate::signal::StopSignal;

/// Result of a single handler invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Ack,
    Retry(String),
    /// Stop was requested or the lease is gone; the batch is left for redelivery.
    Abort,
}

/// Final result of delivering one batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Acked { checkpoint: Seq },
    Skipped { checkpoint: Seq },
    Empty,
    Aborted,
}

pub struct Dispatcher {
    handler: Arc<dyn ChangeHandler>,
    leases: Arc<LeaseManager>,
    lease: Arc<LeaseHandle>,
    instance_name: String,
    handler_timeout: Duration,
    handler_retry: RetryPolicy,
    failure_policy: FailurePolicy,
    stop: StopSignal,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn ChangeHandler>,
        leases: Arc<LeaseManager>,
        lease: Arc<LeaseHandle>,
        instance_name: impl Into<String>,
        options: &ProcessorOptions,
        stop: StopSignal,
    ) -> Self {
        Self {
            handler,
            leases,
            lease,
            instance_name: instance_name.into(),
            handler_timeout: options.handler_timeout,
            handler_retry: options.handler_retry.clone(),
            failure_policy: options.failure_policy,
            stop,
        }
    }

    async fn attempt(&self, batch: &Arc<HandlerBatch>, attempt: u32) -> DeliveryOutcome {
        if self.stop.is_stopped() {
            return DeliveryOutcome::Abort;
        }
        if !self.lease.is_held(self.leases.worker_id(), Utc::now()).await {
            return DeliveryOutcome::Abort;
        }
        let context = PartitionContext {
            partition_id: batch.partition_id.clone(),
            lease_token: self.lease.token().to_string(),
            instance_name: self.instance_name.clone(),
            processor_name: self.leases.processor().to_string(),
            metrics: batch.metrics.clone(),
            attempt,
        };
        let call = self
            .handler
            .handle(context, batch.clone(), self.stop.clone());
        match tokio::time::timeout(self.handler_timeout, call).await {
            Ok(Ok(())) => DeliveryOutcome::Ack,
            Ok(Err(err)) => DeliveryOutcome::Retry(err.to_string()),
            Err(_) => DeliveryOutcome::Retry(format!(
                "handler timed out after {:?}",
                self.handler_timeout
            )),
        }
    }

    async fn commit(&self, seq: Seq, delivered: Delivery) -> Result<Delivery, FeedError> {
        match self.leases.checkpoint(&self.lease, seq, Utc::now()).await {
            Ok(()) => Ok(delivered),
            Err(FeedError::OwnershipLost { partition_id }) => {
                warn!("discarding checkpoint {seq} of partition {partition_id}: ownership lost");
                Ok(Delivery::Aborted)
            }
            Err(e) => Err(e),
        }
    }

    /// Delivers `batch` with retries, then checkpoints its last sequence number.
    pub async fn deliver(&self, batch: HandlerBatch) -> Result<Delivery, FeedError> {
        let (Some(first_seq), Some(last_seq)) = (batch.first_seq(), batch.last_seq()) else {
            return Ok(Delivery::Empty);
        };
        debug!(
            "delivering partition {} seq {first_seq}..={last_seq} ({} changes, {:.2} RU, fetched in {:?})",
            batch.partition_id,
            batch.len(),
            batch.metrics.request_charge,
            batch.metrics.elapsed
        );
        let batch = Arc::new(batch);
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            match self.attempt(&batch, attempt).await {
                DeliveryOutcome::Ack => {
                    return self
                        .commit(last_seq, Delivery::Acked { checkpoint: last_seq })
                        .await;
                }
                DeliveryOutcome::Abort => return Ok(Delivery::Aborted),
                DeliveryOutcome::Retry(message) => {
                    if attempt >= self.handler_retry.max_attempts {
                        break message;
                    }
                    let delay = self.handler_retry.backoff_for(attempt);
                    warn!(
                        "handler failed on partition {} (attempt {attempt}/{}): {message}; retrying in {delay:?}",
                        batch.partition_id, self.handler_retry.max_attempts
                    );
                    if self.stop.sleep_or_stop(delay).await {
                        return Ok(Delivery::Aborted);
                    }
                }
            }
        };

        match self.failure_policy {
            FailurePolicy::Halt => {
                error!(
                    "halting partition {} at seq {first_seq}: handler failed {attempt} times: {failure}",
                    batch.partition_id
                );
                Err(FeedError::HandlerFailure {
                    partition_id: batch.partition_id.clone(),
                    attempts: attempt,
                    message: failure,
                })
            }
            FailurePolicy::SkipAndAdvance => {
                error!(
                    "skipping partition {} seq {first_seq}..={last_seq} after {attempt} failed attempts: {failure}",
                    batch.partition_id
                );
                self.commit(last_seq, Delivery::Skipped { checkpoint: last_seq })
                    .await
            }
        }
    }
}
