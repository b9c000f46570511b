//! Handler collaborator invoked with every batch of changes.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::identity::PartitionId;
use crate::models::{HandlerBatch, ReadMetrics};
use crate::signal::StopSignal;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Diagnostics passed alongside a batch. Informational only.
#[derive(Clone, Debug)]
pub struct PartitionContext {
    pub partition_id: PartitionId,
    /// Identifies the current period of ownership of the partition lease.
    pub lease_token: String,
    pub instance_name: String,
    pub processor_name: String,
    pub metrics: ReadMetrics,
    /// 1-based delivery attempt of this batch.
    pub attempt: u32,
}

/// Business logic applied to each batch.
///
/// The same changes may be delivered more than once, so implementations must
/// be idempotent. Returning `Ok` means every side effect of the batch has
/// completed; returning an error causes the batch to be retried.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn handle(
        &self,
        context: PartitionContext,
        batch: Arc<HandlerBatch>,
        stop: StopSignal,
    ) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`ChangeHandler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(PartitionContext, Arc<HandlerBatch>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ChangeHandler for FnHandler<F>
where
    F: Fn(PartitionContext, Arc<HandlerBatch>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        context: PartitionContext,
        batch: Arc<HandlerBatch>,
        _stop: StopSignal,
    ) -> Result<(), HandlerError> {
        (self.f)(context, batch).await
    }
}
