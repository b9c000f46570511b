//! Lazy per-partition stream of change batches.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use chrono::Utc;
use futures::Stream;
use log::debug;

use crate::error::FeedError;
use crate::identity::WorkerId;
use crate::lease::LeaseHandle;
use crate::models::HandlerBatch;
use crate::options::ProcessorOptions;
use crate::retry::{retry_transient, RetryPolicy};
use crate::signal::StopSignal;
use crate::source::{ChangeFeedSource, FeedPage, ReadPosition};

/// Pulls pages of one owned partition.
pub struct FeedReader {
    source: Arc<dyn ChangeFeedSource>,
    lease: Arc<LeaseHandle>,
    worker_id: WorkerId,
    max_items: usize,
    poll_delay: Duration,
    io_retry: RetryPolicy,
    stop: StopSignal,
}

impl FeedReader {
    pub fn new(
        source: Arc<dyn ChangeFeedSource>,
        lease: Arc<LeaseHandle>,
        worker_id: impl Into<WorkerId>,
        options: &ProcessorOptions,
        stop: StopSignal,
    ) -> Self {
        Self {
            source,
            lease,
            worker_id: worker_id.into(),
            max_items: options.max_items_per_page,
            poll_delay: options.feed_poll_delay,
            io_retry: options.io_retry.clone(),
            stop,
        }
    }

    /// Streams non-empty batches starting at `position`.
    ///
    /// Nothing is fetched until the stream is polled. The stream ends when
    /// stop is requested or the lease is no longer held, and ends with an
    /// error when the partition is gone or the position fell out of retention.
    pub fn read(
        self,
        position: ReadPosition,
    ) -> impl Stream<Item = Result<HandlerBatch, FeedError>> + Send {
        try_stream! {
            let partition_id = self.lease.partition_id().to_string();
            let mut position = position;
            loop {
                if self.stop.is_stopped() {
                    debug!("reader for partition {partition_id} stopping");
                    break;
                }
                if !self.lease.is_held(&self.worker_id, Utc::now()).await {
                    debug!("reader for partition {partition_id} no longer holds its lease");
                    break;
                }
                let FeedPage { records, continuation, metrics } =
                    retry_transient(&self.io_retry, "read change feed page", || {
                        self.source.read_page(&partition_id, &position, self.max_items)
                    })
                    .await?;
                position = ReadPosition::After(continuation);
                if records.is_empty() {
                    if self.stop.sleep_or_stop(self.poll_delay).await {
                        break;
                    }
                    continue;
                }
                yield HandlerBatch {
                    partition_id: partition_id.clone(),
                    records,
                    metrics,
                };
            }
        }
    }
}
