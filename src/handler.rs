//! Change handler that detects abandoned carts and contacts their buyers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cartfeed_runtime::{
    ChangeHandler, HandlerBatch, HandlerError, PartitionContext, Seq, StopSignal,
};
use log::{debug, info, warn};

use crate::buyer::{BuyerDirectory, DirectoryError};
use crate::cart::Cart;
use crate::view::{AbandonedCartView, Observation};

pub const DEFAULT_SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);

pub struct AbandonedCartHandler {
    directory: Arc<dyn BuyerDirectory>,
    view: Arc<AbandonedCartView>,
    slow_request_threshold: Duration,
}

impl AbandonedCartHandler {
    pub fn new(directory: Arc<dyn BuyerDirectory>, view: Arc<AbandonedCartView>) -> Self {
        Self {
            directory,
            view,
            slow_request_threshold: DEFAULT_SLOW_REQUEST_THRESHOLD,
        }
    }

    pub fn with_slow_request_threshold(mut self, threshold: Duration) -> Self {
        self.slow_request_threshold = threshold;
        self
    }

    async fn contact_buyer(&self, seq: Seq, cart: &Cart) -> Result<(), HandlerError> {
        match self.directory.read_buyer(&cart.buyer_id).await {
            Ok(lookup) => {
                info!(
                    "Contacting buyer {} ({}) about abandoned cart {} [{} RU]",
                    lookup.buyer.name,
                    lookup.buyer.contact_number,
                    cart.cart_id,
                    lookup.request_charge
                );
                self.view.apply(seq, cart, Some(lookup.buyer)).await;
                Ok(())
            }
            Err(DirectoryError::NotFound(buyer_id)) => {
                warn!(
                    "buyer {buyer_id} of abandoned cart {} not found; nobody to contact",
                    cart.cart_id
                );
                self.view.apply(seq, cart, None).await;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ChangeHandler for AbandonedCartHandler {
    async fn handle(
        &self,
        context: PartitionContext,
        batch: Arc<HandlerBatch>,
        stop: StopSignal,
    ) -> Result<(), HandlerError> {
        info!("Started handling changes for lease {}...", context.lease_token);
        info!(
            "Change feed request consumed {} RU.",
            context.metrics.request_charge
        );
        if let Some(session) = &context.metrics.session_token {
            debug!("SessionToken {session}");
        }
        if context.metrics.elapsed > self.slow_request_threshold {
            warn!(
                "Change feed request took longer than expected: partition={} elapsed={:?} attempt={}",
                context.partition_id, context.metrics.elapsed, context.attempt
            );
        }

        for record in &batch.records {
            if stop.is_stopped() {
                return Err("stop requested before the batch finished".into());
            }
            let cart: Cart = match record.decode() {
                Ok(cart) => cart,
                Err(err) => {
                    warn!(
                        "skipping undecodable change {} in partition {}: {err}",
                        record.seq, record.partition_id
                    );
                    continue;
                }
            };
            match self.view.observe(record.seq, &cart).await {
                Observation::Stale => {}
                Observation::Abandoned {
                    needs_notification: true,
                } => {
                    info!("Detected operation for item with id {}", cart.cart_id);
                    self.contact_buyer(record.seq, &cart).await?;
                }
                Observation::Abandoned { .. } | Observation::NotAbandoned => {
                    self.view.apply(record.seq, &cart, None).await;
                }
            }
        }
        Ok(())
    }
}
