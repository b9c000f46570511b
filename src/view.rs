//! Materialized view of abandoned carts, kept current from the change feed.

use std::collections::HashMap;

use cartfeed_runtime::Seq;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::buyer::Buyer;
use crate::cart::Cart;

/// One row of the view: an abandoned cart and who to contact about it.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedCart {
    pub cart_id: String,
    pub buyer_id: String,
    pub buyer_name: Option<String>,
    pub contact_number: Option<String>,
    pub seq: Seq,
}

/// How a change relates to what the view already holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The view already reflects this change or a later one.
    Stale,
    /// The cart is abandoned; `needs_notification` is set on the transition into that state.
    Abandoned { needs_notification: bool },
    NotAbandoned,
}

#[derive(Clone, Copy, Debug)]
struct Tracked {
    seq: Seq,
    abandoned: bool,
}

#[derive(Default)]
struct ViewState {
    tracked: HashMap<String, Tracked>,
    abandoned: HashMap<String, AbandonedCart>,
}

#[derive(Default)]
pub struct AbandonedCartView {
    state: RwLock<ViewState>,
}

impl AbandonedCartView {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn observe(&self, seq: Seq, cart: &Cart) -> Observation {
        let state = self.state.read().await;
        let tracked = state.tracked.get(&cart.cart_id).copied();
        match tracked {
            Some(t) if t.seq >= seq => Observation::Stale,
            _ if cart.is_abandoned() => Observation::Abandoned {
                needs_notification: !tracked.is_some_and(|t| t.abandoned),
            },
            _ => Observation::NotAbandoned,
        }
    }

    /// Folds a change into the view. Changes at or below the tracked seq are ignored.
    pub async fn apply(&self, seq: Seq, cart: &Cart, buyer: Option<Buyer>) {
        let mut state = self.state.write().await;
        if state
            .tracked
            .get(&cart.cart_id)
            .is_some_and(|t| t.seq >= seq)
        {
            return;
        }
        state.tracked.insert(
            cart.cart_id.clone(),
            Tracked {
                seq,
                abandoned: cart.is_abandoned(),
            },
        );
        if !cart.is_abandoned() {
            state.abandoned.remove(&cart.cart_id);
            return;
        }
        let row = state
            .abandoned
            .entry(cart.cart_id.clone())
            .or_insert_with(|| AbandonedCart {
                cart_id: cart.cart_id.clone(),
                buyer_id: cart.buyer_id.clone(),
                buyer_name: None,
                contact_number: None,
                seq,
            });
        row.seq = seq;
        if row.buyer_id != cart.buyer_id {
            row.buyer_id = cart.buyer_id.clone();
            row.buyer_name = None;
            row.contact_number = None;
        }
        if let Some(buyer) = buyer {
            row.buyer_name = Some(buyer.name);
            row.contact_number = Some(buyer.contact_number);
        }
    }

    pub async fn get(&self, cart_id: &str) -> Option<AbandonedCart> {
        self.state.read().await.abandoned.get(cart_id).cloned()
    }

    /// Abandoned carts ordered by cart id.
    pub async fn abandoned_carts(&self) -> Vec<AbandonedCart> {
        let mut rows: Vec<_> = self.state.read().await.abandoned.values().cloned().collect();
        rows.sort_by(|a, b| a.cart_id.cmp(&b.cart_id));
        rows
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.abandoned.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
