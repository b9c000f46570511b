//! Synthetic shopper traffic written into the in-memory change feed.

use std::sync::Arc;
use std::time::Duration;

use cartfeed_runtime::{InMemoryChangeFeed, SourceError, StopSignal};
use log::debug;

use crate::buyer::Buyer;
use crate::cart::{Cart, CartItem, CartStatus};

/// Buyers the demo seeds into the directory.
pub fn demo_buyers() -> Vec<Buyer> {
    [
        ("buyer-1", "Ada Lovelace", "+44 20 7946 0001"),
        ("buyer-2", "Grace Hopper", "+1 202 555 0102"),
        ("buyer-3", "Alan Turing", "+44 20 7946 0003"),
    ]
    .into_iter()
    .map(|(id, name, contact)| Buyer {
        id: id.to_string(),
        name: name.to_string(),
        contact_number: contact.to_string(),
    })
    .collect()
}

/// Writes one cart through its lifecycle: created, filled, then checked out or abandoned.
pub fn write_cart_lifecycle(
    feed: &InMemoryChangeFeed,
    cart_id: &str,
    buyer_id: &str,
    abandon: bool,
) -> Result<(), SourceError> {
    let mut cart = Cart {
        cart_id: cart_id.to_string(),
        buyer_id: buyer_id.to_string(),
        order_status: CartStatus::Active,
        items: Vec::new(),
    };
    upsert(feed, &cart)?;
    cart.items.push(CartItem {
        sku: "SKU-1001".into(),
        quantity: 2,
        unit_price: 12.5,
    });
    upsert(feed, &cart)?;
    cart.order_status = if abandon {
        CartStatus::Abandoned
    } else {
        CartStatus::CheckedOut
    };
    upsert(feed, &cart)
}

fn upsert(feed: &InMemoryChangeFeed, cart: &Cart) -> Result<(), SourceError> {
    let document = serde_json::to_value(cart)
        .map_err(|e| SourceError::Unavailable(format!("cannot encode cart: {e}")))?;
    let record = feed.upsert(&cart.cart_id, document)?;
    debug!(
        "cart {} -> {:?} at seq {} in partition {}",
        cart.cart_id, cart.order_status, record.seq, record.partition_id
    );
    Ok(())
}

/// Writes a cart lifecycle every `interval` until stopped. Every third cart is abandoned.
pub async fn simulate_shoppers(
    feed: Arc<InMemoryChangeFeed>,
    buyers: Vec<Buyer>,
    interval: Duration,
    stop: StopSignal,
) -> Result<u64, SourceError> {
    let mut written = 0u64;
    while !buyers.is_empty() && !stop.sleep_or_stop(interval).await {
        let buyer = &buyers[(written as usize) % buyers.len()];
        let cart_id = format!("cart-{}", uuid::Uuid::new_v4());
        write_cart_lifecycle(&feed, &cart_id, &buyer.id, written % 3 == 2)?;
        written += 1;
    }
    Ok(written)
}
