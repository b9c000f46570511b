//! Buyer records and the directory used to enrich abandoned carts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Buyer {
    pub id: String,
    pub name: String,
    pub contact_number: String,
}

/// A point read of one buyer and the read units it cost.
#[derive(Clone, Debug, PartialEq)]
pub struct BuyerLookup {
    pub buyer: Buyer,
    pub request_charge: f64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DirectoryError {
    #[error("buyer {0} not found")]
    NotFound(String),
    #[error("buyer directory unavailable: {0}")]
    Unavailable(String),
}

/// Point reads of buyers by id.
#[async_trait]
pub trait BuyerDirectory: Send + Sync {
    async fn read_buyer(&self, buyer_id: &str) -> Result<BuyerLookup, DirectoryError>;
}

#[derive(Default)]
struct DirectoryState {
    buyers: HashMap<String, Buyer>,
    lookups: HashMap<String, u32>,
}

/// Buyer directory held in memory, counting lookups per buyer.
#[derive(Default)]
pub struct InMemoryBuyerDirectory {
    state: Mutex<DirectoryState>,
    failures: AtomicU32,
}

impl InMemoryBuyerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, DirectoryState>, DirectoryError> {
        self.state
            .lock()
            .map_err(|_| DirectoryError::Unavailable("buyer directory poisoned".into()))
    }

    pub fn insert(&self, buyer: Buyer) -> Result<(), DirectoryError> {
        self.state()?.buyers.insert(buyer.id.clone(), buyer);
        Ok(())
    }

    /// Makes the next `count` reads fail as unavailable.
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Successful reads of `buyer_id` so far.
    pub fn lookups_for(&self, buyer_id: &str) -> u32 {
        self.state()
            .map(|s| s.lookups.get(buyer_id).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn total_lookups(&self) -> u32 {
        self.state()
            .map(|s| s.lookups.values().sum())
            .unwrap_or_default()
    }

    fn read_sync(&self, buyer_id: &str) -> Result<BuyerLookup, DirectoryError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DirectoryError::Unavailable("injected failure".into()));
        }
        let mut state = self.state()?;
        let buyer = state
            .buyers
            .get(buyer_id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(buyer_id.to_string()))?;
        *state.lookups.entry(buyer_id.to_string()).or_default() += 1;
        Ok(BuyerLookup {
            buyer,
            request_charge: 1.0,
        })
    }
}

#[async_trait]
impl BuyerDirectory for InMemoryBuyerDirectory {
    async fn read_buyer(&self, buyer_id: &str) -> Result<BuyerLookup, DirectoryError> {
        self.read_sync(buyer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ada() -> Buyer {
        Buyer {
            id: "b1".into(),
            name: "Ada".into(),
            contact_number: "555-0100".into(),
        }
    }

    #[tokio::test]
    async fn reads_are_counted_per_buyer() {
        let directory = InMemoryBuyerDirectory::new();
        directory.insert(ada()).expect("insert");
        let lookup = directory.read_buyer("b1").await.expect("read");
        assert_eq!(lookup.buyer.name, "Ada");
        assert_eq!(directory.lookups_for("b1"), 1);
        assert_eq!(
            directory.read_buyer("nobody").await,
            Err(DirectoryError::NotFound("nobody".into()))
        );
        assert_eq!(directory.total_lookups(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_unavailable() {
        let directory = InMemoryBuyerDirectory::new();
        directory.insert(ada()).expect("insert");
        directory.inject_failures(1);
        assert!(matches!(
            directory.read_buyer("b1").await,
            Err(DirectoryError::Unavailable(_))
        ));
        assert!(directory.read_buyer("b1").await.is_ok());
    }
}
