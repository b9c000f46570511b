//! Partition leases: durable ownership records, checkpoints and rebalancing.

mod balance;
#[cfg(test)]
pub(crate) mod contract;
mod manager;
mod memory;
#[cfg(feature = "lease-postgres")]
mod postgres;
mod repository;
#[cfg(feature = "sqlite-persistence")]
mod sqlite;

pub use balance::{plan, RebalancePlan};
pub use manager::{LeaseHandle, LeaseManager};
pub use memory::InMemoryLeaseRepository;
#[cfg(feature = "lease-postgres")]
pub use postgres::PostgresLeaseRepository;
pub use repository::LeaseRepository;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteLeaseRepository;
