//! Abandoned-cart notifier.
//!
//! Watches the cart container's change feed through a lease-coordinated
//! processor, keeps a materialized view of abandoned carts and looks up the
//! buyer of every cart that becomes abandoned.

pub mod buyer;
pub mod cart;
pub mod handler;
pub mod settings;
pub mod simulator;
pub mod view;

pub use buyer::{Buyer, BuyerDirectory, BuyerLookup, DirectoryError, InMemoryBuyerDirectory};
pub use cart::{Cart, CartItem, CartStatus};
pub use handler::AbandonedCartHandler;
pub use settings::{AppSettings, LeaseStoreSettings, SettingsError};
pub use view::{AbandonedCart, AbandonedCartView, Observation};
