//! Shopping cart documents stored in the monitored container.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CartStatus {
    Active,
    CheckedOut,
    #[serde(alias = "Abondoned")]
    Abandoned,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    #[serde(rename = "id")]
    pub cart_id: String,
    pub buyer_id: String,
    pub order_status: CartStatus,
    #[serde(default)]
    pub items: Vec<CartItem>,
}

impl Cart {
    pub fn is_abandoned(&self) -> bool {
        self.order_status == CartStatus::Abandoned
    }

    pub fn total(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.unit_price * f64::from(item.quantity))
            .sum()
    }
}
