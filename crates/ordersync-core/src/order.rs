//! The order record and the deltas that mutate it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::EventKey;

// ─── OrderType ────────────────────────────────────────────────────────────────

/// Kind of order. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Listing,
    Offer,
    CollectionBid,
    ItemBid,
}

impl OrderType {
    /// Numeric code used by the marketplace contract and the order tables.
    pub fn code(self) -> i64 {
        match self {
            Self::Listing => 1,
            Self::Offer => 2,
            Self::CollectionBid => 3,
            Self::ItemBid => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Listing),
            2 => Some(Self::Offer),
            3 => Some(Self::CollectionBid),
            4 => Some(Self::ItemBid),
            _ => None,
        }
    }

    /// Collection-level bids carry no token id.
    pub fn is_collection_level(self) -> bool {
        matches!(self, Self::CollectionBid)
    }
}

// ─── OrderStatus ──────────────────────────────────────────────────────────────

/// Lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Active,
    Inactive,
    Expired,
    Cancelled,
    Filled,
    NeedSign,
}

impl OrderStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Active => 0,
            Self::Inactive => 1,
            Self::Expired => 2,
            Self::Cancelled => 3,
            Self::Filled => 4,
            Self::NeedSign => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Active),
            1 => Some(Self::Inactive),
            2 => Some(Self::Expired),
            3 => Some(Self::Cancelled),
            4 => Some(Self::Filled),
            5 => Some(Self::NeedSign),
            _ => None,
        }
    }

    /// Expired, Cancelled and Filled orders never change again outside a rollback.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled | Self::Filled)
    }

    /// Statuses the expiry sweep looks at.
    pub fn is_expirable(self) -> bool {
        matches!(self, Self::Active | Self::Inactive | Self::NeedSign)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Expired => write!(f, "expired"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Filled => write!(f, "filled"),
            Self::NeedSign => write!(f, "need-sign"),
        }
    }
}

// ─── Order ────────────────────────────────────────────────────────────────────

/// One row of the order book for a chain partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub marketplace_id: i64,
    pub order_type: OrderType,
    pub collection_address: String,
    /// Empty for collection-level bids.
    pub token_id: String,
    pub currency_address: String,
    pub price: Decimal,
    pub size: u64,
    pub quantity_remaining: u64,
    pub maker: String,
    /// Empty until a fill names a counterparty.
    pub taker: String,
    /// Timestamp of the chain event that produced the current state.
    pub event_time: i64,
    /// Seconds since epoch; `0` means the order never expires.
    pub expire_time: i64,
    pub salt: String,
    pub status: OrderStatus,
    /// Milliseconds since epoch, assigned by the order manager.
    pub create_time: i64,
    /// Milliseconds since epoch, assigned by the order manager.
    pub update_time: i64,
}

impl Order {
    /// Returns `true` if the order has passed its expiry time at `now` (seconds).
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expire_time > 0 && now >= self.expire_time
    }
}

// ─── Deltas ───────────────────────────────────────────────────────────────────

/// Immutable terms of an order, carried by its creation event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerms {
    #[serde(default)]
    pub marketplace_id: i64,
    pub order_type: OrderType,
    #[serde(default)]
    pub token_id: String,
    pub currency_address: String,
    pub price: Decimal,
    pub size: u64,
    pub maker: String,
    #[serde(default)]
    pub expire_time: i64,
    #[serde(default)]
    pub salt: String,
    /// `false` while the maker's signature is still pending.
    #[serde(default = "default_signed")]
    pub signed: bool,
}

fn default_signed() -> bool {
    true
}

/// How much of an order a fill consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillAmount {
    /// Quantity taken by this fill.
    Filled(u64),
    /// Quantity left on chain after this fill.
    Remaining(u64),
}

/// The change a single chain event makes to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeltaKind {
    Created(OrderTerms),
    Cancelled,
    Filled {
        amount: FillAmount,
        #[serde(default)]
        taker: String,
    },
    PriceUpdated {
        price: Decimal,
    },
    SignatureObserved,
}

impl DeltaKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Cancelled => "cancelled",
            Self::Filled { .. } => "filled",
            Self::PriceUpdated { .. } => "price-updated",
            Self::SignatureObserved => "signature-observed",
        }
    }
}

/// A normalized order change derived from one chain event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDelta {
    pub order_id: String,
    pub collection: String,
    /// Position of the originating event.
    pub key: EventKey,
    /// Timestamp of the originating event (seconds).
    pub event_time: i64,
    pub kind: DeltaKind,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_order_tables() {
        for status in [
            OrderStatus::Active,
            OrderStatus::Inactive,
            OrderStatus::Expired,
            OrderStatus::Cancelled,
            OrderStatus::Filled,
            OrderStatus::NeedSign,
        ] {
            assert_eq!(OrderStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(OrderStatus::from_code(9), None);
        assert_eq!(OrderType::from_code(3), Some(OrderType::CollectionBid));
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
        assert!(!OrderStatus::Inactive.is_terminal());
        assert!(!OrderStatus::NeedSign.is_terminal());
    }

    #[test]
    fn delta_kind_json_shape() {
        let kind = DeltaKind::Filled {
            amount: FillAmount::Remaining(0),
            taker: "0xbob".into(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "filled");
        assert_eq!(json["amount"]["remaining"], 0);
        let back: DeltaKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }
}
