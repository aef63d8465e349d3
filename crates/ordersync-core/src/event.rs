//! Classification of normalized chain events into order deltas.
//!
//! Field extraction is lenient about representation (numbers may arrive as
//! JSON numbers or decimal strings) but strict about presence: a known event
//! missing a required field is a [`SyncError::MalformedEvent`]. Unknown event
//! names are reported the same way so the caller can log and skip them.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::SyncError;
use crate::order::{DeltaKind, FillAmount, OrderDelta, OrderTerms, OrderType};
use crate::types::ChainEvent;

/// The order events the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEventKind {
    Created,
    Cancelled,
    Filled,
    PriceUpdated,
    SignatureObserved,
}

impl OrderEventKind {
    /// Map an event name (canonical or marketplace contract name) to a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "OrderCreated" | "LogMake" => Some(Self::Created),
            "OrderCancelled" | "LogCancel" => Some(Self::Cancelled),
            "OrderFilled" | "LogMatch" => Some(Self::Filled),
            "OrderPriceUpdated" | "LogUpdatePrice" => Some(Self::PriceUpdated),
            "SignatureObserved" => Some(Self::SignatureObserved),
            _ => None,
        }
    }
}

/// Turn a chain event into an order delta.
pub fn classify(chain: &str, event: &ChainEvent) -> Result<OrderDelta, SyncError> {
    let malformed = |reason: String| SyncError::MalformedEvent {
        chain: chain.to_string(),
        block: event.block_number,
        log_index: event.log_index,
        reason,
    };

    let kind = OrderEventKind::from_name(&event.name)
        .ok_or_else(|| malformed(format!("unknown event '{}'", event.name)))?;
    let fields = &event.fields;

    let order_id = string_field(fields, &["order_id", "orderKey", "order_key"])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .ok_or_else(|| malformed("missing order_id".into()))?;

    let kind = match kind {
        OrderEventKind::Created => DeltaKind::Created(terms(fields).map_err(malformed)?),
        OrderEventKind::Cancelled => DeltaKind::Cancelled,
        OrderEventKind::Filled => {
            let remaining = u64_field(fields, &["remaining", "quantity_remaining"])
                .map_err(&malformed)?;
            let amount = match remaining {
                Some(left) => FillAmount::Remaining(left),
                None => {
                    let reason = "fill carries neither quantity nor remaining";
                    let missing = || malformed(reason.into());
                    let qty = u64_field(fields, &["quantity", "amount", "fill_amount"])
                        .map_err(&malformed)?
                        .ok_or_else(missing)?;
                    FillAmount::Filled(qty)
                }
            };
            DeltaKind::Filled {
                amount,
                taker: string_field(fields, &["taker"]).unwrap_or_default().to_lowercase(),
            }
        }
        OrderEventKind::PriceUpdated => DeltaKind::PriceUpdated {
            price: decimal_field(fields, &["price", "new_price"])
                .map_err(&malformed)?
                .ok_or_else(|| malformed("missing price".into()))?,
        },
        OrderEventKind::SignatureObserved => DeltaKind::SignatureObserved,
    };

    Ok(OrderDelta {
        order_id,
        collection: event.collection.to_lowercase(),
        key: event.key(),
        event_time: event.timestamp,
        kind,
    })
}

fn terms(fields: &Value) -> Result<OrderTerms, String> {
    let order_type = order_type_field(fields)?;
    let price = decimal_field(fields, &["price"])?.ok_or("missing price")?;
    if price.is_sign_negative() {
        return Err(format!("negative price {price}"));
    }
    let size = u64_field(fields, &["size", "amount"])?.ok_or("missing size")?;
    let maker = string_field(fields, &["maker"])
        .filter(|s| !s.is_empty())
        .ok_or("missing maker")?;
    let token_id = string_field(fields, &["token_id", "tokenId"]).unwrap_or_default();
    if token_id.is_empty() && !order_type.is_collection_level() {
        return Err(format!("{order_type:?} order without token_id"));
    }

    Ok(OrderTerms {
        marketplace_id: i64_field(fields, &["marketplace_id"])?.unwrap_or(0),
        order_type,
        token_id,
        currency_address: string_field(fields, &["currency", "currency_address"])
            .unwrap_or_default()
            .to_lowercase(),
        price,
        size,
        maker: maker.to_lowercase(),
        expire_time: i64_field(fields, &["expire_time", "expiry"])?.unwrap_or(0),
        salt: string_field(fields, &["salt"]).unwrap_or_default(),
        signed: fields.get("signed").and_then(Value::as_bool).unwrap_or(true),
    })
}

fn lookup<'a>(fields: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .find_map(|n| fields.get(*n))
        .filter(|v| !v.is_null())
}

fn string_field(fields: &Value, names: &[&str]) -> Option<String> {
    match lookup(fields, names)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn u64_field(fields: &Value, names: &[&str]) -> Result<Option<u64>, String> {
    let Some(v) = lookup(fields, names) else {
        return Ok(None);
    };
    let parsed = match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| format!("{} is not an unsigned integer: {v}", names[0]))
}

fn i64_field(fields: &Value, names: &[&str]) -> Result<Option<i64>, String> {
    let Some(v) = lookup(fields, names) else {
        return Ok(None);
    };
    let parsed = match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| format!("{} is not an integer: {v}", names[0]))
}

fn decimal_field(fields: &Value, names: &[&str]) -> Result<Option<Decimal>, String> {
    let Some(v) = lookup(fields, names) else {
        return Ok(None);
    };
    // Parse from text so JSON floats never introduce binary rounding.
    let text = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return Err(format!("{} is not a decimal: {v}", names[0])),
    };
    Decimal::from_str(&text)
        .map(Some)
        .map_err(|e| format!("{} is not a decimal ({e}): {text}", names[0]))
}

fn order_type_field(fields: &Value) -> Result<OrderType, String> {
    let v = lookup(fields, &["order_type", "orderType"]).ok_or("missing order_type")?;
    let parsed = match v {
        Value::Number(n) => n.as_i64().and_then(OrderType::from_code),
        Value::String(s) => match s.trim().to_ascii_lowercase().replace('_', "").as_str() {
            "listing" | "1" => Some(OrderType::Listing),
            "offer" | "2" => Some(OrderType::Offer),
            "collectionbid" | "3" => Some(OrderType::CollectionBid),
            "itembid" | "4" => Some(OrderType::ItemBid),
            _ => None,
        },
        _ => None,
    };
    parsed.ok_or_else(|| format!("unknown order_type {v}"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, fields: Value) -> ChainEvent {
        ChainEvent {
            name: name.into(),
            collection: "0xCoLL".into(),
            block_number: 100,
            log_index: 3,
            tx_hash: "0xtx".into(),
            timestamp: 1_700_000_000,
            fields,
        }
    }

    #[test]
    fn classifies_creation() {
        let ev = event(
            "OrderCreated",
            json!({
                "order_id": "0xabc",
                "order_type": 1,
                "token_id": "42",
                "currency": "0xETH",
                "price": "0.015",
                "size": "1",
                "maker": "0xMAKER",
                "expire_time": 1_700_003_600,
                "salt": 99,
            }),
        );
        let delta = classify("eth", &ev).unwrap();
        assert_eq!(delta.order_id, "0xabc");
        assert_eq!(delta.collection, "0xcoll");
        assert_eq!(delta.key.block_number, 100);
        let DeltaKind::Created(terms) = delta.kind else {
            panic!("expected creation");
        };
        assert_eq!(terms.order_type, OrderType::Listing);
        assert_eq!(terms.price, Decimal::from_str("0.015").unwrap());
        assert_eq!(terms.maker, "0xmaker");
        assert_eq!(terms.salt, "99");
        assert!(terms.signed);
    }

    #[test]
    fn order_id_is_lowercased() {
        let ev = event("OrderCancelled", json!({ "order_id": "0xAbC" }));
        assert_eq!(classify("eth", &ev).unwrap().order_id, "0xabc");
    }

    #[test]
    fn marketplace_names_are_aliases() {
        let ev = event("LogCancel", json!({ "orderKey": "0xabc" }));
        assert_eq!(classify("eth", &ev).unwrap().kind, DeltaKind::Cancelled);
    }

    #[test]
    fn fill_prefers_remaining() {
        let ev = event("OrderFilled", json!({ "order_id": "0x1", "quantity": 2, "remaining": 0, "taker": "0xBOB" }));
        let delta = classify("eth", &ev).unwrap();
        assert_eq!(
            delta.kind,
            DeltaKind::Filled {
                amount: FillAmount::Remaining(0),
                taker: "0xbob".into()
            }
        );
    }

    #[test]
    fn unknown_event_is_malformed() {
        let err = classify("eth", &event("Approval", json!({}))).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEvent { log_index: 3, .. }));
    }

    #[test]
    fn missing_fields_are_malformed() {
        assert!(classify("eth", &event("OrderCancelled", json!({}))).is_err());
        assert!(classify("eth", &event("OrderFilled", json!({ "order_id": "0x1" }))).is_err());
        let no_token = json!({
            "order_id": "0x1", "order_type": "item_bid", "price": "1",
            "size": 1, "maker": "0xm",
        });
        assert!(classify("eth", &event("OrderCreated", no_token)).is_err());
    }

    #[test]
    fn collection_bid_needs_no_token() {
        let ev = event(
            "OrderCreated",
            json!({
                "order_id": "0x1", "order_type": "collection_bid", "price": 2,
                "size": 3, "maker": "0xm", "signed": false,
            }),
        );
        let DeltaKind::Created(terms) = classify("eth", &ev).unwrap().kind else {
            panic!("expected creation");
        };
        assert_eq!(terms.order_type, OrderType::CollectionBid);
        assert!(!terms.signed);
    }

    #[test]
    fn float_price_is_parsed_from_text() {
        let ev = event("OrderPriceUpdated", json!({ "order_id": "0x1", "price": 0.1 }));
        let DeltaKind::PriceUpdated { price } = classify("eth", &ev).unwrap().kind else {
            panic!("expected price update");
        };
        assert_eq!(price, Decimal::from_str("0.1").unwrap());
    }
}
