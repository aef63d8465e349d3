//! Order lifecycle state machine.
//!
//! An order's row is never mutated in place. Each order keeps a snapshot of
//! the chain-derived state folded from old deltas plus the recent deltas
//! themselves, ordered by `(block, log_index)`. The row is rebuilt by folding
//! the history and then overlaying the states that do not come from chain
//! events:
//!
//! ```text
//! snapshot ──fold(history)──▶ chain state ──overlay(now, suspended, expired)──▶ row
//! ```
//!
//! Redelivery is a no-op (the key is already in the history), a late delta
//! is merged at its position, and a rollback drops the tail of the history
//! and folds again.

use serde::{Deserialize, Serialize};

use crate::order::{DeltaKind, FillAmount, Order, OrderDelta, OrderStatus, OrderTerms};
use crate::types::EventKey;

/// Everything the order manager persists for one order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOrder {
    pub order_id: String,
    /// The queryable row. `None` while only orphan deltas are known.
    pub order: Option<Order>,
    /// Chain-derived state of deltas that fell out of the history window.
    pub snapshot: Option<Order>,
    /// Key of the last delta folded into `snapshot`.
    pub snapshot_key: Option<EventKey>,
    /// Retained deltas, ascending by key.
    pub history: Vec<OrderDelta>,
    /// The maker failed the last balance/allowance check.
    pub suspended: bool,
    /// Set once the order has been observed past its expiry time.
    pub expired: bool,
}

/// Result of merging a delta into a [`StoredOrder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Inserted,
    /// The exact key was already applied.
    Duplicate,
    /// The key is at or below the compacted snapshot, or it is behind the
    /// last applied key and would change a terminal status.
    Stale,
}

impl StoredOrder {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            ..Default::default()
        }
    }

    /// Key of the most recent delta folded into this order.
    pub fn last_applied(&self) -> Option<EventKey> {
        self.history.last().map(|d| d.key).or(self.snapshot_key)
    }

    /// Current status of the row, if one exists.
    pub fn status(&self) -> Option<OrderStatus> {
        self.order.as_ref().map(|o| o.status)
    }

    /// Returns `true` when nothing is left to keep for this order.
    pub fn is_empty(&self) -> bool {
        self.order.is_none() && self.snapshot.is_none() && self.history.is_empty()
    }

    /// Merge a delta into the history at its key position.
    pub fn merge(&mut self, delta: OrderDelta) -> Merge {
        if self.snapshot_key.is_some_and(|k| delta.key <= k) {
            return Merge::Stale;
        }
        let pos = match self.history.binary_search_by(|d| d.key.cmp(&delta.key)) {
            Ok(_) => return Merge::Duplicate,
            Err(pos) => pos,
        };
        let behind = self.last_applied().is_some_and(|k| delta.key < k);
        let terminal = if behind {
            self.chain_state().map(|o| o.status).filter(|s| s.is_terminal())
        } else {
            None
        };
        self.history.insert(pos, delta);
        // A late delta may refine a terminal order but never flip its status.
        if let Some(before) = terminal {
            if self.chain_state().map(|o| o.status) != Some(before) {
                self.history.remove(pos);
                return Merge::Stale;
            }
        }
        Merge::Inserted
    }

    /// Fold snapshot and history into the chain-derived state.
    pub fn chain_state(&self) -> Option<Order> {
        fold(self.snapshot.clone(), &self.history)
    }

    /// Rebuild the row at `now` (seconds). Does not touch bookkeeping times.
    pub fn materialize(&self, now: i64) -> Option<Order> {
        let mut order = self.chain_state()?;
        if self.expired {
            order.status = OrderStatus::Expired;
        } else if !order.status.is_terminal() {
            if order.is_expired_at(now) {
                order.status = OrderStatus::Expired;
            } else if self.suspended && order.status == OrderStatus::Active {
                order.status = OrderStatus::Inactive;
            }
        }
        Some(order)
    }

    /// Rebuild the row and store it, stamping bookkeeping times from the
    /// previous row. Returns `true` if status, price or existence changed.
    pub fn refresh(&mut self, now: i64, now_ms: i64) -> bool {
        let previous = self.order.take();
        let mut next = self.materialize(now);
        if let Some(order) = next.as_mut() {
            stamp(previous.as_ref(), order, now_ms);
            if order.status == OrderStatus::Expired {
                self.expired = true;
            }
        }
        let changed = match (&previous, &next) {
            (None, None) => false,
            (Some(a), Some(b)) => a.status != b.status || a.price != b.price,
            _ => true,
        };
        self.order = next;
        changed
    }

    /// Drop every delta at or above `height`.
    ///
    /// Returns `Err(snapshot_block)` if the rollback reaches into the compacted
    /// snapshot, `Ok(false)` if nothing was dropped.
    pub fn rollback(&mut self, height: u64) -> Result<bool, u64> {
        if let Some(k) = self.snapshot_key {
            if k.block_number >= height {
                return Err(k.block_number);
            }
        }
        let before = self.history.len();
        self.history.retain(|d| d.key.block_number < height);
        if self.history.len() == before {
            return Ok(false);
        }
        // Expiry is time-based and is re-derived on the next refresh.
        self.expired = false;
        Ok(true)
    }

    /// Fold deltas below `cutoff` (block number) into the snapshot.
    ///
    /// Orphan deltas (no creation seen yet) wait for their creation until they
    /// fall below `cutoff`, then they are dropped.
    pub fn compact(&mut self, cutoff: u64) {
        let split = self.history.partition_point(|d| d.key.block_number < cutoff);
        if split == 0 {
            return;
        }
        let older = &self.history[..split];
        if let Some(snapshot) = fold(self.snapshot.clone(), older) {
            self.snapshot_key = Some(older[split - 1].key);
            self.snapshot = Some(snapshot);
        }
        self.history.drain(..split);
    }
}

/// Fold deltas (ascending by key) over an optional starting state.
pub fn fold(base: Option<Order>, deltas: &[OrderDelta]) -> Option<Order> {
    deltas.iter().fold(base, step)
}

/// Apply one delta to the chain-derived state.
pub fn step(state: Option<Order>, delta: &OrderDelta) -> Option<Order> {
    let mut order = match (state, &delta.kind) {
        (None, DeltaKind::Created(terms)) => return Some(create(delta, terms)),
        // Waiting for the creation; the delta stays in the history.
        (None, _) => return None,
        // Second creation for the same id.
        (Some(order), DeltaKind::Created(_)) => return Some(order),
        (Some(order), _) if order.status.is_terminal() => return Some(order),
        (Some(order), _) => order,
    };

    match &delta.kind {
        DeltaKind::Created(_) => {}
        DeltaKind::Cancelled => order.status = OrderStatus::Cancelled,
        DeltaKind::Filled { amount, taker } => {
            let remaining = match *amount {
                FillAmount::Filled(qty) => order.quantity_remaining.saturating_sub(qty),
                FillAmount::Remaining(left) => left.min(order.quantity_remaining),
            };
            order.quantity_remaining = remaining;
            if !taker.is_empty() {
                order.taker = taker.clone();
            }
            if remaining == 0 {
                order.status = OrderStatus::Filled;
            } else if order.status == OrderStatus::NeedSign {
                // A fill proves the signature was accepted on chain.
                order.status = OrderStatus::Active;
            }
        }
        DeltaKind::PriceUpdated { price } => order.price = *price,
        DeltaKind::SignatureObserved => {
            if order.status == OrderStatus::NeedSign {
                order.status = OrderStatus::Active;
            }
        }
    }
    order.event_time = delta.event_time;
    Some(order)
}

fn create(delta: &OrderDelta, terms: &OrderTerms) -> Order {
    let status = if terms.size == 0 {
        OrderStatus::Filled
    } else if terms.signed {
        OrderStatus::Active
    } else {
        OrderStatus::NeedSign
    };
    Order {
        order_id: delta.order_id.clone(),
        marketplace_id: terms.marketplace_id,
        order_type: terms.order_type,
        collection_address: delta.collection.clone(),
        token_id: if terms.order_type.is_collection_level() {
            String::new()
        } else {
            terms.token_id.clone()
        },
        currency_address: terms.currency_address.clone(),
        price: terms.price,
        size: terms.size,
        quantity_remaining: terms.size,
        maker: terms.maker.clone(),
        taker: String::new(),
        event_time: delta.event_time,
        expire_time: terms.expire_time,
        salt: terms.salt.clone(),
        status,
        create_time: 0,
        update_time: 0,
    }
}

/// Carry `create_time` over from the previous row and keep `update_time`
/// monotonic and never below `create_time`.
pub fn stamp(previous: Option<&Order>, next: &mut Order, now_ms: i64) {
    match previous {
        Some(prev) => {
            next.create_time = prev.create_time;
            next.update_time = now_ms.max(prev.update_time);
        }
        None => {
            next.create_time = now_ms;
            next.update_time = now_ms;
        }
    }
    if next.update_time < next.create_time {
        next.update_time = next.create_time;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderType;
    use rust_decimal::Decimal;

    fn terms(size: u64, expire_time: i64, signed: bool) -> OrderTerms {
        OrderTerms {
            marketplace_id: 1,
            order_type: OrderType::Listing,
            token_id: "7".into(),
            currency_address: "0xeth".into(),
            price: Decimal::new(15, 1),
            size,
            maker: "0xmaker".into(),
            expire_time,
            salt: "1".into(),
            signed,
        }
    }

    fn delta(block: u64, log: u32, kind: DeltaKind) -> OrderDelta {
        OrderDelta {
            order_id: "0xorder".into(),
            collection: "0xcoll".into(),
            key: EventKey::new(block, log),
            event_time: block as i64 * 12,
            kind,
        }
    }

    fn created(block: u64, size: u64) -> OrderDelta {
        delta(block, 0, DeltaKind::Created(terms(size, 0, true)))
    }

    fn fill(block: u64, log: u32, qty: u64) -> OrderDelta {
        delta(
            block,
            log,
            DeltaKind::Filled {
                amount: FillAmount::Filled(qty),
                taker: "0xtaker".into(),
            },
        )
    }

    fn record(deltas: Vec<OrderDelta>) -> StoredOrder {
        let mut rec = StoredOrder::new("0xorder");
        for d in deltas {
            rec.merge(d);
        }
        rec.refresh(0, 1_000);
        rec
    }

    #[test]
    fn creation_status_depends_on_signature() {
        let signed = step(None, &created(1, 1)).unwrap();
        assert_eq!(signed.status, OrderStatus::Active);
        assert_eq!(signed.quantity_remaining, 1);

        let pending = step(None, &delta(1, 0, DeltaKind::Created(terms(1, 0, false)))).unwrap();
        assert_eq!(pending.status, OrderStatus::NeedSign);

        let signed_later = step(Some(pending), &delta(2, 0, DeltaKind::SignatureObserved)).unwrap();
        assert_eq!(signed_later.status, OrderStatus::Active);
    }

    #[test]
    fn partial_then_full_fill() {
        let rec = record(vec![created(1, 5), fill(2, 0, 2)]);
        let order = rec.order.as_ref().unwrap();
        assert_eq!(order.status, OrderStatus::Active);
        assert_eq!(order.quantity_remaining, 3);
        assert_eq!(order.taker, "0xtaker");

        let rec = record(vec![created(1, 5), fill(2, 0, 2), fill(3, 0, 3)]);
        let order = rec.order.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.quantity_remaining, 0);
    }

    #[test]
    fn remaining_fill_never_increases_quantity() {
        let rec = record(vec![
            created(1, 5),
            fill(2, 0, 4),
            delta(
                3,
                0,
                DeltaKind::Filled {
                    amount: FillAmount::Remaining(3),
                    taker: String::new(),
                },
            ),
        ]);
        assert_eq!(rec.order.unwrap().quantity_remaining, 1);
    }

    #[test]
    fn terminal_state_ignores_later_deltas() {
        let rec = record(vec![
            created(1, 2),
            delta(2, 0, DeltaKind::Cancelled),
            fill(3, 0, 2),
            delta(4, 0, DeltaKind::PriceUpdated { price: Decimal::new(9, 0) }),
        ]);
        let order = rec.order.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.quantity_remaining, 2);
        assert_eq!(order.price, Decimal::new(15, 1));
    }

    #[test]
    fn duplicate_and_stale_merges() {
        let mut rec = record(vec![created(1, 1), fill(5, 0, 1)]);
        assert_eq!(rec.merge(fill(5, 0, 1)), Merge::Duplicate);
        // Filled is terminal, a lower key is stale.
        assert_eq!(rec.merge(delta(3, 0, DeltaKind::Cancelled)), Merge::Stale);
        assert_eq!(rec.status(), Some(OrderStatus::Filled));
    }

    #[test]
    fn late_fill_before_cancel_is_kept() {
        let canonical = record(vec![
            created(10, 5),
            fill(11, 3, 2),
            delta(11, 5, DeltaKind::Cancelled),
        ]);
        let mut late = record(vec![created(10, 5), delta(11, 5, DeltaKind::Cancelled)]);
        assert_eq!(late.merge(fill(11, 3, 2)), Merge::Inserted);
        late.refresh(0, 2_000);

        let (a, b) = (canonical.order.unwrap(), late.order.unwrap());
        assert_eq!(b.status, OrderStatus::Cancelled);
        assert_eq!(b.quantity_remaining, 3);
        assert_eq!(a.quantity_remaining, b.quantity_remaining);
    }

    #[test]
    fn out_of_order_fills_converge() {
        let mut rec = record(vec![created(1, 5), fill(9, 7, 3)]);
        assert_eq!(rec.status(), Some(OrderStatus::Active));
        assert_eq!(rec.merge(fill(9, 3, 2)), Merge::Inserted);
        rec.refresh(0, 2_000);
        let order = rec.order.unwrap();
        assert_eq!(order.quantity_remaining, 0);
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[test]
    fn orphan_delta_waits_for_creation() {
        let mut rec = record(vec![fill(4, 0, 1)]);
        assert!(rec.order.is_none());
        rec.merge(created(2, 3));
        rec.refresh(0, 1_000);
        assert_eq!(rec.order.unwrap().quantity_remaining, 2);
    }

    #[test]
    fn expiry_overlay_is_sticky() {
        let mut rec = StoredOrder::new("0xorder");
        rec.merge(delta(1, 0, DeltaKind::Created(terms(1, 100, true))));
        rec.refresh(50, 1_000);
        assert_eq!(rec.status(), Some(OrderStatus::Active));

        rec.refresh(100, 2_000);
        assert_eq!(rec.status(), Some(OrderStatus::Expired));
        assert!(rec.expired);

        rec.merge(delta(2, 0, DeltaKind::Cancelled));
        rec.refresh(100, 3_000);
        assert_eq!(rec.status(), Some(OrderStatus::Expired));
    }

    #[test]
    fn suspended_maker_is_inactive() {
        let mut rec = record(vec![created(1, 1)]);
        rec.suspended = true;
        assert!(rec.refresh(0, 2_000));
        assert_eq!(rec.status(), Some(OrderStatus::Inactive));
        rec.suspended = false;
        assert!(rec.refresh(0, 3_000));
        assert_eq!(rec.status(), Some(OrderStatus::Active));
    }

    #[test]
    fn rollback_reopens_cancelled_order() {
        let mut rec = record(vec![created(10, 1), delta(12, 0, DeltaKind::Cancelled)]);
        assert_eq!(rec.status(), Some(OrderStatus::Cancelled));
        assert_eq!(rec.rollback(11), Ok(true));
        rec.refresh(0, 2_000);
        assert_eq!(rec.status(), Some(OrderStatus::Active));
        assert_eq!(rec.rollback(11), Ok(false));
    }

    #[test]
    fn rollback_below_creation_removes_row() {
        let mut rec = record(vec![created(10, 1)]);
        rec.rollback(10).unwrap();
        assert!(rec.refresh(0, 2_000));
        assert!(rec.order.is_none());
        assert!(rec.is_empty());
    }

    #[test]
    fn compaction_keeps_state_and_bounds_rollback() {
        let mut rec = record(vec![created(1, 5), fill(2, 0, 1), fill(8, 0, 1)]);
        rec.compact(5);
        assert_eq!(rec.history.len(), 1);
        assert_eq!(rec.snapshot_key, Some(EventKey::new(2, 0)));
        assert_eq!(rec.materialize(0).unwrap().quantity_remaining, 3);

        assert_eq!(rec.merge(fill(2, 0, 1)), Merge::Stale);
        assert_eq!(rec.rollback(2), Err(2));
        assert_eq!(rec.rollback(3), Ok(true));
    }

    #[test]
    fn compaction_drops_orphans_below_cutoff() {
        let mut rec = record(vec![fill(2, 0, 1), fill(8, 0, 1)]);
        rec.compact(5);
        assert_eq!(rec.history.len(), 1);
        assert!(rec.snapshot.is_none());
        assert!(rec.snapshot_key.is_none());

        rec.compact(9);
        assert!(rec.is_empty());
    }

    #[test]
    fn stamp_keeps_times_monotonic() {
        let mut first = step(None, &created(1, 1)).unwrap();
        stamp(None, &mut first, 5_000);
        assert_eq!((first.create_time, first.update_time), (5_000, 5_000));

        let mut second = first.clone();
        stamp(Some(&first), &mut second, 4_000);
        assert_eq!(second.create_time, 5_000);
        assert_eq!(second.update_time, 5_000);
    }
}
