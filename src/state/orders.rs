use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BotError, BotResult};
use crate::persistence::wal::OrphanIntent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "YES" => Some(Side::Yes),
            "NO" => Some(Side::No),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingSubmit,
    Open,
    PartiallyFilled,
    Filled,
    CancelRequested,
    Cancelled,
    PendingUnknown,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingSubmit => "PENDING_SUBMIT",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::CancelRequested => "CANCEL_REQUESTED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::PendingUnknown => "PENDING_UNKNOWN",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

fn transition_legal(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::*;
    if from == to {
        return false;
    }
    match (from, to) {
        // a post-only submit the venue acknowledges and immediately kills
        // lands as CANCELLED without ever resting
        (PendingSubmit, Open | PartiallyFilled | Filled | Cancelled | Rejected | PendingUnknown) => {
            true
        }
        (Open, PartiallyFilled | Filled | CancelRequested | Cancelled | PendingUnknown) => true,
        (PartiallyFilled, Filled | CancelRequested | Cancelled | PendingUnknown) => true,
        // a fill can land while the cancel is in flight
        (CancelRequested, PartiallyFilled | Filled | Cancelled | PendingUnknown) => true,
        (PendingUnknown, Open | PartiallyFilled | Filled | Cancelled) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub order_id: Uuid,
    pub decision_id_hex: String,
    pub market_id: String,
    pub side: Side,
    pub status: OrderStatus,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub price: f64,
    pub size_usd_cents: i64,
    pub filled_usd_cents: i64,
    pub residual_usd_cents: i64,
    pub pending_unknown_since_ms: Option<i64>,
    pub cancel_requested_ms: Option<i64>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub is_paper: bool,
}

impl Order {
    pub fn new(
        decision_id_hex: impl Into<String>,
        market_id: impl Into<String>,
        side: Side,
        client_order_id: impl Into<String>,
        price: f64,
        size_usd_cents: i64,
        is_paper: bool,
        now_ms: i64,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            decision_id_hex: decision_id_hex.into(),
            market_id: market_id.into(),
            side,
            status: OrderStatus::PendingSubmit,
            client_order_id: client_order_id.into(),
            exchange_order_id: None,
            price,
            size_usd_cents,
            filled_usd_cents: 0,
            residual_usd_cents: size_usd_cents,
            pending_unknown_since_ms: None,
            cancel_requested_ms: None,
            created_ms: now_ms,
            updated_ms: now_ms,
            is_paper,
        }
    }
}

/// In-memory order book of our own orders, keyed by order id with a market
/// index. All mutation goes through transition checks; an illegal transition
/// is an invariant breach.
#[derive(Debug, Default)]
pub struct OrderStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    orders: HashMap<Uuid, Order>,
    by_market: HashMap<String, Vec<Uuid>>,
    // at most one successful LIVE submit per decision id, ever
    live_submitted_decisions: HashSet<String>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, order: Order) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .by_market
            .entry(order.market_id.clone())
            .or_default()
            .push(order.order_id);
        inner.orders.insert(order.order_id, order);
    }

    pub fn get(&self, order_id: Uuid) -> Option<Order> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .orders
            .get(&order_id)
            .cloned()
    }

    /// Record that a LIVE submit is about to be issued for this decision.
    /// Returns false when one was already recorded; the caller must not
    /// submit again.
    pub fn try_mark_live_submit(&self, decision_id_hex: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .live_submitted_decisions
            .insert(decision_id_hex.to_string())
    }

    pub fn set_status(&self, order_id: Uuid, to: OrderStatus, now_ms: i64) -> BotResult<Order> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| BotError::Other(format!("unknown order {order_id}")))?;
        if !transition_legal(order.status, to) {
            return Err(BotError::InvalidTransition {
                from: order.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        order.status = to;
        order.updated_ms = now_ms;
        match to {
            OrderStatus::PendingUnknown => {
                order.pending_unknown_since_ms.get_or_insert(now_ms);
            }
            OrderStatus::CancelRequested => {
                order.cancel_requested_ms = Some(now_ms);
            }
            _ => {
                order.pending_unknown_since_ms = None;
            }
        }
        Ok(order.clone())
    }

    pub fn set_exchange_order_id(&self, order_id: Uuid, exchange_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(order) = inner.orders.get_mut(&order_id) {
            order.exchange_order_id = Some(exchange_id.to_string());
        }
    }

    /// Apply a fill. A fill landing while CANCEL_REQUESTED moves the order to
    /// PARTIALLY_FILLED and the residual is recomputed.
    pub fn record_fill(&self, order_id: Uuid, fill_usd_cents: i64, now_ms: i64) -> BotResult<Order> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let order = inner
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| BotError::Other(format!("unknown order {order_id}")))?;

        order.filled_usd_cents = (order.filled_usd_cents + fill_usd_cents).min(order.size_usd_cents);
        order.residual_usd_cents = order.size_usd_cents - order.filled_usd_cents;
        order.updated_ms = now_ms;

        let to = if order.residual_usd_cents == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        if order.status != to {
            if !transition_legal(order.status, to) {
                return Err(BotError::InvalidTransition {
                    from: order.status.as_str().to_string(),
                    to: to.as_str().to_string(),
                });
            }
            order.status = to;
        }
        Ok(order.clone())
    }

    /// Adopt a WAL orphan as PENDING_UNKNOWN (startup replay).
    pub fn adopt_orphan(&self, orphan: &OrphanIntent, now_ms: i64) -> Order {
        let side = Side::parse(&orphan.side).unwrap_or(Side::Yes);
        let mut order = Order::new(
            orphan.decision_id_hex.clone(),
            orphan.market_id.clone(),
            side,
            orphan.client_order_id.clone(),
            orphan.price,
            orphan.size_usd_cents,
            false,
            now_ms,
        );
        order.status = OrderStatus::PendingUnknown;
        order.pending_unknown_since_ms = Some(now_ms);
        // the intent was durably written, so the submit may have gone out
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .live_submitted_decisions
            .insert(orphan.decision_id_hex.clone());
        inner
            .by_market
            .entry(order.market_id.clone())
            .or_default()
            .push(order.order_id);
        inner.orders.insert(order.order_id, order.clone());
        order
    }

    pub fn orders_for_market(&self, market_id: &str) -> Vec<Order> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner
            .by_market
            .get(market_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.orders.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_unknown(&self) -> Vec<Order> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::PendingUnknown)
            .cloned()
            .collect()
    }

    pub fn any_pending_unknown(&self) -> bool {
        !self.pending_unknown().is_empty()
    }

    pub fn pending_unknown_in_market(&self, market_id: &str) -> bool {
        self.orders_for_market(market_id)
            .iter()
            .any(|o| o.status == OrderStatus::PendingUnknown)
    }

    pub fn active(&self) -> Vec<Order> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(store: &OrderStore) -> Order {
        let order = Order::new("dec-1", "mkt-1", Side::Yes, "abcd1234", 0.42, 500, false, 0);
        store.insert(order.clone());
        order
    }

    #[test]
    fn legal_lifecycle_progresses() {
        let store = OrderStore::new();
        let o = order(&store);

        store.set_status(o.order_id, OrderStatus::Open, 1).unwrap();
        let updated = store.record_fill(o.order_id, 200, 2).unwrap();
        assert_eq!(updated.status, OrderStatus::PartiallyFilled);
        assert_eq!(updated.residual_usd_cents, 300);

        let filled = store.record_fill(o.order_id, 300, 3).unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(filled.residual_usd_cents, 0);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let store = OrderStore::new();
        let o = order(&store);

        store.set_status(o.order_id, OrderStatus::Open, 1).unwrap();
        store.set_status(o.order_id, OrderStatus::Cancelled, 2).unwrap();
        let err = store
            .set_status(o.order_id, OrderStatus::Open, 3)
            .unwrap_err();
        assert!(matches!(err, BotError::InvalidTransition { .. }));
    }

    #[test]
    fn fill_during_cancel_becomes_partially_filled() {
        let store = OrderStore::new();
        let o = order(&store);

        store.set_status(o.order_id, OrderStatus::Open, 1).unwrap();
        store
            .set_status(o.order_id, OrderStatus::CancelRequested, 2)
            .unwrap();
        let updated = store.record_fill(o.order_id, 100, 3).unwrap();
        assert_eq!(updated.status, OrderStatus::PartiallyFilled);
        assert_eq!(updated.residual_usd_cents, 400);
    }

    #[test]
    fn live_submit_is_recorded_once() {
        let store = OrderStore::new();
        assert!(store.try_mark_live_submit("dec-1"));
        assert!(!store.try_mark_live_submit("dec-1"));
        assert!(store.try_mark_live_submit("dec-2"));
    }

    #[test]
    fn orphan_adoption_sets_pending_unknown() {
        let store = OrderStore::new();
        let orphan = OrphanIntent {
            decision_id_hex: "dec-9".to_string(),
            market_id: "mkt-9".to_string(),
            side: "NO".to_string(),
            client_order_id: "dec-9cl".to_string(),
            price: 0.3,
            size_usd_cents: 700,
        };
        let adopted = store.adopt_orphan(&orphan, 10);

        assert_eq!(adopted.status, OrderStatus::PendingUnknown);
        assert_eq!(adopted.side, Side::No);
        assert_eq!(adopted.pending_unknown_since_ms, Some(10));
        assert!(store.any_pending_unknown());
        assert!(store.pending_unknown_in_market("mkt-9"));
        // the orphaned decision can never be submitted again
        assert!(!store.try_mark_live_submit("dec-9"));
    }
}
