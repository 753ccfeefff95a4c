use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::state::orders::{Order, OrderStatus, OrderStore};

pub const PAPER_SUSTAIN_MS: i64 = 3_000;
pub const PAPER_MIN_FEE_BPS: f64 = 10.0;
pub const PAPER_FEE_MULT: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PaperFill {
    pub order_id: Uuid,
    pub fill_price: f64,
    pub fill_usd_cents: i64,
    pub fee_usd_cents: i64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct TradeThrough {
    first_through_ms: i64,
}

/// Pessimistic PAPER fills: no touch-fills. A resting buy fills only after
/// the ask trades through the limit by at least one tick and stays through
/// for three seconds; the fill prints at the limit with the doubled fee
/// floor. PAPER orders never touch the WAL.
#[derive(Debug)]
pub struct PaperEngine {
    tick_size: f64,
    actual_fee_bps: f64,
    pending: Mutex<HashMap<Uuid, TradeThrough>>,
}

impl PaperEngine {
    pub fn new(tick_size: f64, actual_fee_bps: f64) -> Self {
        Self {
            tick_size,
            actual_fee_bps,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn fee_usd_cents(&self, size_usd_cents: i64) -> i64 {
        let fee_bps = self.actual_fee_bps.max(PAPER_MIN_FEE_BPS) * PAPER_FEE_MULT;
        ((size_usd_cents as f64) * fee_bps / 10_000.0).round() as i64
    }

    /// Process a book update for one market; returns the fills it produced.
    /// `best_ask` is the ask of the token each order is buying.
    pub fn on_book_update(
        &self,
        store: &OrderStore,
        market_id: &str,
        best_ask_for: impl Fn(&Order) -> Option<f64>,
        now_ms: i64,
    ) -> Vec<PaperFill> {
        let mut fills = Vec::new();
        for order in store.orders_for_market(market_id) {
            if !order.is_paper
                || !matches!(
                    order.status,
                    OrderStatus::Open | OrderStatus::PartiallyFilled
                )
            {
                continue;
            }
            let Some(ask) = best_ask_for(&order) else {
                continue;
            };
            if let Some(fill) = self.check_fill(&order, ask, now_ms) {
                if store
                    .record_fill(order.order_id, fill.fill_usd_cents, now_ms)
                    .is_ok()
                {
                    tracing::info!(
                        target: "paper",
                        order_id = %order.order_id,
                        price = fill.fill_price,
                        fee_cents = fill.fee_usd_cents,
                        "paper fill"
                    );
                    fills.push(fill);
                }
            }
        }
        fills
    }

    fn check_fill(&self, order: &Order, best_ask: f64, now_ms: i64) -> Option<PaperFill> {
        let through = best_ask <= order.price - self.tick_size;
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());

        if !through {
            // price pulled back above the limit: the clock restarts
            pending.remove(&order.order_id);
            return None;
        }

        let entry = pending
            .entry(order.order_id)
            .or_insert(TradeThrough {
                first_through_ms: now_ms,
            });
        if now_ms - entry.first_through_ms < PAPER_SUSTAIN_MS {
            return None;
        }
        pending.remove(&order.order_id);

        Some(PaperFill {
            order_id: order.order_id,
            // pessimistic: filled at our limit, not the better print
            fill_price: order.price,
            fill_usd_cents: order.residual_usd_cents,
            fee_usd_cents: self.fee_usd_cents(order.residual_usd_cents),
            ts_ms: now_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::orders::Side;

    fn paper_order(store: &OrderStore, price: f64) -> Order {
        let order = Order::new("dec-1", "mkt-1", Side::Yes, "coid", price, 500, true, 0);
        store.insert(order.clone());
        store
            .set_status(order.order_id, OrderStatus::Open, 0)
            .expect("open")
    }

    #[test]
    fn touch_is_not_a_fill() {
        let store = OrderStore::new();
        let engine = PaperEngine::new(0.01, 0.0);
        let order = paper_order(&store, 0.40);

        // ask exactly at the limit: no trade-through
        let fills = engine.on_book_update(&store, "mkt-1", |_| Some(0.40), 1_000);
        assert!(fills.is_empty());
        // still no fill seconds later
        let fills = engine.on_book_update(&store, "mkt-1", |_| Some(0.40), 10_000);
        assert!(fills.is_empty());
        assert_eq!(store.get(order.order_id).unwrap().status, OrderStatus::Open);
    }

    #[test]
    fn trade_through_must_sustain_three_seconds() {
        let store = OrderStore::new();
        let engine = PaperEngine::new(0.01, 0.0);
        let order = paper_order(&store, 0.40);

        // one tick through
        assert!(engine
            .on_book_update(&store, "mkt-1", |_| Some(0.39), 1_000)
            .is_empty());
        // 2.9s later, still pending
        assert!(engine
            .on_book_update(&store, "mkt-1", |_| Some(0.39), 3_900)
            .is_empty());
        // 3s after first through: fill at the limit price
        let fills = engine.on_book_update(&store, "mkt-1", |_| Some(0.39), 4_000);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].fill_price, 0.40);
        assert_eq!(fills[0].fill_usd_cents, 500);
        assert_eq!(store.get(order.order_id).unwrap().status, OrderStatus::Filled);
    }

    #[test]
    fn pullback_resets_the_clock() {
        let store = OrderStore::new();
        let engine = PaperEngine::new(0.01, 0.0);
        paper_order(&store, 0.40);

        assert!(engine
            .on_book_update(&store, "mkt-1", |_| Some(0.39), 1_000)
            .is_empty());
        // pullback above the trade-through level
        assert!(engine
            .on_book_update(&store, "mkt-1", |_| Some(0.40), 2_000)
            .is_empty());
        // back through, but the clock restarted
        assert!(engine
            .on_book_update(&store, "mkt-1", |_| Some(0.39), 4_500)
            .is_empty());
        let fills = engine.on_book_update(&store, "mkt-1", |_| Some(0.39), 7_500);
        assert_eq!(fills.len(), 1);
    }

    #[test]
    fn fee_uses_doubled_floor() {
        let engine = PaperEngine::new(0.01, 0.0);
        // 500 cents at 20 bps = 1 cent
        assert_eq!(engine.fee_usd_cents(500), 1);

        let engine = PaperEngine::new(0.01, 25.0);
        // max(25, 10) * 2 = 50 bps on 10_000 cents = 50 cents
        assert_eq!(engine.fee_usd_cents(10_000), 50);
    }
}
