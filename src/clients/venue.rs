use futures_util::future::BoxFuture;

use crate::error::BotResult;
use crate::state::orders::Side;

/// Outcome of a venue call whose effect may be unknown. Ambiguity is a
/// first-class variant, never a nullable success: a timeout or 5xx maps to
/// `Ambiguous` and the caller enters the PENDING_UNKNOWN protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    AbsentConfirmed,
    Ambiguous(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrder {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub size_usd_cents: i64,
    pub filled_usd_cents: i64,
    pub status: VenueOrderStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenuePosition {
    pub market_id: String,
    pub side: Side,
    pub notional_usd_cents: i64,
    pub avg_price: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VenueFill {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub market_id: String,
    pub price: f64,
    pub size_usd_cents: i64,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookTop {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

impl BookTop {
    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(0.5 * (bid + ask)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrderRequest {
    pub client_order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub size_usd_cents: i64,
    pub post_only: bool,
    pub marketable: bool,
}

/// The injected venue transport. Pure plumbing: every policy (idempotency,
/// gating, reconciliation authority) is enforced above this seam.
pub trait VenueClient: Send + Sync {
    fn list_open_orders(&self) -> BoxFuture<'static, BotResult<Vec<VenueOrder>>>;
    fn list_fills(&self, since_ms: i64) -> BoxFuture<'static, BotResult<Vec<VenueFill>>>;
    fn list_positions(&self) -> BoxFuture<'static, BotResult<Vec<VenuePosition>>>;
    fn balance_usd(&self) -> BoxFuture<'static, BotResult<f64>>;
    fn server_time_ms(&self) -> BoxFuture<'static, BotResult<i64>>;
    fn best_prices(&self, market_id: String) -> BoxFuture<'static, BotResult<BookTop>>;
    fn submit_limit_order(
        &self,
        request: LimitOrderRequest,
    ) -> BoxFuture<'static, Outcome<VenueOrder>>;
    fn cancel_order(&self, exchange_order_id: String) -> BoxFuture<'static, Outcome<()>>;
    /// Authoritative lookup by our idempotency key.
    fn lookup_order(&self, client_order_id: String) -> BoxFuture<'static, Outcome<VenueOrder>>;
}
