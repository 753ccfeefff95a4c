use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::clients::venue::{LimitOrderRequest, Outcome, VenueClient, VenueOrder, VenueOrderStatus};
use crate::error::{BotError, BotResult};
use crate::persistence::event_log::EventStore;
use crate::persistence::wal::{WalRecordType, WalWriter};
use crate::reasons::ReasonCode;
use crate::state::coordinator::Coordinator;
use crate::state::machine::StateMachine;
use crate::state::orders::{Order, OrderStatus, OrderStore};
use crate::strategy::decision::Decision;
use crate::time::now_ms;

pub const PENDING_POLL_INTERVAL_MS: u64 = 5_000;
pub const PENDING_MAX_WAIT_MS: u64 = 60_000;
pub const PENDING_PRICE_DRIFT_MAX: f64 = 0.02;
pub const ABSENT_MARKET_BAR_MS: i64 = 300_000;
pub const RESIDUAL_CANCEL_AFTER_MS: i64 = 30_000;
pub const FOUND_SIZE_TOLERANCE: f64 = 0.01;
pub const FOUND_PRICE_TOLERANCE: f64 = 0.005;

#[derive(Debug, PartialEq)]
pub enum SubmitReport {
    /// Venue acknowledged inside the request; order is live (or filled).
    Submitted(Order),
    /// Venue definitively refused; nothing rests at the venue.
    Rejected(Order),
    /// Ambiguous outcome; the order is PENDING_UNKNOWN and must be resolved.
    PendingUnknown(Order),
    /// Pre-exec gate refused before the network call.
    Aborted(ReasonCode),
    /// This decision already produced its one permitted LIVE submit.
    DuplicateDecision,
    /// Intent could not reach the event store; intent aborted durably. The
    /// caller sets DB_DEGRADED and drops to OBSERVE_ONLY.
    EventStoreDegraded,
    /// Submit succeeded but the result could not reach the event store; the
    /// order stays PENDING_UNKNOWN until the store recovers.
    EventStoreDegradedAfterResult(Order),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PendingResolution {
    Found {
        order: Order,
        candidate_discarded: bool,
    },
    AbsentConfirmed {
        order: Order,
        candidate_discarded: bool,
    },
    /// Venue shows an order under our id that is not what we decided.
    HaltMismatch,
    /// Sixty seconds of ambiguity; exposure may exist that we cannot see.
    HaltOrphanRisk,
    /// Cancel variant: ambiguity outlived its budget.
    HaltResidualCancelUnknown,
}

/// LIVE/PAPER execution engine: owns the two-phase WAL discipline, the
/// process-global submit gate, and the PENDING_UNKNOWN and residual-cancel
/// protocols. Submits never retry; the reconciliation loop is the only retry
/// in the system.
pub struct ExecutionEngine {
    venue: Arc<dyn VenueClient>,
    orders: Arc<OrderStore>,
    machine: Arc<StateMachine>,
    coordinator: Arc<Coordinator>,
    wal: Arc<Mutex<WalWriter>>,
    events: Arc<Mutex<EventStore>>,
    submit_gate: AsyncMutex<()>,
    client_order_id_max_len: usize,
    pending_poll_interval_ms: u64,
    pending_max_wait_ms: u64,
    /// Mid at the moment each order entered PENDING_UNKNOWN; the drift guard
    /// compares against this, not against wherever the loop happens to start.
    pending_entry_mids: Mutex<std::collections::HashMap<Uuid, f64>>,
}

impl ExecutionEngine {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        orders: Arc<OrderStore>,
        machine: Arc<StateMachine>,
        coordinator: Arc<Coordinator>,
        wal: Arc<Mutex<WalWriter>>,
        events: Arc<Mutex<EventStore>>,
        client_order_id_max_len: usize,
    ) -> Self {
        Self {
            venue,
            orders,
            machine,
            coordinator,
            wal,
            events,
            submit_gate: AsyncMutex::new(()),
            client_order_id_max_len,
            pending_poll_interval_ms: PENDING_POLL_INTERVAL_MS,
            pending_max_wait_ms: PENDING_MAX_WAIT_MS,
            pending_entry_mids: Mutex::new(std::collections::HashMap::new()),
        }
    }

    #[cfg(test)]
    pub fn with_pending_timing(mut self, poll_ms: u64, max_wait_ms: u64) -> Self {
        self.pending_poll_interval_ms = poll_ms;
        self.pending_max_wait_ms = max_wait_ms;
        self
    }

    pub fn orders(&self) -> &OrderStore {
        &self.orders
    }

    fn clear_pending_mid(&self, order_id: Uuid) {
        self.pending_entry_mids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&order_id);
    }

    fn wal_append(&self, record_type: WalRecordType, payload: serde_json::Value) -> BotResult<()> {
        self.wal
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .append(record_type, payload)?;
        Ok(())
    }

    fn event_append(&self, event: &str, payload: serde_json::Value) -> BotResult<()> {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .append(event, payload, now_ms())?;
        Ok(())
    }

    fn intent_payload(order: &Order, decision: &Decision) -> serde_json::Value {
        json!({
            "decision_id_hex": order.decision_id_hex,
            "market_id": order.market_id,
            "side": order.side.as_str(),
            "client_order_id": order.client_order_id,
            "price": order.price,
            "size_usd_cents": order.size_usd_cents,
            "p_eff": decision.p_eff,
            "required_edge": decision.required_edge,
        })
    }

    /// PAPER submit: no WAL, no venue. The order rests locally and the paper
    /// engine fills it pessimistically off book updates.
    pub fn submit_paper(&self, decision: &Decision, at_ms: i64) -> BotResult<Order> {
        let mut order = Order::new(
            decision.decision_id_hex.clone(),
            decision.market_id.clone(),
            decision.side,
            decision.client_order_id(self.client_order_id_max_len),
            decision.limit_price,
            decision.size_usd_cents,
            true,
            at_ms,
        );
        order.status = OrderStatus::Open;
        self.orders.insert(order.clone());
        self.event_append(
            "PAPER_ORDER_OPENED",
            json!({
                "decision_id_hex": order.decision_id_hex,
                "market_id": order.market_id,
                "side": order.side.as_str(),
                "price": order.price,
                "size_usd_cents": order.size_usd_cents,
            }),
        )?;
        Ok(order)
    }

    /// LIVE submit. `gate_check` runs under the process-global submit gate,
    /// immediately before the network call, and receives the generation
    /// recorded at submit start; there is no suspension between it and the
    /// outbound request other than the request itself.
    pub async fn submit_live(
        &self,
        decision: &Decision,
        gate_check: impl FnOnce(u64) -> Result<(), ReasonCode>,
    ) -> BotResult<SubmitReport> {
        if !self.orders.try_mark_live_submit(&decision.decision_id_hex) {
            tracing::warn!(
                target: "execution",
                decision_id = %decision.decision_id_hex,
                "duplicate live submit refused"
            );
            return Ok(SubmitReport::DuplicateDecision);
        }

        let submit_generation = self.coordinator.barrier_generation();
        let started_ms = now_ms();
        let order = Order::new(
            decision.decision_id_hex.clone(),
            decision.market_id.clone(),
            decision.side,
            decision.client_order_id(self.client_order_id_max_len),
            decision.limit_price,
            decision.size_usd_cents,
            false,
            started_ms,
        );
        self.orders.insert(order.clone());

        let _gate = self.submit_gate.lock().await;

        // phase 1: durable intent, then the event store copy
        let intent = Self::intent_payload(&order, decision);
        self.wal_append(WalRecordType::OrderIntent, intent.clone())?;
        if let Err(err) = self.event_append("ORDER_INTENT", intent.clone()) {
            tracing::error!(
                target: "execution",
                error = %err,
                "event store rejected intent; aborting submit"
            );
            self.wal_append(WalRecordType::OrderIntentAborted, intent)?;
            self.orders
                .set_status(order.order_id, OrderStatus::Rejected, now_ms())?;
            return Ok(SubmitReport::EventStoreDegraded);
        }

        // final gate, atomically before the network call
        if let Err(reason) = gate_check(submit_generation) {
            let abort = json!({
                "decision_id_hex": order.decision_id_hex,
                "reason": reason.as_str(),
            });
            self.wal_append(WalRecordType::OrderIntentAborted, abort.clone())?;
            self.event_append("ORDER_INTENT_ABORTED", abort)?;
            self.orders
                .set_status(order.order_id, OrderStatus::Rejected, now_ms())?;
            tracing::warn!(
                target: "execution",
                decision_id = %order.decision_id_hex,
                reason = reason.as_str(),
                "submit aborted at pre-exec gate"
            );
            return Ok(SubmitReport::Aborted(reason));
        }

        let request = LimitOrderRequest {
            client_order_id: order.client_order_id.clone(),
            market_id: order.market_id.clone(),
            side: order.side,
            price: order.price,
            size_usd_cents: order.size_usd_cents,
            post_only: !decision.marketable_allowed,
            marketable: decision.marketable_allowed,
        };
        let outcome = self.venue.submit_limit_order(request).await;

        match outcome {
            Outcome::Success(venue_order) => {
                let result = json!({
                    "decision_id_hex": order.decision_id_hex,
                    "client_order_id": order.client_order_id,
                    "exchange_order_id": venue_order.exchange_order_id,
                    "status": venue_status_str(venue_order.status),
                    "filled_usd_cents": venue_order.filled_usd_cents,
                });
                self.wal_append(WalRecordType::OrderResult, result.clone())?;
                let updated = self.apply_venue_order(order.order_id, &venue_order, now_ms())?;
                if let Err(err) = self.event_append("ORDER_RESULT", result) {
                    tracing::error!(
                        target: "execution",
                        error = %err,
                        "event store rejected result; order held PENDING_UNKNOWN"
                    );
                    // a terminally filled order keeps its status; the WAL
                    // already carries the result for replay into the store
                    let held = if updated.status.is_terminal() {
                        updated
                    } else {
                        self.orders.set_status(
                            updated.order_id,
                            OrderStatus::PendingUnknown,
                            now_ms(),
                        )?
                    };
                    return Ok(SubmitReport::EventStoreDegradedAfterResult(held));
                }
                Ok(SubmitReport::Submitted(updated))
            }
            Outcome::AbsentConfirmed => {
                let result = json!({
                    "decision_id_hex": order.decision_id_hex,
                    "client_order_id": order.client_order_id,
                    "status": "REJECTED",
                });
                self.wal_append(WalRecordType::OrderResult, result.clone())?;
                self.event_append("ORDER_RESULT", result)?;
                let rejected =
                    self.orders
                        .set_status(order.order_id, OrderStatus::Rejected, now_ms())?;
                Ok(SubmitReport::Rejected(rejected))
            }
            Outcome::Ambiguous(reason) => {
                tracing::warn!(
                    target: "execution",
                    decision_id = %order.decision_id_hex,
                    reason = %reason,
                    "ambiguous submit outcome; entering PENDING_UNKNOWN"
                );
                let pending = self.orders.set_status(
                    order.order_id,
                    OrderStatus::PendingUnknown,
                    now_ms(),
                )?;
                if let Some(mid) = self.current_mid(&order.market_id).await {
                    self.pending_entry_mids
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(order.order_id, mid);
                }
                Ok(SubmitReport::PendingUnknown(pending))
            }
        }
    }

    /// PENDING_UNKNOWN protocol: poll the venue by client order id every five
    /// seconds for up to a minute. FOUND must match the decision exactly
    /// enough; ABSENT_CONFIRMED cancels locally and bars the market; running
    /// out the clock is an orphan-risk halt. A mid drift above two percent
    /// since entry discards the candidate whatever the outcome.
    pub async fn resolve_pending_unknown(&self, order_id: Uuid) -> BotResult<PendingResolution> {
        let Some(order) = self.orders.get(order_id) else {
            return Err(BotError::Other(format!("unknown order {order_id}")));
        };

        let reference_mid = {
            let mids = self
                .pending_entry_mids
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            mids.get(&order_id).copied()
        };
        let reference_mid = match reference_mid {
            Some(mid) => Some(mid),
            None => self.current_mid(&order.market_id).await,
        };
        let mut candidate_discarded = false;
        let max_polls = (self.pending_max_wait_ms / self.pending_poll_interval_ms.max(1)).max(1);

        for _ in 0..max_polls {
            tokio::time::sleep(std::time::Duration::from_millis(
                self.pending_poll_interval_ms,
            ))
            .await;

            if let (Some(reference), Some(current)) =
                (reference_mid, self.current_mid(&order.market_id).await)
            {
                if reference > 0.0 && ((current - reference) / reference).abs() > PENDING_PRICE_DRIFT_MAX
                {
                    candidate_discarded = true;
                }
            }

            match self.venue.lookup_order(order.client_order_id.clone()).await {
                Outcome::Success(venue_order) => {
                    if let Err(detail) = validate_found(&order, &venue_order) {
                        tracing::error!(
                            target: "execution",
                            client_order_id = %order.client_order_id,
                            detail = %detail,
                            "PENDING_UNKNOWN_MISMATCH"
                        );
                        self.machine.force_halt("PENDING_UNKNOWN_MISMATCH", now_ms())?;
                        return Ok(PendingResolution::HaltMismatch);
                    }
                    let result = json!({
                        "decision_id_hex": order.decision_id_hex,
                        "client_order_id": order.client_order_id,
                        "exchange_order_id": venue_order.exchange_order_id,
                        "status": venue_status_str(venue_order.status),
                        "filled_usd_cents": venue_order.filled_usd_cents,
                        "resolution": "FOUND",
                    });
                    self.wal_append(WalRecordType::OrderResult, result.clone())?;
                    self.event_append("ORDER_RESULT", result)?;
                    let updated = self.apply_venue_order(order.order_id, &venue_order, now_ms())?;
                    self.clear_pending_mid(order.order_id);
                    return Ok(PendingResolution::Found {
                        order: updated,
                        candidate_discarded,
                    });
                }
                Outcome::AbsentConfirmed => {
                    let result = json!({
                        "decision_id_hex": order.decision_id_hex,
                        "client_order_id": order.client_order_id,
                        "status": "CANCELLED",
                        "resolution": "ABSENT_CONFIRMED",
                    });
                    self.wal_append(WalRecordType::OrderResult, result.clone())?;
                    self.event_append("ORDER_RESULT", result)?;
                    let cancelled = self.orders.set_status(
                        order.order_id,
                        OrderStatus::Cancelled,
                        now_ms(),
                    )?;
                    self.coordinator
                        .bar_market(&order.market_id, now_ms() + ABSENT_MARKET_BAR_MS);
                    self.clear_pending_mid(order.order_id);
                    return Ok(PendingResolution::AbsentConfirmed {
                        order: cancelled,
                        candidate_discarded,
                    });
                }
                Outcome::Ambiguous(reason) => {
                    tracing::debug!(
                        target: "execution",
                        client_order_id = %order.client_order_id,
                        reason = %reason,
                        "pending-unknown poll inconclusive"
                    );
                }
            }
        }

        self.machine.force_halt("ORPHAN_RISK", now_ms())?;
        Ok(PendingResolution::HaltOrphanRisk)
    }

    /// Cancel any residual that has been resting longer than thirty seconds.
    /// Returns the orders that entered the cancel path.
    pub async fn enforce_residuals(&self, at_ms: i64) -> BotResult<Vec<PendingResolution>> {
        let mut outcomes = Vec::new();
        for order in self.orders.active() {
            if order.is_paper || order.status != OrderStatus::PartiallyFilled {
                continue;
            }
            if at_ms - order.updated_ms < RESIDUAL_CANCEL_AFTER_MS {
                continue;
            }
            outcomes.push(self.cancel_order(order.order_id).await?);
        }
        Ok(outcomes)
    }

    /// LIVE cancel with the same two-phase discipline: durable CANCEL_INTENT,
    /// the network call, durable CANCEL_RESULT. An ambiguous cancel becomes
    /// PENDING_UNKNOWN (cancel variant) and must be confirmed absent before
    /// any replacement order may exist in that market.
    pub async fn cancel_order(&self, order_id: Uuid) -> BotResult<PendingResolution> {
        let Some(order) = self.orders.get(order_id) else {
            return Err(BotError::Other(format!("unknown order {order_id}")));
        };
        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            return Err(BotError::Other(format!(
                "order {order_id} has no exchange id to cancel"
            )));
        };

        let intent = json!({
            "decision_id_hex": order.decision_id_hex,
            "client_order_id": order.client_order_id,
            "exchange_order_id": exchange_order_id,
        });
        self.wal_append(WalRecordType::CancelIntent, intent.clone())?;
        self.event_append("CANCEL_INTENT", intent)?;
        self.orders
            .set_status(order.order_id, OrderStatus::CancelRequested, now_ms())?;

        match self.venue.cancel_order(exchange_order_id.clone()).await {
            Outcome::Success(()) | Outcome::AbsentConfirmed => {
                let result = json!({
                    "decision_id_hex": order.decision_id_hex,
                    "client_order_id": order.client_order_id,
                    "exchange_order_id": exchange_order_id,
                    "status": "CANCELLED",
                });
                self.wal_append(WalRecordType::CancelResult, result.clone())?;
                self.event_append("CANCEL_RESULT", result)?;
                let cancelled =
                    self.orders
                        .set_status(order.order_id, OrderStatus::Cancelled, now_ms())?;
                Ok(PendingResolution::AbsentConfirmed {
                    order: cancelled,
                    candidate_discarded: false,
                })
            }
            Outcome::Ambiguous(reason) => {
                tracing::warn!(
                    target: "execution",
                    client_order_id = %order.client_order_id,
                    reason = %reason,
                    "ambiguous cancel; entering PENDING_UNKNOWN (cancel)"
                );
                self.orders
                    .set_status(order.order_id, OrderStatus::PendingUnknown, now_ms())?;
                self.resolve_pending_cancel(order.order_id).await
            }
        }
    }

    /// Resolution loop for an ambiguous cancel: the only acceptable terminal
    /// is the order confirmed absent (or terminally filled); ambiguity past
    /// the budget halts with RESIDUAL_CANCEL_UNKNOWN.
    async fn resolve_pending_cancel(&self, order_id: Uuid) -> BotResult<PendingResolution> {
        let Some(order) = self.orders.get(order_id) else {
            return Err(BotError::Other(format!("unknown order {order_id}")));
        };
        let max_polls = (self.pending_max_wait_ms / self.pending_poll_interval_ms.max(1)).max(1);

        for _ in 0..max_polls {
            tokio::time::sleep(std::time::Duration::from_millis(
                self.pending_poll_interval_ms,
            ))
            .await;

            match self.venue.lookup_order(order.client_order_id.clone()).await {
                Outcome::AbsentConfirmed => {
                    let result = json!({
                        "decision_id_hex": order.decision_id_hex,
                        "client_order_id": order.client_order_id,
                        "status": "CANCELLED",
                        "resolution": "ABSENT_CONFIRMED",
                    });
                    self.wal_append(WalRecordType::CancelResult, result.clone())?;
                    self.event_append("CANCEL_RESULT", result)?;
                    let cancelled = self.orders.set_status(
                        order.order_id,
                        OrderStatus::Cancelled,
                        now_ms(),
                    )?;
                    return Ok(PendingResolution::AbsentConfirmed {
                        order: cancelled,
                        candidate_discarded: false,
                    });
                }
                Outcome::Success(venue_order)
                    if venue_order.status == VenueOrderStatus::Cancelled
                        || venue_order.status == VenueOrderStatus::Filled =>
                {
                    let result = json!({
                        "decision_id_hex": order.decision_id_hex,
                        "client_order_id": order.client_order_id,
                        "status": venue_status_str(venue_order.status),
                        "resolution": "FOUND",
                    });
                    self.wal_append(WalRecordType::CancelResult, result.clone())?;
                    self.event_append("CANCEL_RESULT", result)?;
                    let updated = self.apply_venue_order(order.order_id, &venue_order, now_ms())?;
                    return Ok(PendingResolution::Found {
                        order: updated,
                        candidate_discarded: false,
                    });
                }
                Outcome::Success(_) | Outcome::Ambiguous(_) => {}
            }
        }

        self.machine
            .force_halt("RESIDUAL_CANCEL_UNKNOWN", now_ms())?;
        Ok(PendingResolution::HaltResidualCancelUnknown)
    }

    fn apply_venue_order(
        &self,
        order_id: Uuid,
        venue_order: &VenueOrder,
        at_ms: i64,
    ) -> BotResult<Order> {
        self.orders
            .set_exchange_order_id(order_id, &venue_order.exchange_order_id);
        let current = self
            .orders
            .get(order_id)
            .ok_or_else(|| BotError::Other(format!("unknown order {order_id}")))?;

        let mut updated = current.clone();
        if venue_order.filled_usd_cents > current.filled_usd_cents {
            updated = self.orders.record_fill(
                order_id,
                venue_order.filled_usd_cents - current.filled_usd_cents,
                at_ms,
            )?;
        }
        let target = match venue_order.status {
            VenueOrderStatus::Open => Some(OrderStatus::Open),
            VenueOrderStatus::PartiallyFilled => Some(OrderStatus::PartiallyFilled),
            VenueOrderStatus::Filled => Some(OrderStatus::Filled),
            VenueOrderStatus::Cancelled => Some(OrderStatus::Cancelled),
        };
        if let Some(target) = target {
            if updated.status != target {
                updated = self.orders.set_status(order_id, target, at_ms)?;
            }
        }
        Ok(updated)
    }

    async fn current_mid(&self, market_id: &str) -> Option<f64> {
        match self.venue.best_prices(market_id.to_string()).await {
            Ok(top) => top.mid(),
            Err(_) => None,
        }
    }
}

fn venue_status_str(status: VenueOrderStatus) -> &'static str {
    match status {
        VenueOrderStatus::Open => "OPEN",
        VenueOrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        VenueOrderStatus::Filled => "FILLED",
        VenueOrderStatus::Cancelled => "CANCELLED",
    }
}

/// FOUND acceptance: side exact, size within 1%, price within 0.5%.
fn validate_found(order: &Order, venue_order: &VenueOrder) -> Result<(), String> {
    if venue_order.side != order.side {
        return Err(format!(
            "side mismatch: local={} venue={}",
            order.side.as_str(),
            venue_order.side.as_str()
        ));
    }
    let size_delta = (venue_order.size_usd_cents - order.size_usd_cents).abs() as f64
        / (order.size_usd_cents.max(1)) as f64;
    if size_delta > FOUND_SIZE_TOLERANCE {
        return Err(format!("size mismatch: delta={size_delta:.4}"));
    }
    if order.price > 0.0 {
        let price_delta = (venue_order.price - order.price).abs() / order.price;
        if price_delta > FOUND_PRICE_TOLERANCE {
            return Err(format!("price mismatch: delta={price_delta:.4}"));
        }
    }
    Ok(())
}
