use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

use crate::clients::venue::{VenueClient, VenueOrder, VenuePosition};
use crate::error::BotResult;
use crate::state::orders::{Order, OrderStatus, Side};
use crate::time::utc_day_bucket;

pub const RECONCILE_HEARTBEAT_MS: i64 = 60_000;
pub const RECONCILE_MAX_AGE_MS: i64 = 120_000;
pub const LEVEL2_FLOOR_USD: f64 = 1.00;
pub const LEVEL3_FLOOR_USD: f64 = 5.00;
pub const LEVEL_PCT_OF_WALLET: f64 = 0.001;
pub const DAILY_L1_DRIFT_ESCALATION_USD: f64 = 3.00;
// exact-equality tolerance: one cent
const DELTA_EPSILON_USD: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MismatchLevel {
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchStatus {
    Active,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct Mismatch {
    pub mismatch_id: Uuid,
    pub key: String,
    pub market_id: Option<String>,
    pub level: MismatchLevel,
    pub status: MismatchStatus,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub delta_usd: f64,
    pub details: String,
}

/// Wallet-relative severity with absolute floors. Deltas under a cent count
/// as exactly equal.
pub fn classify_delta(delta_usd: f64, wallet_usd: f64) -> Option<MismatchLevel> {
    let delta = delta_usd.abs();
    if delta < DELTA_EPSILON_USD {
        return None;
    }
    let l2 = (LEVEL_PCT_OF_WALLET * wallet_usd).max(LEVEL2_FLOOR_USD);
    let l3 = (LEVEL_PCT_OF_WALLET * wallet_usd).max(LEVEL3_FLOOR_USD);
    if delta >= l3 {
        Some(MismatchLevel::Level3)
    } else if delta >= l2 {
        Some(MismatchLevel::Level2)
    } else {
        Some(MismatchLevel::Level1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalPosition {
    pub market_id: String,
    pub side: Side,
    pub notional_usd_cents: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleReport {
    pub flagged: usize,
    pub resolved: usize,
    pub escalated: bool,
}

/// Everything RECONCILE_GREEN needs besides the engine's own bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct GreenInputs {
    pub now_ms: i64,
    pub last_ws_message_ms: i64,
    pub barrier_active: bool,
    pub ws_down: bool,
    pub any_pending_unknown: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    mismatches: HashMap<String, Mismatch>,
    last_completed_ms: Option<i64>,
    l1_drift_day: String,
    l1_drift_usd: f64,
}

/// Reconciliation engine. Venue REST reads are authoritative for
/// reconciliation only; a cycle never creates exposure, it only flags and
/// resolves mismatches.
#[derive(Debug, Default)]
pub struct ReconcileEngine {
    state: Mutex<EngineState>,
}

impl ReconcileEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch venue state and run one full comparison cycle.
    pub async fn run_cycle(
        &self,
        venue: &dyn VenueClient,
        local_orders: &[Order],
        local_positions: &[LocalPosition],
        wallet_usd: f64,
        now_ms: i64,
    ) -> BotResult<CycleReport> {
        let venue_orders = venue.list_open_orders().await?;
        let venue_positions = venue.list_positions().await?;
        Ok(self.apply_cycle(
            local_orders,
            &venue_orders,
            local_positions,
            &venue_positions,
            wallet_usd,
            now_ms,
        ))
    }

    /// Pure comparison pass over already-fetched views. Mismatches keyed by
    /// entity resolve only when a cycle finds that entity exactly equal.
    pub fn apply_cycle(
        &self,
        local_orders: &[Order],
        venue_orders: &[VenueOrder],
        local_positions: &[LocalPosition],
        venue_positions: &[VenuePosition],
        wallet_usd: f64,
        now_ms: i64,
    ) -> CycleReport {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut report = CycleReport::default();
        let mut flagged_keys: HashSet<String> = HashSet::new();

        // positions, keyed by (market, side)
        let mut local_by_key: HashMap<(String, Side), f64> = HashMap::new();
        for p in local_positions {
            *local_by_key
                .entry((p.market_id.clone(), p.side))
                .or_default() += p.notional_usd_cents as f64 / 100.0;
        }
        let mut venue_by_key: HashMap<(String, Side), f64> = HashMap::new();
        for p in venue_positions {
            *venue_by_key
                .entry((p.market_id.clone(), p.side))
                .or_default() += p.notional_usd_cents as f64 / 100.0;
        }
        let all_keys: HashSet<(String, Side)> = local_by_key
            .keys()
            .chain(venue_by_key.keys())
            .cloned()
            .collect();
        for (market_id, side) in all_keys {
            let local = local_by_key
                .get(&(market_id.clone(), side))
                .copied()
                .unwrap_or(0.0);
            let venue = venue_by_key
                .get(&(market_id.clone(), side))
                .copied()
                .unwrap_or(0.0);
            let key = format!("position:{market_id}:{}", side.as_str());
            if let Some(level) = classify_delta(local - venue, wallet_usd) {
                flag(
                    &mut state,
                    &mut report,
                    &mut flagged_keys,
                    key,
                    Some(market_id.clone()),
                    level,
                    (local - venue).abs(),
                    format!("position local={local:.2} venue={venue:.2}"),
                    now_ms,
                );
            }
        }

        // orders: every live local order must exist at the venue by
        // client_order_id, unless it is PENDING_UNKNOWN
        let venue_by_coid: HashMap<&str, &VenueOrder> = venue_orders
            .iter()
            .map(|o| (o.client_order_id.as_str(), o))
            .collect();
        let mut local_coids: HashSet<&str> = HashSet::new();
        for order in local_orders {
            if order.is_paper || order.status.is_terminal() {
                continue;
            }
            local_coids.insert(order.client_order_id.as_str());
            if order.status == OrderStatus::PendingUnknown {
                continue;
            }
            if !venue_by_coid.contains_key(order.client_order_id.as_str()) {
                let key = format!("order:{}", order.client_order_id);
                flag(
                    &mut state,
                    &mut report,
                    &mut flagged_keys,
                    key,
                    Some(order.market_id.clone()),
                    MismatchLevel::Level3,
                    order.residual_usd_cents as f64 / 100.0,
                    format!(
                        "local order {} ({}) missing at venue",
                        order.client_order_id,
                        order.status.as_str()
                    ),
                    now_ms,
                );
            }
        }
        for venue_order in venue_orders {
            if !local_coids.contains(venue_order.client_order_id.as_str()) {
                let key = format!("order:{}", venue_order.client_order_id);
                flag(
                    &mut state,
                    &mut report,
                    &mut flagged_keys,
                    key,
                    Some(venue_order.market_id.clone()),
                    MismatchLevel::Level3,
                    (venue_order.size_usd_cents - venue_order.filled_usd_cents) as f64 / 100.0,
                    format!(
                        "venue order {} has no local record",
                        venue_order.client_order_id
                    ),
                    now_ms,
                );
            }
        }

        // cumulative Level-1 drift per UTC day escalates
        let day = utc_day_bucket(now_ms);
        if state.l1_drift_day != day {
            state.l1_drift_day = day.clone();
            state.l1_drift_usd = 0.0;
        }
        let l1_delta: f64 = state
            .mismatches
            .values()
            .filter(|m| {
                m.status == MismatchStatus::Active
                    && m.level == MismatchLevel::Level1
                    && m.last_seen_ms == now_ms
            })
            .map(|m| m.delta_usd)
            .sum();
        state.l1_drift_usd += l1_delta;
        if state.l1_drift_usd > DAILY_L1_DRIFT_ESCALATION_USD {
            let key = format!("drift:{day}");
            if !state.mismatches.contains_key(&key)
                || state.mismatches[&key].status == MismatchStatus::Resolved
            {
                report.escalated = true;
            }
            let drift = state.l1_drift_usd;
            flag(
                &mut state,
                &mut report,
                &mut flagged_keys,
                key,
                None,
                MismatchLevel::Level2,
                drift,
                format!("cumulative level-1 drift {drift:.2} USD today"),
                now_ms,
            );
        }

        // anything active that this full cycle did not re-flag is now equal
        for mismatch in state.mismatches.values_mut() {
            if mismatch.status == MismatchStatus::Active && !flagged_keys.contains(&mismatch.key) {
                mismatch.status = MismatchStatus::Resolved;
                mismatch.last_seen_ms = now_ms;
                report.resolved += 1;
                tracing::info!(
                    target: "reconcile",
                    key = %mismatch.key,
                    "mismatch resolved"
                );
            }
        }

        state.last_completed_ms = Some(now_ms);
        tracing::debug!(
            target: "reconcile",
            flagged = report.flagged,
            resolved = report.resolved,
            "reconcile cycle complete"
        );
        report
    }

    pub fn last_completed_ms(&self) -> Option<i64> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_completed_ms
    }

    pub fn active_level2_or_3(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .mismatches
            .values()
            .filter(|m| m.status == MismatchStatus::Active && m.level >= MismatchLevel::Level2)
            .count()
    }

    pub fn active_mismatches(&self) -> Vec<Mismatch> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .mismatches
            .values()
            .filter(|m| m.status == MismatchStatus::Active)
            .cloned()
            .collect()
    }

    /// The conjunctive predicate gating every new LIVE exposure.
    pub fn reconcile_green(&self, inputs: GreenInputs) -> Result<(), Vec<String>> {
        let mut reasons = Vec::new();
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        match state.last_completed_ms {
            None => reasons.push("no reconcile cycle has completed".to_string()),
            Some(completed) => {
                let age = inputs.now_ms - completed;
                if age > RECONCILE_MAX_AGE_MS {
                    reasons.push(format!("last reconcile too old: {age}ms"));
                }
                if completed < inputs.last_ws_message_ms {
                    reasons.push("reconcile predates last ws activity".to_string());
                }
            }
        }

        let l2_or_l3 = state
            .mismatches
            .values()
            .filter(|m| m.status == MismatchStatus::Active && m.level >= MismatchLevel::Level2)
            .count();
        if l2_or_l3 > 0 {
            reasons.push(format!("{l2_or_l3} active level-2/3 mismatches"));
        }
        if inputs.any_pending_unknown {
            reasons.push("pending-unknown orders exist".to_string());
        }
        if inputs.barrier_active {
            reasons.push("barrier active".to_string());
        }
        if inputs.ws_down {
            reasons.push("ws down".to_string());
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(reasons)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn flag(
    state: &mut EngineState,
    report: &mut CycleReport,
    flagged_keys: &mut HashSet<String>,
    key: String,
    market_id: Option<String>,
    level: MismatchLevel,
    delta_usd: f64,
    details: String,
    now_ms: i64,
) {
    flagged_keys.insert(key.clone());
    report.flagged += 1;
    if let Some(existing) = state.mismatches.get_mut(&key) {
        if existing.status == MismatchStatus::Active {
            existing.level = existing.level.max(level);
            existing.last_seen_ms = now_ms;
            existing.delta_usd = delta_usd;
            existing.details = details;
            return;
        }
    }
    tracing::warn!(
        target: "reconcile",
        key = %key,
        level = level as u8,
        delta_usd,
        details = %details,
        "mismatch flagged"
    );
    state.mismatches.insert(
        key.clone(),
        Mismatch {
            mismatch_id: Uuid::new_v4(),
            key,
            market_id,
            level,
            status: MismatchStatus::Active,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            delta_usd,
            details,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::orders::Order;

    fn green_inputs(now_ms: i64) -> GreenInputs {
        GreenInputs {
            now_ms,
            last_ws_message_ms: 0,
            barrier_active: false,
            ws_down: false,
            any_pending_unknown: false,
        }
    }

    fn local_position(market: &str, cents: i64) -> LocalPosition {
        LocalPosition {
            market_id: market.to_string(),
            side: Side::Yes,
            notional_usd_cents: cents,
        }
    }

    fn venue_position(market: &str, cents: i64) -> VenuePosition {
        VenuePosition {
            market_id: market.to_string(),
            side: Side::Yes,
            notional_usd_cents: cents,
            avg_price: 0.5,
        }
    }

    #[test]
    fn classification_uses_wallet_with_floors() {
        // small wallet: floors dominate
        assert_eq!(classify_delta(0.50, 100.0), Some(MismatchLevel::Level1));
        assert_eq!(classify_delta(1.00, 100.0), Some(MismatchLevel::Level2));
        assert_eq!(classify_delta(5.00, 100.0), Some(MismatchLevel::Level3));
        // large wallet: 0.1% dominates
        assert_eq!(classify_delta(5.00, 100_000.0), Some(MismatchLevel::Level1));
        assert_eq!(classify_delta(100.0, 100_000.0), Some(MismatchLevel::Level3));
        // sub-cent deltas are equality
        assert_eq!(classify_delta(0.004, 100.0), None);
    }

    #[test]
    fn position_delta_flags_and_resolves() {
        let engine = ReconcileEngine::new();

        let report = engine.apply_cycle(
            &[],
            &[],
            &[local_position("mkt-1", 1_000)],
            &[venue_position("mkt-1", 400)],
            100.0,
            1_000,
        );
        assert_eq!(report.flagged, 1);
        assert_eq!(engine.active_level2_or_3(), 1);
        assert!(engine.reconcile_green(green_inputs(1_500)).is_err());

        // venue catches up; the next full cycle resolves
        let report = engine.apply_cycle(
            &[],
            &[],
            &[local_position("mkt-1", 1_000)],
            &[venue_position("mkt-1", 1_000)],
            100.0,
            2_000,
        );
        assert_eq!(report.resolved, 1);
        assert_eq!(engine.active_level2_or_3(), 0);
        assert!(engine.reconcile_green(green_inputs(2_500)).is_ok());
    }

    #[test]
    fn local_live_order_missing_at_venue_is_level3() {
        let engine = ReconcileEngine::new();
        let mut order = Order::new("dec-1", "mkt-1", Side::Yes, "coid-1", 0.4, 500, false, 0);
        order.status = OrderStatus::Open;

        let report = engine.apply_cycle(&[order.clone()], &[], &[], &[], 100.0, 1_000);
        assert_eq!(report.flagged, 1);
        assert_eq!(engine.active_level2_or_3(), 1);

        // a PENDING_UNKNOWN local order is not a mismatch; the protocol owns it
        order.status = OrderStatus::PendingUnknown;
        let engine = ReconcileEngine::new();
        let report = engine.apply_cycle(&[order], &[], &[], &[], 100.0, 1_000);
        assert_eq!(report.flagged, 0);
    }

    #[test]
    fn paper_orders_never_reconcile() {
        let engine = ReconcileEngine::new();
        let mut order = Order::new("dec-1", "mkt-1", Side::Yes, "coid-1", 0.4, 500, true, 0);
        order.status = OrderStatus::Open;
        let report = engine.apply_cycle(&[order], &[], &[], &[], 100.0, 1_000);
        assert_eq!(report.flagged, 0);
    }

    #[test]
    fn cumulative_l1_drift_escalates_once_per_day() {
        let engine = ReconcileEngine::new();
        // four cycles each with a 0.90 USD level-1 delta on a different market
        for (i, t) in [(0, 1_000), (1, 2_000), (2, 3_000), (3, 4_000)] {
            let report = engine.apply_cycle(
                &[],
                &[],
                &[local_position(&format!("m{i}"), 90)],
                &[],
                1_000.0,
                t,
            );
            if i < 3 {
                assert!(!report.escalated, "cycle {i} escalated early");
            } else {
                assert!(report.escalated, "cycle {i} should escalate");
            }
        }
        assert!(engine.active_level2_or_3() >= 1);
    }

    #[test]
    fn green_requires_recent_cycle_after_ws_activity() {
        let engine = ReconcileEngine::new();
        assert!(engine.reconcile_green(green_inputs(0)).is_err());

        engine.apply_cycle(&[], &[], &[], &[], 100.0, 10_000);
        assert!(engine.reconcile_green(green_inputs(10_500)).is_ok());

        // too old
        let inputs = green_inputs(10_000 + RECONCILE_MAX_AGE_MS + 1);
        assert!(engine.reconcile_green(inputs).is_err());

        // ws activity after the cycle completed
        let mut inputs = green_inputs(11_000);
        inputs.last_ws_message_ms = 10_500;
        assert!(engine.reconcile_green(inputs).is_err());
    }

    #[test]
    fn green_fails_on_pending_unknown_barrier_or_ws_down() {
        let engine = ReconcileEngine::new();
        engine.apply_cycle(&[], &[], &[], &[], 100.0, 10_000);

        let mut inputs = green_inputs(10_100);
        inputs.any_pending_unknown = true;
        assert!(engine.reconcile_green(inputs).is_err());

        let mut inputs = green_inputs(10_100);
        inputs.barrier_active = true;
        assert!(engine.reconcile_green(inputs).is_err());

        let mut inputs = green_inputs(10_100);
        inputs.ws_down = true;
        assert!(engine.reconcile_green(inputs).is_err());
    }
}
