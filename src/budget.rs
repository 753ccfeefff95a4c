use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

use crate::config::BudgetConfig;
use crate::error::{BotError, BotResult};
use crate::time::utc_day_bucket;

pub const REAPER_GRACE_MS: i64 = 5_000;
pub const FORCE_SETTLE_DEGRADED_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Reserved,
    Settled,
    ForceSettled,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Settled => "SETTLED",
            ReservationStatus::ForceSettled => "FORCE_SETTLED",
            ReservationStatus::Released => "RELEASED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub day: String,
    pub ts_ms: i64,
    pub model_key: String,
    pub reserved_usd: f64,
    pub actual_usd: Option<f64>,
    pub status: ReservationStatus,
    pub correlation_id: String,
    pub expires_at_ms: i64,
}

impl Reservation {
    fn charge(&self) -> f64 {
        self.actual_usd.unwrap_or(self.reserved_usd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetStats {
    pub daily_cap_usd: f64,
    pub window_cap_usd: f64,
    pub spent_usd: f64,
    pub in_flight_usd: f64,
    pub analyses_today: usize,
    pub force_settles_today: u32,
}

#[derive(Debug)]
struct DayState {
    day: String,
    wallet_usd: f64,
    spent_usd: f64,
    in_flight_usd: f64,
    reservations: HashMap<Uuid, Reservation>,
    correlation_ids: HashSet<String>,
    force_settles: u32,
}

impl DayState {
    fn new(day: String, wallet_usd: f64) -> Self {
        Self {
            day,
            wallet_usd,
            spent_usd: 0.0,
            in_flight_usd: 0.0,
            reservations: HashMap::new(),
            correlation_ids: HashSet::new(),
            force_settles: 0,
        }
    }
}

/// AI budget manager. Every mutating operation runs inside one critical
/// section, which is how the serializable row-lock semantics are obtained in
/// process: reserve is check-then-insert, settle and the reaper are
/// compare-and-swap on the reservation status.
#[derive(Debug)]
pub struct BudgetManager {
    cfg: BudgetConfig,
    inner: Mutex<DayState>,
}

impl BudgetManager {
    pub fn new(cfg: BudgetConfig, wallet_usd: f64, now_ms: i64) -> Self {
        let day = utc_day_bucket(now_ms);
        Self {
            cfg,
            inner: Mutex::new(DayState::new(day, wallet_usd)),
        }
    }

    pub fn daily_cap_usd(&self) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.daily_cap(&inner)
    }

    pub fn window_cap_usd(&self) -> f64 {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.daily_cap(&inner) * self.cfg.window_cap_pct_of_daily
    }

    fn daily_cap(&self, state: &DayState) -> f64 {
        self.cfg
            .daily_cap_usd_user
            .min(state.wallet_usd * self.cfg.daily_cap_pct_of_wallet)
    }

    pub fn update_wallet(&self, wallet_usd: f64) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.wallet_usd = wallet_usd;
    }

    fn roll_day(&self, state: &mut DayState, now_ms: i64) {
        let today = utc_day_bucket(now_ms);
        if state.day != today {
            let wallet = state.wallet_usd;
            // open reservations survive the rollover so settle/reap still
            // balance in_flight; counters reset
            let open: HashMap<Uuid, Reservation> = state
                .reservations
                .iter()
                .filter(|(_, r)| r.status == ReservationStatus::Reserved)
                .map(|(id, r)| (*id, r.clone()))
                .collect();
            let in_flight = open.values().map(|r| r.reserved_usd).sum();
            *state = DayState::new(today, wallet);
            state.reservations = open;
            state.in_flight_usd = in_flight;
        }
    }

    /// Sum of charges pressing on the rolling window: every open reservation
    /// plus finalized ones whose timestamp falls in [now - window, now + 5 s].
    fn window_sum(&self, state: &DayState, now_ms: i64) -> f64 {
        let lo = now_ms - self.cfg.window_s * 1000;
        let hi = now_ms + 5_000;
        state
            .reservations
            .values()
            .filter(|r| match r.status {
                ReservationStatus::Reserved => true,
                ReservationStatus::Settled | ReservationStatus::ForceSettled => {
                    r.ts_ms >= lo && r.ts_ms <= hi
                }
                ReservationStatus::Released => false,
            })
            .map(Reservation::charge)
            .sum()
    }

    pub fn reserve(
        &self,
        model_key: &str,
        worst_case_usd: f64,
        correlation_id: &str,
        now_ms: i64,
    ) -> BotResult<Uuid> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.roll_day(&mut inner, now_ms);

        let daily_cap = self.daily_cap(&inner);
        if inner.spent_usd + inner.in_flight_usd + worst_case_usd > daily_cap {
            return Err(BotError::BudgetDenied(format!(
                "daily cap: spent={:.4} in_flight={:.4} requested={:.4} cap={:.4}",
                inner.spent_usd, inner.in_flight_usd, worst_case_usd, daily_cap
            )));
        }

        let window_cap = daily_cap * self.cfg.window_cap_pct_of_daily;
        let window_sum = self.window_sum(&inner, now_ms);
        if window_sum + worst_case_usd > window_cap {
            return Err(BotError::BudgetDenied(format!(
                "window cap: window_sum={window_sum:.4} requested={worst_case_usd:.4} cap={window_cap:.4}"
            )));
        }

        if !inner.correlation_ids.contains(correlation_id)
            && inner.correlation_ids.len() >= self.cfg.analyses_per_day_hard_cap as usize
        {
            return Err(BotError::BudgetDenied(format!(
                "analyses cap: {} reached",
                self.cfg.analyses_per_day_hard_cap
            )));
        }

        let reservation = Reservation {
            reservation_id: Uuid::new_v4(),
            day: inner.day.clone(),
            ts_ms: now_ms,
            model_key: model_key.to_string(),
            reserved_usd: worst_case_usd,
            actual_usd: None,
            status: ReservationStatus::Reserved,
            correlation_id: correlation_id.to_string(),
            expires_at_ms: now_ms + self.cfg.reservation_expiry_s * 1000,
        };
        let id = reservation.reservation_id;
        inner.in_flight_usd += worst_case_usd;
        inner.correlation_ids.insert(correlation_id.to_string());
        inner.reservations.insert(id, reservation);

        tracing::debug!(
            target: "budget",
            reservation_id = %id,
            model = model_key,
            usd = worst_case_usd,
            "budget reserved"
        );
        Ok(id)
    }

    /// Idempotent settlement: a compare-and-swap on RESERVED. Returns false
    /// when the reservation was already final (the reaper won, or a second
    /// settle raced) and changes nothing.
    pub fn settle(
        &self,
        reservation_id: Uuid,
        actual_usd: Option<f64>,
        now_ms: i64,
    ) -> BotResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.roll_day(&mut inner, now_ms);

        let Some(reservation) = inner.reservations.get_mut(&reservation_id) else {
            return Err(BotError::Other(format!(
                "unknown reservation {reservation_id}"
            )));
        };
        if reservation.status != ReservationStatus::Reserved {
            tracing::info!(
                target: "budget",
                reservation_id = %reservation_id,
                status = reservation.status.as_str(),
                "RESERVATION_ALREADY_FINAL"
            );
            return Ok(false);
        }

        reservation.status = ReservationStatus::Settled;
        reservation.actual_usd = Some(actual_usd.unwrap_or(reservation.reserved_usd));
        let reserved = reservation.reserved_usd;
        let charge = reservation.charge();
        inner.in_flight_usd -= reserved;
        inner.spent_usd += charge;
        Ok(true)
    }

    /// Release without spending (the analysis never ran).
    pub fn release(&self, reservation_id: Uuid, now_ms: i64) -> BotResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.roll_day(&mut inner, now_ms);

        let Some(reservation) = inner.reservations.get_mut(&reservation_id) else {
            return Err(BotError::Other(format!(
                "unknown reservation {reservation_id}"
            )));
        };
        if reservation.status != ReservationStatus::Reserved {
            return Ok(false);
        }
        reservation.status = ReservationStatus::Released;
        let reserved = reservation.reserved_usd;
        inner.in_flight_usd -= reserved;
        Ok(true)
    }

    /// Force-settle reservations whose expiry passed more than the grace ago.
    /// Returns how many were reaped this pass.
    pub fn reap_expired(&self, now_ms: i64) -> u32 {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.roll_day(&mut inner, now_ms);

        let due: Vec<Uuid> = inner
            .reservations
            .values()
            .filter(|r| {
                r.status == ReservationStatus::Reserved
                    && r.expires_at_ms < now_ms - REAPER_GRACE_MS
            })
            .map(|r| r.reservation_id)
            .collect();

        let mut count = 0;
        for id in due {
            let Some(reservation) = inner.reservations.get_mut(&id) else {
                continue;
            };
            reservation.status = ReservationStatus::ForceSettled;
            reservation.actual_usd = Some(reservation.reserved_usd);
            let reserved = reservation.reserved_usd;
            tracing::warn!(
                target: "budget",
                reservation_id = %id,
                model = %reservation.model_key,
                usd = reserved,
                "reservation force-settled"
            );
            inner.in_flight_usd -= reserved;
            inner.spent_usd += reserved;
            inner.force_settles += 1;
            count += 1;
        }
        count
    }

    /// Three or more force-settles inside one UTC day degrade cost
    /// accounting; the orchestrator forces OBSERVE_ONLY.
    pub fn is_degraded(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .force_settles
            >= FORCE_SETTLE_DEGRADED_THRESHOLD
    }

    pub fn status(&self, reservation_id: Uuid) -> Option<ReservationStatus> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reservations
            .get(&reservation_id)
            .map(|r| r.status)
    }

    pub fn stats(&self) -> BudgetStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        BudgetStats {
            daily_cap_usd: self.daily_cap(&inner),
            window_cap_usd: self.daily_cap(&inner) * self.cfg.window_cap_pct_of_daily,
            spent_usd: inner.spent_usd,
            in_flight_usd: inner.in_flight_usd,
            analyses_today: inner.correlation_ids.len(),
            force_settles_today: inner.force_settles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(wallet: f64) -> BudgetManager {
        BudgetManager::new(BudgetConfig::default(), wallet, 0)
    }

    #[test]
    fn caps_track_wallet_with_user_ceiling() {
        let small = manager(100.0);
        assert!((small.daily_cap_usd() - 0.50).abs() < 1e-9);
        assert!((small.window_cap_usd() - 0.10).abs() < 1e-9);

        let large = manager(10_000.0);
        assert!((large.daily_cap_usd() - 2.00).abs() < 1e-9);
    }

    #[test]
    fn window_cap_admits_exactly_two_of_ten_concurrent() {
        // daily cap 2.00, window cap 0.40, ten threads each reserving 0.20
        let mgr = manager(400.0);
        assert!((mgr.daily_cap_usd() - 2.00).abs() < 1e-9);
        assert!((mgr.window_cap_usd() - 0.40).abs() < 1e-9);

        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..10)
                .map(|i| {
                    let mgr = &mgr;
                    scope.spawn(move || {
                        mgr.reserve("model-a", 0.20, &format!("corr-{i}"), 1_000)
                            .is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|ok| **ok).count(), 2);
        let stats = mgr.stats();
        assert!((stats.in_flight_usd - 0.40).abs() < 1e-9);
    }

    #[test]
    fn window_drains_after_old_settlements_age_out() {
        let mgr = manager(400.0);
        let r1 = mgr.reserve("m", 0.20, "c1", 0).unwrap();
        let r2 = mgr.reserve("m", 0.20, "c2", 0).unwrap();
        assert!(mgr.reserve("m", 0.20, "c3", 1).is_err());

        mgr.settle(r1, Some(0.20), 10_000).unwrap();
        mgr.settle(r2, Some(0.20), 10_000).unwrap();
        // settled charges still press on the window
        assert!(mgr.reserve("m", 0.20, "c3", 20_000).is_err());
        // once the window has passed, new reservations flow again
        let late = 10_000 + 600_000 + 1;
        assert!(mgr.reserve("m", 0.20, "c3", late).is_ok());
    }

    #[test]
    fn settle_is_idempotent() {
        let mgr = manager(400.0);
        let id = mgr.reserve("m", 0.10, "c1", 0).unwrap();

        assert!(mgr.settle(id, Some(0.07), 1_000).unwrap());
        let stats = mgr.stats();
        assert!((stats.spent_usd - 0.07).abs() < 1e-9);
        assert!(stats.in_flight_usd.abs() < 1e-9);

        // second settle is a no-op
        assert!(!mgr.settle(id, Some(0.07), 2_000).unwrap());
        let stats = mgr.stats();
        assert!((stats.spent_usd - 0.07).abs() < 1e-9);
    }

    #[test]
    fn reaper_and_settle_race_resolves_once() {
        // reservation of 0.10 expiring at 120s; settle(actual=0.07) and the
        // reaper run concurrently at 125s: exactly one wins.
        for _ in 0..20 {
            let mgr = manager(400.0);
            let id = mgr.reserve("m", 0.10, "c1", 0).unwrap();
            let t = 125_000 + REAPER_GRACE_MS;

            let (settled, reaped) = std::thread::scope(|scope| {
                let settle = scope.spawn(|| mgr.settle(id, Some(0.07), t).unwrap());
                let reap = scope.spawn(|| mgr.reap_expired(t));
                (settle.join().unwrap(), reap.join().unwrap())
            });

            // exactly one of the two applied
            assert!(settled ^ (reaped == 1), "settled={settled} reaped={reaped}");
            let stats = mgr.stats();
            assert!(stats.in_flight_usd.abs() < 1e-9);
            let expected = if settled { 0.07 } else { 0.10 };
            assert!(
                (stats.spent_usd - expected).abs() < 1e-9,
                "spent={} expected={expected}",
                stats.spent_usd
            );
        }
    }

    #[test]
    fn reaper_respects_grace() {
        let mgr = manager(400.0);
        mgr.reserve("m", 0.10, "c1", 0).unwrap();
        // expiry at 120s; grace 5s
        assert_eq!(mgr.reap_expired(124_999), 0);
        assert_eq!(mgr.reap_expired(125_001), 1);
    }

    #[test]
    fn three_force_settles_degrade() {
        let mgr = manager(400.0);
        for i in 0..3 {
            mgr.reserve("m", 0.05, &format!("c{i}"), 0).unwrap();
        }
        assert!(!mgr.is_degraded());
        assert_eq!(mgr.reap_expired(200_000), 3);
        assert!(mgr.is_degraded());
    }

    #[test]
    fn analyses_hard_cap_counts_distinct_correlations() {
        let cfg = BudgetConfig {
            analyses_per_day_hard_cap: 2,
            ..BudgetConfig::default()
        };
        let mgr = BudgetManager::new(cfg, 400.0, 0);

        let a = mgr.reserve("m", 0.01, "c1", 0).unwrap();
        mgr.settle(a, None, 1).unwrap();
        let b = mgr.reserve("m", 0.01, "c2", 620_000).unwrap();
        mgr.settle(b, None, 620_001).unwrap();

        // same correlation id may reserve again
        assert!(mgr.reserve("m", 0.01, "c2", 1_250_000).is_ok());
        // a third distinct one is denied
        let err = mgr.reserve("m", 0.01, "c3", 1_250_001).unwrap_err();
        assert!(matches!(err, BotError::BudgetDenied(_)));
    }

    #[test]
    fn day_rollover_resets_spend_but_keeps_open_reservations() {
        let mgr = manager(400.0);
        let day1 = 1_000;
        let r = mgr.reserve("m", 0.10, "c1", day1).unwrap();
        let s = mgr.reserve("m", 0.10, "c2", day1).unwrap();
        mgr.settle(s, None, day1 + 1).unwrap();

        // next UTC day
        let day2 = 86_400_000 + 1_000;
        let stats_before = mgr.stats();
        assert!((stats_before.spent_usd - 0.10).abs() < 1e-9);

        assert!(mgr.reserve("m", 0.10, "c3", day2).is_ok());
        let stats = mgr.stats();
        // spend reset, open reservation carried
        assert!(stats.spent_usd.abs() < 1e-9);
        assert!((stats.in_flight_usd - 0.20).abs() < 1e-9);

        // settling the carried reservation still balances
        assert!(mgr.settle(r, Some(0.05), day2 + 10).unwrap());
        assert!((mgr.stats().in_flight_usd - 0.10).abs() < 1e-9);
    }
}
