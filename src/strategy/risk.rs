use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::RiskConfig;
use crate::reasons::ReasonCode;
use crate::state::orders::Side;

pub const TWAP_WINDOW_MS: i64 = 300_000;
pub const TWAP_MIN_SAMPLES: usize = 3;
pub const TWAP_MIN_SPAN_MS: i64 = 60_000;
pub const TWAP_OUTLIER_MIN_SAMPLES: usize = 10;
pub const TWAP_MAX_SPREAD: f64 = 0.10;
pub const TWAP_MIN_DEPTH_USD: f64 = 50.0;
pub const LAST_TRADE_MAX_AGE_MS: i64 = 600_000;
pub const ENTRY_FALLBACK_WINDOW_MS: i64 = 300_000;
pub const MARK_FAILURE_HALT_STREAK: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub side: Side,
    pub notional_usd_cents: i64,
    pub entry_price: f64,
    pub opened_ms: i64,
}

/// How a risk mark was obtained. Only TWAP- and trade-backed marks may
/// refresh `wallet_usd_last_good`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskMark {
    Twap(f64),
    LastTrade(f64),
    EntryFallback(f64),
}

impl RiskMark {
    pub fn value(&self) -> f64 {
        match self {
            RiskMark::Twap(v) | RiskMark::LastTrade(v) | RiskMark::EntryFallback(v) => *v,
        }
    }

    pub fn wallet_refresh_allowed(&self) -> bool {
        !matches!(self, RiskMark::EntryFallback(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct TwapSample {
    mid: f64,
    ts_ms: i64,
}

#[derive(Debug, Default)]
struct RiskInner {
    positions: HashMap<String, Position>,
    daily_pnl_usd: f64,
    twap: HashMap<String, Vec<TwapSample>>,
    last_trade: HashMap<String, (f64, i64)>,
    mark_failures: HashMap<String, u32>,
}

/// Position limits, TWAP mark-to-market with anti-spoof filtering, and the
/// daily stop.
#[derive(Debug)]
pub struct RiskManager {
    cfg: RiskConfig,
    inner: Mutex<RiskInner>,
}

impl RiskManager {
    pub fn new(cfg: RiskConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(RiskInner::default()),
        }
    }

    /// Intended order size in cents, bounded by per-market share of wallet,
    /// remaining exposure capacity and venue balance.
    pub fn compute_order_size_cents(&self, wallet_usd: f64, venue_available_usd: f64) -> i64 {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let per_market = self.cfg.max_per_market_pct * wallet_usd;
        let capacity = self.remaining_capacity_usd(&inner, wallet_usd);
        let size = per_market.min(capacity).min(venue_available_usd);
        ((size * 100.0).floor() as i64).max(0)
    }

    fn total_exposure_usd(&self, inner: &RiskInner) -> f64 {
        inner
            .positions
            .values()
            .map(|p| p.notional_usd_cents as f64 / 100.0)
            .sum()
    }

    fn remaining_capacity_usd(&self, inner: &RiskInner, wallet_usd: f64) -> f64 {
        (self.cfg.max_total_exposure_pct * wallet_usd - self.total_exposure_usd(inner)).max(0.0)
    }

    pub fn can_open_position(&self, market_id: &str, wallet_usd: f64) -> Result<(), ReasonCode> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.positions.contains_key(market_id) {
            return Err(ReasonCode::RiskLimitHit);
        }
        if inner.positions.len() >= self.cfg.max_open_positions {
            return Err(ReasonCode::RiskLimitHit);
        }
        if self.total_exposure_usd(&inner) >= self.cfg.max_total_exposure_pct * wallet_usd {
            return Err(ReasonCode::RiskLimitHit);
        }
        Ok(())
    }

    pub fn open_position(
        &self,
        market_id: &str,
        side: Side,
        notional_usd_cents: i64,
        entry_price: f64,
        now_ms: i64,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.positions.insert(
            market_id.to_string(),
            Position {
                side,
                notional_usd_cents,
                entry_price,
                opened_ms: now_ms,
            },
        );
    }

    pub fn close_position(&self, market_id: &str, exit_price: f64) -> f64 {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(position) = inner.positions.remove(market_id) else {
            return 0.0;
        };
        let notional = position.notional_usd_cents as f64 / 100.0;
        let entry = position.entry_price.max(0.001);
        let pnl = match position.side {
            Side::Yes => (exit_price - position.entry_price) * notional / entry,
            Side::No => (position.entry_price - exit_price) * notional / entry,
        };
        inner.daily_pnl_usd += pnl;
        pnl
    }

    pub fn open_positions(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .positions
            .len()
    }

    pub fn positions_snapshot(&self) -> Vec<(String, Position)> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .positions
            .iter()
            .map(|(market, position)| (market.clone(), *position))
            .collect()
    }

    pub fn position(&self, market_id: &str) -> Option<Position> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .positions
            .get(market_id)
            .copied()
    }

    pub fn daily_pnl_usd(&self) -> f64 {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .daily_pnl_usd
    }

    pub fn reset_daily_pnl(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .daily_pnl_usd = 0.0;
    }

    /// Daily stop: pnl at or below -3% of wallet trips HALTED_DAILY.
    pub fn daily_stop_hit(&self, wallet_usd: f64) -> bool {
        self.daily_pnl_usd() <= -self.cfg.daily_stop_loss_pct * wallet_usd
    }

    pub fn record_trade(&self, market_id: &str, price: f64, now_ms: i64) {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last_trade
            .insert(market_id.to_string(), (price, now_ms));
    }

    /// Feed one TWAP sample; silently discarded unless bid and ask exist,
    /// spread is sane and top depth clears the floor.
    pub fn add_twap_sample(
        &self,
        market_id: &str,
        best_bid: Option<f64>,
        best_ask: Option<f64>,
        top_depth_usd: f64,
        now_ms: i64,
    ) {
        let (Some(bid), Some(ask)) = (best_bid, best_ask) else {
            return;
        };
        if ask - bid > TWAP_MAX_SPREAD || top_depth_usd < TWAP_MIN_DEPTH_USD {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let samples = inner.twap.entry(market_id.to_string()).or_default();
        samples.push(TwapSample {
            mid: 0.5 * (bid + ask),
            ts_ms: now_ms,
        });
        let cutoff = now_ms - TWAP_WINDOW_MS;
        samples.retain(|s| s.ts_ms > cutoff);
    }

    fn twap_mark(&self, inner: &RiskInner, market_id: &str, now_ms: i64) -> Option<f64> {
        let samples = inner.twap.get(market_id)?;
        let cutoff = now_ms - TWAP_WINDOW_MS;
        let live: Vec<&TwapSample> = samples.iter().filter(|s| s.ts_ms > cutoff).collect();
        if live.len() < TWAP_MIN_SAMPLES {
            return None;
        }
        let first = live.iter().map(|s| s.ts_ms).min()?;
        let last = live.iter().map(|s| s.ts_ms).max()?;
        if last - first < TWAP_MIN_SPAN_MS {
            return None;
        }

        let mut mids: Vec<f64> = live.iter().map(|s| s.mid).collect();
        if mids.len() >= TWAP_OUTLIER_MIN_SAMPLES {
            let mean = mids.iter().sum::<f64>() / mids.len() as f64;
            let var =
                mids.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / (mids.len() - 1) as f64;
            let sigma = var.sqrt();
            if sigma > 0.0 {
                mids.retain(|m| (m - mean).abs() <= 2.0 * sigma);
            }
        }
        if mids.is_empty() {
            return None;
        }
        mids.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = mids.len();
        Some(if n % 2 == 1 {
            mids[n / 2]
        } else {
            0.5 * (mids[n / 2 - 1] + mids[n / 2])
        })
    }

    /// Realized sigma of the mids in the TWAP window; the marketable-limit
    /// gate's volatility input.
    pub fn mid_sigma(&self, market_id: &str, now_ms: i64) -> Option<f64> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let samples = inner.twap.get(market_id)?;
        let cutoff = now_ms - TWAP_WINDOW_MS;
        let mids: Vec<f64> = samples
            .iter()
            .filter(|s| s.ts_ms > cutoff)
            .map(|s| s.mid)
            .collect();
        if mids.len() < TWAP_MIN_SAMPLES {
            return None;
        }
        let mean = mids.iter().sum::<f64>() / mids.len() as f64;
        let var = mids.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / (mids.len() - 1) as f64;
        Some(var.sqrt())
    }

    /// Risk mark with the fallback chain: TWAP, else a recent trade, else the
    /// entry price inside the first five minutes of the position. Three
    /// consecutive failures for a marked position mean the caller must HALT.
    pub fn risk_mark(&self, market_id: &str, now_ms: i64) -> Result<RiskMark, u32> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(mark) = self.twap_mark(&inner, market_id, now_ms) {
            inner.mark_failures.remove(market_id);
            return Ok(RiskMark::Twap(mark));
        }
        if let Some((price, ts_ms)) = inner.last_trade.get(market_id).copied() {
            if now_ms - ts_ms <= LAST_TRADE_MAX_AGE_MS {
                inner.mark_failures.remove(market_id);
                return Ok(RiskMark::LastTrade(price));
            }
        }
        if let Some(position) = inner.positions.get(market_id).copied() {
            if now_ms - position.opened_ms <= ENTRY_FALLBACK_WINDOW_MS {
                inner.mark_failures.remove(market_id);
                return Ok(RiskMark::EntryFallback(position.entry_price));
            }
        }

        let streak = inner.mark_failures.entry(market_id.to_string()).or_insert(0);
        *streak += 1;
        tracing::warn!(
            target: "risk",
            market_id,
            streak = *streak,
            "risk mark unavailable"
        );
        Err(*streak)
    }
}
