use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::market::snapshot::Snapshot;
use crate::reasons::ReasonCode;
use crate::state::orders::Side;

pub const EV_MIN: f64 = 0.01;
pub const DELTA_MAX_DEFAULT: f64 = 0.10;
pub const DELTA_MAX_HIGH_DISPUTE: f64 = 0.05;
pub const HIGH_DISPUTE_RISK: f64 = 0.7;
pub const P_EFF_OUTLIER_THRESHOLD: f64 = 0.20;
pub const MARKETABLE_EV_MARGIN: f64 = 0.03;
pub const MARKETABLE_MAX_SPREAD: f64 = 0.02;
pub const PAPER_MIN_FEE_BPS: f64 = 10.0;
pub const PAPER_FEE_MULT: f64 = 2.0;
// decision ids bucket their timestamp by minute
const TS_BUCKET_MS: i64 = 60_000;

/// Friction components in payout-share units; their sum is the edge a trade
/// must clear before EV counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Friction {
    pub spread_cost: f64,
    pub fee_cost: f64,
    pub slippage: f64,
    pub dispute: f64,
    pub latency: f64,
    pub time_value: f64,
}

impl Friction {
    pub fn total(&self) -> f64 {
        self.spread_cost + self.fee_cost + self.slippage + self.dispute + self.latency
            + self.time_value
    }
}

pub fn spread_cost(bid: f64, ask: f64) -> f64 {
    0.5 * (ask - bid).max(0.0)
}

pub fn fee_cost(fee_rate_bps: f64, is_paper: bool) -> f64 {
    if is_paper {
        (fee_rate_bps.max(PAPER_MIN_FEE_BPS) / 10_000.0) * PAPER_FEE_MULT
    } else {
        fee_rate_bps / 10_000.0
    }
}

pub fn slippage_buffer(order_usd: f64, top_depth_usd: f64) -> f64 {
    (order_usd / top_depth_usd.max(1.0) * 0.02).max(0.005)
}

pub fn dispute_buffer(dispute_risk: f64, tier1_fallback: bool) -> f64 {
    let buf = 0.01 + 0.02 * dispute_risk;
    if tier1_fallback {
        buf * 1.5
    } else {
        buf
    }
}

pub fn latency_penalty(decision_to_exec_s: f64) -> f64 {
    (decision_to_exec_s - 2.0).max(0.0) * 0.001
}

pub fn time_value_penalty(days_to_resolution: f64) -> f64 {
    (days_to_resolution * 0.0002).min(0.02)
}

#[derive(Debug, Clone)]
pub struct DecisionInputs<'a> {
    pub snapshot: &'a Snapshot,
    pub p_ai_cal: Option<f64>,
    pub w_ai: f64,
    pub dispute_risk: f64,
    pub tier1_fallback: bool,
    pub size_usd_cents: i64,
    pub fee_rate_bps: f64,
    pub is_paper: bool,
    pub decision_to_exec_s: f64,
    pub days_to_resolution: f64,
    /// Realized 5-minute mid sigma, when enough marks exist.
    pub mid_sigma_5m: Option<f64>,
    /// Pinned in the signed manifest.
    pub taker_vol_sigma_max: f64,
    pub now_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id_hex: String,
    pub market_id: String,
    pub snapshot_id: Uuid,
    pub snapshot_hash: String,
    pub side: Side,
    pub size_usd_cents: i64,
    pub limit_price: f64,
    pub p_market: f64,
    pub p_eff: f64,
    pub required_edge: f64,
    pub ev: f64,
    pub friction: Friction,
    pub marketable_allowed: bool,
    pub decided_ms: i64,
}

impl Decision {
    /// Venue idempotency key: the first N hex chars of the decision id, N
    /// from the signed manifest. No attempt counter, ever.
    pub fn client_order_id(&self, max_len: usize) -> String {
        self.decision_id_hex[..max_len.min(self.decision_id_hex.len())].to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionVerdict {
    Trade(Box<Decision>),
    NoTrade(ReasonCode),
}

/// Full decision pass: effective probability, per-side friction, EV rule,
/// deterministic identity.
pub fn decide(inputs: &DecisionInputs<'_>) -> DecisionVerdict {
    let snap = inputs.snapshot;
    if snap.invalid_book {
        return DecisionVerdict::NoTrade(ReasonCode::SnapshotInvalidBook);
    }
    if snap.ask_sum_anomaly {
        return DecisionVerdict::NoTrade(ReasonCode::SnapshotAskSumAnomaly);
    }
    let (Some(bid_yes), Some(ask_yes), Some(bid_no), Some(ask_no)) = (
        snap.yes.best_bid,
        snap.yes.best_ask,
        snap.no.best_bid,
        snap.no.best_ask,
    ) else {
        return DecisionVerdict::NoTrade(ReasonCode::SnapshotInvalidBook);
    };

    // baseline market probability of YES; conservative marking uses the bid
    let p_market = ask_yes;
    let p_eff = match inputs.p_ai_cal {
        None => p_market,
        Some(p_ai) => {
            let raw = p_market + inputs.w_ai * (p_ai - p_market);
            if (raw - p_market).abs() > P_EFF_OUTLIER_THRESHOLD {
                return DecisionVerdict::NoTrade(ReasonCode::PEffOutlier);
            }
            let delta_max = if inputs.dispute_risk >= HIGH_DISPUTE_RISK {
                DELTA_MAX_HIGH_DISPUTE
            } else {
                DELTA_MAX_DEFAULT
            };
            p_market + (raw - p_market).clamp(-delta_max, delta_max)
        }
    };

    let order_usd = inputs.size_usd_cents as f64 / 100.0;
    let fee = fee_cost(inputs.fee_rate_bps, inputs.is_paper);
    let dispute = dispute_buffer(inputs.dispute_risk, inputs.tier1_fallback);
    let latency = latency_penalty(inputs.decision_to_exec_s);
    let time_value = time_value_penalty(inputs.days_to_resolution);

    let friction_yes = Friction {
        spread_cost: spread_cost(bid_yes, ask_yes),
        fee_cost: fee,
        slippage: slippage_buffer(order_usd, snap.yes.top_depth_usd()),
        dispute,
        latency,
        time_value,
    };
    let friction_no = Friction {
        spread_cost: spread_cost(bid_no, ask_no),
        fee_cost: fee,
        slippage: slippage_buffer(order_usd, snap.no.top_depth_usd()),
        dispute,
        latency,
        time_value,
    };

    let ev_yes = p_eff - ask_yes - friction_yes.total();
    let ev_no = (1.0 - p_eff) - ask_no - friction_no.total();

    let (side, ev, entry, friction) = if ev_yes >= ev_no {
        (Side::Yes, ev_yes, ask_yes, friction_yes)
    } else {
        (Side::No, ev_no, ask_no, friction_no)
    };
    if ev < EV_MIN {
        return DecisionVerdict::NoTrade(ReasonCode::EvTooLow);
    }

    let side_spread = match side {
        Side::Yes => ask_yes - bid_yes,
        Side::No => ask_no - bid_no,
    };
    let marketable_allowed = ev >= EV_MIN + MARKETABLE_EV_MARGIN
        && side_spread <= MARKETABLE_MAX_SPREAD
        && inputs
            .mid_sigma_5m
            .is_some_and(|sigma| sigma <= inputs.taker_vol_sigma_max);

    let required_edge = friction.total();
    let decision_id_hex = decision_id(
        &snap.market_id,
        side,
        &snap.book_hash_hex,
        entry,
        inputs.size_usd_cents,
        p_market,
        p_eff,
        required_edge,
        inputs.now_ms,
    );

    DecisionVerdict::Trade(Box::new(Decision {
        decision_id_hex,
        market_id: snap.market_id.clone(),
        snapshot_id: snap.snapshot_id,
        snapshot_hash: snap.book_hash_hex.clone(),
        side,
        size_usd_cents: inputs.size_usd_cents,
        limit_price: entry,
        p_market,
        p_eff,
        required_edge,
        ev,
        friction,
        marketable_allowed,
        decided_ms: inputs.now_ms,
    }))
}

/// Deterministic identity: SHA-256 over the canonical decision string.
/// Identical inputs in the same minute bucket yield identical ids.
#[allow(clippy::too_many_arguments)]
pub fn decision_id(
    market_id: &str,
    side: Side,
    snapshot_hash: &str,
    limit_price: f64,
    size_usd_cents: i64,
    p_market: f64,
    p_eff: f64,
    required_edge: f64,
    ts_ms: i64,
) -> String {
    let canonical = format!(
        "market={market_id}|side={}|snapshot_hash={snapshot_hash}|limit_price={limit_price:.6}|size_cents={size_usd_cents}|p_market={p_market:.6}|p_eff={p_eff:.6}|required_edge={required_edge:.6}|ts_bucket={}",
        side.as_str(),
        ts_ms / TS_BUCKET_MS,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::snapshot::{BookSide, DepthLevel, SnapshotSource};

    fn snapshot(bid_yes: f64, ask_yes: f64, bid_no: f64, ask_no: f64) -> Snapshot {
        let depth = vec![DepthLevel {
            price: 0.5,
            size_usd: 500.0,
        }];
        Snapshot::build(
            "mkt-1",
            0,
            SnapshotSource::Ws,
            0,
            0,
            1,
            1,
            BookSide {
                best_bid: Some(bid_yes),
                best_ask: Some(ask_yes),
                depth: depth.clone(),
            },
            BookSide {
                best_bid: Some(bid_no),
                best_ask: Some(ask_no),
                depth,
            },
        )
    }

    fn inputs(snap: &Snapshot) -> DecisionInputs<'_> {
        DecisionInputs {
            snapshot: snap,
            p_ai_cal: None,
            w_ai: 0.0,
            dispute_risk: 0.0,
            tier1_fallback: false,
            size_usd_cents: 500,
            fee_rate_bps: 0.0,
            is_paper: true,
            decision_to_exec_s: 0.0,
            days_to_resolution: 10.0,
            mid_sigma_5m: None,
            taker_vol_sigma_max: 0.01,
            now_ms: 120_000,
        }
    }

    #[test]
    fn friction_components_match_model() {
        assert!((spread_cost(0.40, 0.42) - 0.01).abs() < 1e-12);
        // paper fee floor doubled
        assert!((fee_cost(0.0, true) - 0.002).abs() < 1e-12);
        assert!((fee_cost(25.0, false) - 0.0025).abs() < 1e-12);
        // slippage floor
        assert!((slippage_buffer(5.0, 1_000.0) - 0.005).abs() < 1e-12);
        assert!((slippage_buffer(500.0, 100.0) - 0.1).abs() < 1e-12);
        assert!((dispute_buffer(0.5, false) - 0.02).abs() < 1e-12);
        assert!((dispute_buffer(0.5, true) - 0.03).abs() < 1e-12);
        assert!((latency_penalty(1.0) - 0.0).abs() < 1e-12);
        assert!((latency_penalty(5.0) - 0.003).abs() < 1e-12);
        assert!((time_value_penalty(10.0) - 0.002).abs() < 1e-12);
        assert!((time_value_penalty(200.0) - 0.02).abs() < 1e-12);
    }

    #[test]
    fn cheap_yes_side_trades() {
        // market says ~35c for YES; our view is neutral 50/50
        let snap = snapshot(0.33, 0.35, 0.63, 0.65);
        let mut input = inputs(&snap);
        input.p_ai_cal = Some(0.50);
        input.w_ai = 0.35;

        match decide(&input) {
            DecisionVerdict::Trade(decision) => {
                assert_eq!(decision.side, Side::Yes);
                assert!(decision.ev >= EV_MIN);
                assert!((decision.p_eff - (0.35 + 0.35 * 0.15)).abs() < 1e-9);
                assert_eq!(decision.limit_price, 0.35);
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn flat_market_is_ev_too_low() {
        let snap = snapshot(0.49, 0.50, 0.49, 0.50);
        let verdict = decide(&inputs(&snap));
        assert_eq!(verdict, DecisionVerdict::NoTrade(ReasonCode::EvTooLow));
    }

    #[test]
    fn raw_shift_beyond_outlier_threshold_refuses() {
        let snap = snapshot(0.18, 0.20, 0.78, 0.80);
        let mut input = inputs(&snap);
        // raw shift = 0.35 * (0.9 - 0.2) = 0.245 > 0.20
        input.p_ai_cal = Some(0.90);
        input.w_ai = 0.35;
        assert_eq!(
            decide(&input),
            DecisionVerdict::NoTrade(ReasonCode::PEffOutlier)
        );
    }

    #[test]
    fn delta_is_clamped_tighter_under_dispute_risk() {
        let snap = snapshot(0.38, 0.40, 0.58, 0.60);
        let mut input = inputs(&snap);
        input.p_ai_cal = Some(0.90);
        input.w_ai = 0.35;
        // raw shift = 0.175: under the outlier bar, over both delta caps
        match decide(&input) {
            DecisionVerdict::Trade(d) => assert!((d.p_eff - 0.50).abs() < 1e-9),
            other => panic!("expected trade, got {other:?}"),
        }

        input.dispute_risk = 0.7;
        match decide(&input) {
            DecisionVerdict::Trade(d) => assert!((d.p_eff - 0.45).abs() < 1e-9),
            DecisionVerdict::NoTrade(reason) => {
                // the tighter clamp may push EV under the bar; either outcome
                // must respect the 0.05 cap, so only EV_TOO_LOW is acceptable
                assert_eq!(reason, ReasonCode::EvTooLow);
            }
        }
    }

    #[test]
    fn anomalous_snapshot_refuses() {
        let mut snap = snapshot(0.40, 0.42, 0.56, 0.58);
        snap.ask_sum_anomaly = true;
        assert_eq!(
            decide(&inputs(&snap)),
            DecisionVerdict::NoTrade(ReasonCode::SnapshotAskSumAnomaly)
        );
    }

    #[test]
    fn decision_id_is_pure_and_bucketed() {
        let id = |ts| {
            decision_id(
                "mkt-1",
                Side::Yes,
                "hash",
                0.42,
                500,
                0.42,
                0.45,
                0.02,
                ts,
            )
        };
        assert_eq!(id(60_000), id(119_999));
        assert_ne!(id(60_000), id(120_000));
        assert_eq!(id(60_000).len(), 64);
    }

    #[test]
    fn client_order_id_is_prefix_of_decision_id() {
        let snap = snapshot(0.33, 0.35, 0.63, 0.65);
        let mut input = inputs(&snap);
        input.p_ai_cal = Some(0.50);
        input.w_ai = 0.35;
        let DecisionVerdict::Trade(decision) = decide(&input) else {
            panic!("expected trade");
        };
        let coid = decision.client_order_id(16);
        assert_eq!(coid.len(), 16);
        assert!(decision.decision_id_hex.starts_with(&coid));
    }

    #[test]
    fn marketable_limit_needs_ev_spread_and_low_vol() {
        let snap = snapshot(0.33, 0.35, 0.63, 0.65);
        let mut input = inputs(&snap);
        input.p_ai_cal = Some(0.60);
        input.w_ai = 0.35;

        // no sigma sample: never marketable
        let DecisionVerdict::Trade(d) = decide(&input) else {
            panic!("expected trade");
        };
        assert!(!d.marketable_allowed);

        input.mid_sigma_5m = Some(0.005);
        let DecisionVerdict::Trade(d) = decide(&input) else {
            panic!("expected trade");
        };
        assert!(d.ev >= EV_MIN + MARKETABLE_EV_MARGIN);
        assert!(d.marketable_allowed);

        // volatile market blocks the taker path
        input.mid_sigma_5m = Some(0.05);
        let DecisionVerdict::Trade(d) = decide(&input) else {
            panic!("expected trade");
        };
        assert!(!d.marketable_allowed);
    }
}
