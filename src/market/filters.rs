use crate::market::snapshot::Snapshot;
use crate::reasons::ReasonCode;

pub const TIME_TO_RESOLUTION_MIN_S: i64 = 3_600;
pub const TIME_TO_RESOLUTION_MAX_S: i64 = 90 * 86_400;
pub const MIN_VOLUME_24H_USD: f64 = 500.0;
pub const MIN_LIQUIDITY_USD: f64 = 1_000.0;
pub const MAX_SPREAD_ABS: f64 = 0.03;
pub const MIN_DEPTH_USD_NEAR_TOP: f64 = 50.0;

/// Registry-sourced facts about a market, refreshed out of band.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub market_id: String,
    pub category: String,
    pub resolution_at_s: i64,
    pub volume_24h_usd: f64,
    pub liquidity_usd: f64,
}

/// Market-quality gate run before a candidate is worth evidence or AI spend.
/// Returns the most specific failing code.
pub fn check_eligibility(
    info: &MarketInfo,
    snapshot: &Snapshot,
    now_s: i64,
) -> Result<(), ReasonCode> {
    if snapshot.invalid_book {
        return Err(ReasonCode::SnapshotInvalidBook);
    }
    if snapshot.ask_sum_anomaly {
        return Err(ReasonCode::SnapshotAskSumAnomaly);
    }

    let ttr = info.resolution_at_s - now_s;
    if ttr < TIME_TO_RESOLUTION_MIN_S || ttr > TIME_TO_RESOLUTION_MAX_S {
        return Err(ReasonCode::TimeToResolutionOutOfRange);
    }
    if info.volume_24h_usd < MIN_VOLUME_24H_USD || info.liquidity_usd < MIN_LIQUIDITY_USD {
        return Err(ReasonCode::MarketNotEligible);
    }

    for side in [&snapshot.yes, &snapshot.no] {
        match side.spread() {
            Some(spread) if spread <= MAX_SPREAD_ABS => {}
            Some(_) => return Err(ReasonCode::SpreadTooWide),
            None => return Err(ReasonCode::SnapshotInvalidBook),
        }
        if side.top_depth_usd() < MIN_DEPTH_USD_NEAR_TOP {
            return Err(ReasonCode::DepthTooThin);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::snapshot::{BookSide, DepthLevel, SnapshotSource};

    fn snapshot(bid: f64, ask: f64, depth_usd: f64) -> Snapshot {
        let side = BookSide {
            best_bid: Some(bid),
            best_ask: Some(ask),
            depth: vec![DepthLevel {
                price: ask,
                size_usd: depth_usd,
            }],
        };
        Snapshot::build("mkt-1", 0, SnapshotSource::Ws, 0, 0, 1, 1, side.clone(), side)
    }

    fn info(resolution_at_s: i64) -> MarketInfo {
        MarketInfo {
            market_id: "mkt-1".to_string(),
            category: "economics".to_string(),
            resolution_at_s,
            volume_24h_usd: 10_000.0,
            liquidity_usd: 50_000.0,
        }
    }

    #[test]
    fn eligible_market_passes() {
        let snap = snapshot(0.40, 0.42, 200.0);
        assert!(check_eligibility(&info(100_000), &snap, 0).is_ok());
    }

    #[test]
    fn resolution_window_bounds() {
        let snap = snapshot(0.40, 0.42, 200.0);
        assert_eq!(
            check_eligibility(&info(3_599), &snap, 0).unwrap_err(),
            ReasonCode::TimeToResolutionOutOfRange
        );
        assert_eq!(
            check_eligibility(&info(91 * 86_400), &snap, 0).unwrap_err(),
            ReasonCode::TimeToResolutionOutOfRange
        );
    }

    #[test]
    fn wide_spread_and_thin_depth_fail() {
        let snap = snapshot(0.40, 0.44, 200.0);
        assert_eq!(
            check_eligibility(&info(100_000), &snap, 0).unwrap_err(),
            ReasonCode::SpreadTooWide
        );

        let snap = snapshot(0.40, 0.42, 20.0);
        assert_eq!(
            check_eligibility(&info(100_000), &snap, 0).unwrap_err(),
            ReasonCode::DepthTooThin
        );
    }

    #[test]
    fn volume_floor_fails_closed() {
        let snap = snapshot(0.40, 0.42, 200.0);
        let mut thin = info(100_000);
        thin.volume_24h_usd = 100.0;
        assert_eq!(
            check_eligibility(&thin, &snap, 0).unwrap_err(),
            ReasonCode::MarketNotEligible
        );
    }

    #[test]
    fn anomalous_snapshot_takes_priority() {
        let mut snap = snapshot(0.40, 0.42, 200.0);
        snap.invalid_book = true;
        assert_eq!(
            check_eligibility(&info(100_000), &snap, 0).unwrap_err(),
            ReasonCode::SnapshotInvalidBook
        );
    }
}
