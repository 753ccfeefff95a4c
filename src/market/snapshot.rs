use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const ASK_SUM_LOW: f64 = 0.98;
pub const ASK_SUM_HIGH: f64 = 2.00;
pub const DEPTH_LEVELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotSource {
    Ws,
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub size_usd: f64,
}

/// Top-of-book plus depth for one token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookSide {
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub depth: Vec<DepthLevel>,
}

impl BookSide {
    pub fn top_depth_usd(&self) -> f64 {
        self.depth
            .iter()
            .take(DEPTH_LEVELS)
            .map(|l| l.size_usd)
            .sum()
    }

    pub fn spread(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some(0.5 * (bid + ask)),
            _ => None,
        }
    }
}

/// Immutable per-market price/depth record. Once built it is never mutated;
/// the store hands out `Arc`s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub market_id: String,
    pub snapshot_at_ms: i64,
    pub source: SnapshotSource,
    pub ws_epoch: u64,
    pub ws_last_message_ms: i64,
    pub market_last_ws_update_ms: i64,
    pub orderbook_last_change_ms: i64,
    pub yes: BookSide,
    pub no: BookSide,
    pub book_hash_hex: String,
    pub invalid_book: bool,
    pub ask_sum_anomaly: bool,
}

impl Snapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        market_id: impl Into<String>,
        snapshot_at_ms: i64,
        source: SnapshotSource,
        ws_epoch: u64,
        ws_last_message_ms: i64,
        market_last_ws_update_ms: i64,
        orderbook_last_change_ms: i64,
        yes: BookSide,
        no: BookSide,
    ) -> Self {
        let book_hash_hex = book_hash(&yes, &no);
        let invalid_book = detect_invalid_book(&yes, &no);
        let ask_sum_anomaly = detect_ask_sum_anomaly(yes.best_ask, no.best_ask);
        Self {
            snapshot_id: Uuid::new_v4(),
            market_id: market_id.into(),
            snapshot_at_ms,
            source,
            ws_epoch,
            ws_last_message_ms,
            market_last_ws_update_ms,
            orderbook_last_change_ms,
            yes,
            no,
            book_hash_hex,
            invalid_book,
            ask_sum_anomaly,
        }
    }

}

/// Canonical book serialization: sorted keys, prices to 6 fractional digits,
/// sizes to 2, so identical books hash identically across processes.
fn canonical_book_json(yes: &BookSide, no: &BookSide) -> String {
    fn fmt_price(v: Option<f64>) -> serde_json::Value {
        match v {
            Some(v) => serde_json::Value::String(format!("{v:.6}")),
            None => serde_json::Value::Null,
        }
    }
    fn fmt_depth(levels: &[DepthLevel]) -> serde_json::Value {
        serde_json::Value::Array(
            levels
                .iter()
                .take(DEPTH_LEVELS)
                .map(|l| {
                    serde_json::Value::Array(vec![
                        serde_json::Value::String(format!("{:.6}", l.price)),
                        serde_json::Value::String(format!("{:.2}", l.size_usd)),
                    ])
                })
                .collect(),
        )
    }

    serde_json::json!({
        "best_ask_no": fmt_price(no.best_ask),
        "best_ask_yes": fmt_price(yes.best_ask),
        "best_bid_no": fmt_price(no.best_bid),
        "best_bid_yes": fmt_price(yes.best_bid),
        "depth_no": fmt_depth(&no.depth),
        "depth_yes": fmt_depth(&yes.depth),
    })
    .to_string()
}

fn book_hash(yes: &BookSide, no: &BookSide) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_book_json(yes, no).as_bytes());
    hex::encode(hasher.finalize())
}

/// Invalid book: any price outside (0, 1), bid above ask on either side, or
/// a missing best on either side.
pub fn detect_invalid_book(yes: &BookSide, no: &BookSide) -> bool {
    let quotes = [yes.best_bid, yes.best_ask, no.best_bid, no.best_ask];
    if quotes.iter().any(Option::is_none) {
        return true;
    }
    if quotes
        .iter()
        .flatten()
        .any(|p| *p <= 0.0 || *p >= 1.0)
    {
        return true;
    }
    if let (Some(bid), Some(ask)) = (yes.best_bid, yes.best_ask) {
        if bid > ask {
            return true;
        }
    }
    if let (Some(bid), Some(ask)) = (no.best_bid, no.best_ask) {
        if bid > ask {
            return true;
        }
    }
    false
}

/// Binary-consistency anomaly on the ask sum; 0.98 and 2.00 exactly are fine.
pub fn detect_ask_sum_anomaly(best_ask_yes: Option<f64>, best_ask_no: Option<f64>) -> bool {
    match (best_ask_yes, best_ask_no) {
        (Some(yes), Some(no)) => {
            let sum = yes + no;
            sum < ASK_SUM_LOW || sum > ASK_SUM_HIGH
        }
        _ => true,
    }
}

/// Append-only snapshot store. Readers get `Arc`s and need no locks beyond
/// the insert path.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    by_id: HashMap<Uuid, Arc<Snapshot>>,
    latest_by_market: HashMap<String, Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.by_id.insert(snapshot.snapshot_id, snapshot.clone());
        inner
            .latest_by_market
            .insert(snapshot.market_id.clone(), snapshot.clone());
        snapshot
    }

    pub fn get(&self, snapshot_id: Uuid) -> Option<Arc<Snapshot>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .by_id
            .get(&snapshot_id)
            .cloned()
    }

    pub fn latest(&self, market_id: &str) -> Option<Arc<Snapshot>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .latest_by_market
            .get(market_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(bid: f64, ask: f64) -> BookSide {
        BookSide {
            best_bid: Some(bid),
            best_ask: Some(ask),
            depth: vec![DepthLevel {
                price: ask,
                size_usd: 100.0,
            }],
        }
    }

    #[test]
    fn ask_sum_boundaries() {
        // 0.979 anomalous, 0.98 clean
        assert!(detect_ask_sum_anomaly(Some(0.489), Some(0.49)));
        assert!(!detect_ask_sum_anomaly(Some(0.49), Some(0.49)));
        // 2.00 clean, 2.001 anomalous
        assert!(!detect_ask_sum_anomaly(Some(0.999), Some(1.001)));
        assert!(detect_ask_sum_anomaly(Some(1.0), Some(1.001)));
        // missing ask is anomalous
        assert!(detect_ask_sum_anomaly(None, Some(0.5)));
    }

    #[test]
    fn invalid_book_detection() {
        assert!(!detect_invalid_book(&side(0.40, 0.42), &side(0.56, 0.58)));
        // bid above ask
        assert!(detect_invalid_book(&side(0.45, 0.42), &side(0.56, 0.58)));
        // price at the boundary
        let mut bad = side(0.40, 0.42);
        bad.best_ask = Some(1.0);
        assert!(detect_invalid_book(&bad, &side(0.56, 0.58)));
        // missing best
        let mut missing = side(0.40, 0.42);
        missing.best_bid = None;
        assert!(detect_invalid_book(&missing, &side(0.56, 0.58)));
    }

    #[test]
    fn book_hash_is_deterministic_and_sensitive() {
        let a = Snapshot::build("m", 0, SnapshotSource::Ws, 0, 0, 0, 0, side(0.4, 0.42), side(0.56, 0.58));
        let b = Snapshot::build("m", 1, SnapshotSource::Ws, 0, 0, 0, 0, side(0.4, 0.42), side(0.56, 0.58));
        assert_eq!(a.book_hash_hex, b.book_hash_hex);

        let c = Snapshot::build("m", 1, SnapshotSource::Ws, 0, 0, 0, 0, side(0.4, 0.43), side(0.56, 0.58));
        assert_ne!(a.book_hash_hex, c.book_hash_hex);
    }

    #[test]
    fn store_tracks_latest_per_market() {
        let store = SnapshotStore::new();
        let s1 = store.insert(Snapshot::build(
            "m1", 1, SnapshotSource::Ws, 0, 0, 0, 0, side(0.4, 0.42), side(0.56, 0.58),
        ));
        let s2 = store.insert(Snapshot::build(
            "m1", 2, SnapshotSource::Ws, 0, 0, 0, 0, side(0.41, 0.43), side(0.55, 0.57),
        ));

        assert_eq!(store.latest("m1").unwrap().snapshot_id, s2.snapshot_id);
        assert_eq!(store.get(s1.snapshot_id).unwrap().snapshot_at_ms, 1);
        assert!(store.latest("m2").is_none());
    }
}
