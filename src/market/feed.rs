use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::market::snapshot::{BookSide, Snapshot, SnapshotSource, SnapshotStore};
use crate::state::coordinator::Coordinator;

/// One top-of-book + depth frame from the (injected) WS transport.
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub market_id: String,
    pub yes: BookSide,
    pub no: BookSide,
    pub ts_ms: i64,
}

#[derive(Debug, Clone)]
struct MarketFeedState {
    last_book_hash: String,
    orderbook_last_change_ms: i64,
}

/// Turns feed frames into immutable snapshots: stamps the WS epoch and
/// message times from the coordinator and tracks when each market's book
/// content actually changed.
pub struct FeedIngest {
    coordinator: Arc<Coordinator>,
    store: Arc<SnapshotStore>,
    per_market: Mutex<HashMap<String, MarketFeedState>>,
}

impl FeedIngest {
    pub fn new(coordinator: Arc<Coordinator>, store: Arc<SnapshotStore>) -> Self {
        Self {
            coordinator,
            store,
            per_market: Mutex::new(HashMap::new()),
        }
    }

    pub fn ingest(&self, update: BookUpdate) -> Arc<Snapshot> {
        self.coordinator.record_ws_message(update.ts_ms);
        let ws = self.coordinator.ws_view();

        let snapshot = Snapshot::build(
            update.market_id.clone(),
            update.ts_ms,
            SnapshotSource::Ws,
            ws.epoch,
            ws.last_message_ms,
            update.ts_ms,
            // placeholder; fixed up below once we know whether the book moved
            update.ts_ms,
            update.yes,
            update.no,
        );

        let mut per_market = self.per_market.lock().unwrap_or_else(|p| p.into_inner());
        let change_ms = match per_market.get(&update.market_id) {
            Some(state) if state.last_book_hash == snapshot.book_hash_hex => {
                state.orderbook_last_change_ms
            }
            _ => update.ts_ms,
        };
        per_market.insert(
            update.market_id.clone(),
            MarketFeedState {
                last_book_hash: snapshot.book_hash_hex.clone(),
                orderbook_last_change_ms: change_ms,
            },
        );

        let mut snapshot = snapshot;
        snapshot.orderbook_last_change_ms = change_ms;
        self.store.insert(snapshot)
    }
}
