use crate::market::snapshot::{Snapshot, SnapshotSource};
use crate::state::coordinator::WsView;

pub const WS_HEARTBEAT_MS: i64 = 10_000;
pub const MAX_SNAPSHOT_AGE_DECISION_MS: i64 = 6_000;
pub const MAX_SNAPSHOT_AGE_EXEC_MS: i64 = 3_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthVerdict {
    pub healthy: bool,
    pub reasons: Vec<String>,
}

/// Decision-side freshness predicate (6 s bound).
pub fn ws_healthy_decision(
    market_id: &str,
    snapshot: &Snapshot,
    ws: WsView,
    now_ms: i64,
) -> HealthVerdict {
    ws_healthy(market_id, snapshot, ws, now_ms, MAX_SNAPSHOT_AGE_DECISION_MS)
}

/// Execution-side freshness predicate (3 s bound), otherwise identical.
pub fn ws_healthy_exec(
    market_id: &str,
    snapshot: &Snapshot,
    ws: WsView,
    now_ms: i64,
) -> HealthVerdict {
    ws_healthy(market_id, snapshot, ws, now_ms, MAX_SNAPSHOT_AGE_EXEC_MS)
}

fn ws_healthy(
    market_id: &str,
    snapshot: &Snapshot,
    ws: WsView,
    now_ms: i64,
    max_age_ms: i64,
) -> HealthVerdict {
    let mut reasons = Vec::new();

    if !ws.connected {
        reasons.push("ws not connected".to_string());
    }
    let global_age = now_ms - ws.last_message_ms;
    if global_age > WS_HEARTBEAT_MS {
        reasons.push(format!(
            "global ws message stale: {global_age}ms > {WS_HEARTBEAT_MS}ms"
        ));
    }
    if snapshot.source != SnapshotSource::Ws {
        reasons.push("snapshot source is not WS".to_string());
    }
    if snapshot.ws_epoch != ws.epoch {
        reasons.push(format!(
            "ws epoch mismatch: snapshot={} current={}",
            snapshot.ws_epoch, ws.epoch
        ));
    }
    if snapshot.market_id != market_id {
        reasons.push(format!(
            "market mismatch: snapshot={} expected={market_id}",
            snapshot.market_id
        ));
    }
    if snapshot.market_last_ws_update_ms <= 0 {
        reasons.push("market_last_ws_update_ms missing".to_string());
    } else {
        let age = now_ms - snapshot.market_last_ws_update_ms;
        if age > max_age_ms {
            reasons.push(format!(
                "market ws update stale: {age}ms > {max_age_ms}ms"
            ));
        }
    }
    if snapshot.orderbook_last_change_ms <= 0 {
        reasons.push("orderbook_last_change_ms missing".to_string());
    } else {
        let age = now_ms - snapshot.orderbook_last_change_ms;
        if age > max_age_ms {
            reasons.push(format!(
                "orderbook change stale: {age}ms > {max_age_ms}ms"
            ));
        }
    }
    if snapshot.ws_last_message_ms < snapshot.snapshot_at_ms {
        reasons.push(format!(
            "ws_last_message_ms ({}) < snapshot_at_ms ({})",
            snapshot.ws_last_message_ms, snapshot.snapshot_at_ms
        ));
    }

    HealthVerdict {
        healthy: reasons.is_empty(),
        reasons,
    }
}
