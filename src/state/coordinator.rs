use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

/// Point-in-time view of the WS transport used by the health predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsView {
    pub connected: bool,
    pub epoch: u64,
    pub last_message_ms: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct WalletRef {
    usd: f64,
    updated_ms: i64,
}

/// Single owner of the process-global mutable state: the submit barrier and
/// its generation, the WS epoch, and `wallet_usd_last_good`. Everything else
/// reads and writes through this narrow contract, never ambient statics.
#[derive(Debug)]
pub struct Coordinator {
    process_start_unix_ms: i64,
    barrier: AtomicBool,
    barrier_generation: AtomicU64,
    ws_connected: AtomicBool,
    ws_epoch: AtomicU64,
    ws_last_message_ms: AtomicI64,
    wallet: Mutex<Option<WalletRef>>,
    market_bars: Mutex<HashMap<String, i64>>,
}

impl Coordinator {
    pub fn new(process_start_unix_ms: i64) -> Self {
        Self {
            process_start_unix_ms,
            barrier: AtomicBool::new(false),
            barrier_generation: AtomicU64::new(0),
            ws_connected: AtomicBool::new(false),
            ws_epoch: AtomicU64::new(0),
            ws_last_message_ms: AtomicI64::new(0),
            wallet: Mutex::new(None),
            market_bars: Mutex::new(HashMap::new()),
        }
    }

    pub fn process_start_unix_ms(&self) -> i64 {
        self.process_start_unix_ms
    }

    /// Raise the barrier and bump the generation. In-flight submits carry an
    /// older generation and fail the pre-exec gate from here on.
    pub fn raise_barrier(&self) -> u64 {
        self.barrier.store(true, Ordering::SeqCst);
        let generation = self.barrier_generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(target: "coordinator", generation, "barrier raised");
        generation
    }

    pub fn clear_barrier(&self) {
        self.barrier.store(false, Ordering::SeqCst);
        tracing::info!(target: "coordinator", "barrier cleared");
    }

    pub fn barrier_active(&self) -> bool {
        self.barrier.load(Ordering::SeqCst)
    }

    /// Generation stamp taken at the start of a submit attempt.
    pub fn barrier_generation(&self) -> u64 {
        self.barrier_generation.load(Ordering::SeqCst)
    }

    pub fn ws_up(&self) {
        self.ws_connected.store(true, Ordering::SeqCst);
    }

    /// Every disconnect advances the epoch; snapshots stamped with an older
    /// epoch become permanently invalid.
    pub fn ws_down(&self) -> u64 {
        self.ws_connected.store(false, Ordering::SeqCst);
        let epoch = self.ws_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(target: "coordinator", epoch, "ws disconnected; epoch advanced");
        epoch
    }

    pub fn record_ws_message(&self, now_ms: i64) {
        self.ws_last_message_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn ws_view(&self) -> WsView {
        WsView {
            connected: self.ws_connected.load(Ordering::SeqCst),
            epoch: self.ws_epoch.load(Ordering::SeqCst),
            last_message_ms: self.ws_last_message_ms.load(Ordering::SeqCst),
        }
    }

    pub fn set_wallet_usd(&self, usd: f64, now_ms: i64) {
        let mut wallet = self.wallet.lock().unwrap_or_else(|p| p.into_inner());
        *wallet = Some(WalletRef {
            usd,
            updated_ms: now_ms,
        });
    }

    pub fn wallet_usd_last_good(&self) -> Option<f64> {
        self.wallet
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .map(|w| w.usd)
    }

    pub fn wallet_stale(&self, now_ms: i64, max_age_ms: i64) -> bool {
        match *self.wallet.lock().unwrap_or_else(|p| p.into_inner()) {
            Some(w) => now_ms.saturating_sub(w.updated_ms) > max_age_ms,
            None => true,
        }
    }

    /// Bar a market from new orders until `until_ms` (ABSENT_CONFIRMED
    /// cooldown). A later attempt needs a fresh candidate and snapshot.
    pub fn bar_market(&self, market_id: &str, until_ms: i64) {
        self.market_bars
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(market_id.to_string(), until_ms);
        tracing::warn!(target: "coordinator", market_id, until_ms, "market barred");
    }

    pub fn market_barred(&self, market_id: &str, now_ms: i64) -> bool {
        let mut bars = self.market_bars.lock().unwrap_or_else(|p| p.into_inner());
        let Some(until) = bars.get(market_id).copied() else {
            return false;
        };
        if now_ms < until {
            true
        } else {
            bars.remove(market_id);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_bumps_generation() {
        let coord = Coordinator::new(0);
        assert!(!coord.barrier_active());
        assert_eq!(coord.barrier_generation(), 0);

        let generation = coord.raise_barrier();
        assert_eq!(generation, 1);
        assert!(coord.barrier_active());

        coord.clear_barrier();
        assert!(!coord.barrier_active());
        // generation is monotonic; clearing does not rewind it
        assert_eq!(coord.barrier_generation(), 1);
    }

    #[test]
    fn ws_epoch_advances_on_disconnect() {
        let coord = Coordinator::new(0);
        coord.ws_up();
        coord.record_ws_message(50);
        let view = coord.ws_view();
        assert!(view.connected);
        assert_eq!(view.epoch, 0);
        assert_eq!(view.last_message_ms, 50);

        coord.ws_down();
        let view = coord.ws_view();
        assert!(!view.connected);
        assert_eq!(view.epoch, 1);
    }

    #[test]
    fn wallet_staleness() {
        let coord = Coordinator::new(0);
        assert!(coord.wallet_stale(0, 3_600_000));

        coord.set_wallet_usd(250.0, 1_000);
        assert!(!coord.wallet_stale(1_000 + 3_600_000, 3_600_000));
        assert!(coord.wallet_stale(1_001 + 3_600_000, 3_600_000));
        assert_eq!(coord.wallet_usd_last_good(), Some(250.0));
    }

    #[test]
    fn market_bar_expires() {
        let coord = Coordinator::new(0);
        coord.bar_market("mkt-1", 5_000);
        assert!(coord.market_barred("mkt-1", 4_999));
        assert!(!coord.market_barred("mkt-1", 5_000));
        // bar is removed after expiry
        assert!(!coord.market_barred("mkt-1", 4_000));
    }
}
