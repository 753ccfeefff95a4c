use std::sync::Mutex;

use serde_json::json;

use crate::clients::venue::VenueClient;
use crate::config::{verify_manifest, verify_secret_permissions, AppConfig, SignedManifest};
use crate::error::BotResult;
use crate::persistence::event_log::EventStore;
use crate::persistence::wal::{replay_into_event_store, ReplayStats, WalRecordType, WalWriter};
use crate::reconciliation::ReconcileEngine;
use crate::state::arming::ArmingCeremony;
use crate::state::bot_state::TradingState;
use crate::state::coordinator::Coordinator;
use crate::state::machine::{Blocker, StateMachine};
use crate::state::orders::OrderStore;
use crate::time::now_ms;

pub const CLOCK_SKEW_MAX_MS: i64 = 5_000;

pub struct StartupContext<'a> {
    pub cfg: &'a AppConfig,
    pub operator_key: &'a str,
    pub machine: &'a StateMachine,
    pub coordinator: &'a Coordinator,
    pub arming: &'a ArmingCeremony,
    pub orders: &'a OrderStore,
    pub reconcile: &'a ReconcileEngine,
    pub venue: &'a dyn VenueClient,
    pub wal: &'a Mutex<WalWriter>,
    pub events: &'a Mutex<EventStore>,
}

#[derive(Debug)]
pub struct StartupReport {
    pub manifest: SignedManifest,
    pub forced_downgrade: Option<TradingState>,
    pub replay: ReplayStats,
    pub orphans_adopted: usize,
    pub clock_skew_ms: Option<i64>,
    pub wallet_usd: Option<f64>,
}

#[derive(Debug)]
pub enum StartupOutcome {
    Ready(StartupReport),
    /// A fail-closed step tripped; the durable state is HALTED and no worker
    /// may start. Only the control channel runs.
    Halted(String),
}

/// The strictly ordered startup sequence. Every step that can create or hide
/// exposure fails closed; nothing trades until the whole sequence completes.
pub async fn run(ctx: StartupContext<'_>) -> BotResult<StartupOutcome> {
    let started = now_ms();

    // 1. signed config manifest
    let manifest = match verify_manifest(
        &ctx.cfg.paths.manifest,
        &ctx.cfg.paths.config_dir,
        ctx.operator_key,
    ) {
        Ok(manifest) => manifest,
        Err(err) => {
            tracing::error!(target: "startup", error = %err, "manifest verification failed");
            ctx.machine.force_halt("CONFIG_TAMPER", started)?;
            return Ok(StartupOutcome::Halted("CONFIG_TAMPER".to_string()));
        }
    };

    // 2. secret-file permissions
    if let Err(err) = verify_secret_permissions(&ctx.cfg.paths.secrets_dir) {
        tracing::error!(target: "startup", error = %err, "secret permissions invalid");
        ctx.machine.force_halt("CONFIG_INVALID", started)?;
        return Ok(StartupOutcome::Halted("CONFIG_INVALID".to_string()));
    }

    // 3. clock-drift probe
    let clock_skew_ms = match ctx.venue.server_time_ms().await {
        Ok(server_ms) => {
            let skew = now_ms() - server_ms;
            if skew.abs() > CLOCK_SKEW_MAX_MS {
                tracing::error!(target: "startup", skew_ms = skew, "clock skew beyond bound");
                ctx.machine.set_blocker(Blocker::ClockSkew);
            }
            Some(skew)
        }
        Err(err) => {
            tracing::warn!(target: "startup", error = %err, "clock probe failed; failing closed");
            ctx.machine.set_blocker(Blocker::ClockSkew);
            None
        }
    };

    // 4. read + verify the signed state row (tamper forces HALTED inside)
    let state_at_boot = ctx.machine.current(now_ms())?;

    // 5. a restart can never resume LIVE; downgrade durably through the WAL
    let forced_downgrade = if state_at_boot.state.is_live() {
        let payload = json!({
            "from": state_at_boot.state.as_str(),
            "to": TradingState::ObserveOnly.as_str(),
            "cause": "startup",
        });
        let downgraded = (|| -> BotResult<()> {
            ctx.wal
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .append(WalRecordType::StateChanged, payload.clone())?;
            ctx.events
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .append("STATE_CHANGED", payload, now_ms())?;
            ctx.machine
                .transition(TradingState::ObserveOnly, now_ms())?;
            Ok(())
        })();
        if let Err(err) = downgraded {
            tracing::error!(target: "startup", error = %err, "startup downgrade failed");
            ctx.machine.force_halt("STARTUP_DOWNGRADE_FAILED", now_ms())?;
            return Ok(StartupOutcome::Halted("STARTUP_DOWNGRADE_FAILED".to_string()));
        }
        tracing::warn!(
            target: "startup",
            from = state_at_boot.state.as_str(),
            "startup force-downgrade to OBSERVE_ONLY"
        );
        Some(state_at_boot.state)
    } else {
        None
    };

    // 6. stale arming file from a previous process
    if let Err(err) = ctx.arming.remove_arming_file() {
        tracing::error!(target: "startup", error = %err, "arming file removal failed");
        ctx.machine.force_halt("ARMING_FILE_REMOVAL_FAILED", now_ms())?;
        return Ok(StartupOutcome::Halted("ARMING_FILE_REMOVAL_FAILED".to_string()));
    }

    // 7. persisted nonces from a previous process
    if let Err(err) = ArmingCeremony::invalidate_persisted_nonces(&ctx.cfg.paths.nonce_store) {
        tracing::error!(target: "startup", error = %err, "nonce invalidation failed");
        ctx.machine.force_halt("NONCE_INVALIDATION_FAILED", now_ms())?;
        return Ok(StartupOutcome::Halted("NONCE_INVALIDATION_FAILED".to_string()));
    }

    // 8. deterministic WAL replay; orphaned intents become PENDING_UNKNOWN
    let (replay, orphans) = {
        let mut events = ctx.events.lock().unwrap_or_else(|p| p.into_inner());
        match replay_into_event_store(&ctx.cfg.paths.wal, &mut events) {
            Ok(result) => result,
            Err(err) => {
                drop(events);
                tracing::error!(target: "startup", error = %err, "wal replay failed");
                ctx.machine.force_halt("WAL_REPLAY_FAILED", now_ms())?;
                return Ok(StartupOutcome::Halted("WAL_REPLAY_FAILED".to_string()));
            }
        }
    };
    for orphan in &orphans {
        ctx.orders.adopt_orphan(orphan, now_ms());
    }

    // 9. initial reconciliation, which also covers the adopted orphans
    let local_orders = ctx.orders.active();
    match ctx
        .reconcile
        .run_cycle(ctx.venue, &local_orders, &[], 0.0, now_ms())
        .await
    {
        Ok(report) => {
            tracing::info!(
                target: "startup",
                flagged = report.flagged,
                "initial reconciliation complete"
            );
        }
        Err(err) => {
            tracing::error!(target: "startup", error = %err, "initial reconciliation failed");
            ctx.machine.set_blocker(Blocker::ReconcileDegraded);
        }
    }

    // 10. wallet reference; without it the bot stays OBSERVE_ONLY
    let wallet_usd = match ctx.venue.balance_usd().await {
        Ok(usd) => {
            ctx.coordinator.set_wallet_usd(usd, now_ms());
            Some(usd)
        }
        Err(err) => {
            tracing::warn!(target: "startup", error = %err, "wallet fetch failed");
            None
        }
    };

    Ok(StartupOutcome::Ready(StartupReport {
        manifest,
        forced_downgrade,
        replay,
        orphans_adopted: orphans.len(),
        clock_skew_ms,
        wallet_usd,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::venue::{BookTop, LimitOrderRequest, Outcome, VenueFill, VenueOrder, VenuePosition};
    use crate::config::{file_sha256_hex, PinnedValues};
    use crate::error::BotError;
    use crate::state::bot_state::StateStore;
    use crate::state::orders::OrderStatus;
    use futures_util::future::BoxFuture;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    struct StubVenue {
        server_time_skew_ms: i64,
        balance: BotResult<f64>,
    }

    impl VenueClient for StubVenue {
        fn list_open_orders(&self) -> BoxFuture<'static, BotResult<Vec<VenueOrder>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn list_fills(&self, _since_ms: i64) -> BoxFuture<'static, BotResult<Vec<VenueFill>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn list_positions(&self) -> BoxFuture<'static, BotResult<Vec<VenuePosition>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn balance_usd(&self) -> BoxFuture<'static, BotResult<f64>> {
            let balance = match &self.balance {
                Ok(v) => Ok(*v),
                Err(_) => Err(BotError::Other("balance unavailable".to_string())),
            };
            Box::pin(async move { balance })
        }
        fn server_time_ms(&self) -> BoxFuture<'static, BotResult<i64>> {
            let skew = self.server_time_skew_ms;
            Box::pin(async move { Ok(now_ms() - skew) })
        }
        fn best_prices(&self, _market_id: String) -> BoxFuture<'static, BotResult<BookTop>> {
            Box::pin(async {
                Ok(BookTop {
                    best_bid: Some(0.4),
                    best_ask: Some(0.42),
                })
            })
        }
        fn submit_limit_order(
            &self,
            _request: LimitOrderRequest,
        ) -> BoxFuture<'static, Outcome<VenueOrder>> {
            Box::pin(async { Outcome::Ambiguous("not used".to_string()) })
        }
        fn cancel_order(&self, _exchange_order_id: String) -> BoxFuture<'static, Outcome<()>> {
            Box::pin(async { Outcome::Ambiguous("not used".to_string()) })
        }
        fn lookup_order(&self, _client_order_id: String) -> BoxFuture<'static, Outcome<VenueOrder>> {
            Box::pin(async { Outcome::AbsentConfirmed })
        }
    }

    struct Fixture {
        dir: PathBuf,
        cfg: AppConfig,
        machine: StateMachine,
        coordinator: Coordinator,
        arming: ArmingCeremony,
        orders: OrderStore,
        reconcile: ReconcileEngine,
        wal: Mutex<WalWriter>,
        events: Mutex<EventStore>,
    }

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        dir.push(format!("{prefix}_{}_{}", std::process::id(), nanos));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn write_manifest(dir: &Path, operator_key: &str) {
        let artifact = dir.join("config").join("evidence_sources.json");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"{}").unwrap();
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "evidence_sources.json".to_string(),
            file_sha256_hex(&artifact).unwrap(),
        );
        let mut manifest = SignedManifest {
            artifacts,
            pinned: PinnedValues {
                client_order_id_max_len: 16,
                venue_tick_size: 0.01,
                taker_vol_sigma_max: 0.01,
                model_pricing_usd_per_mtoken: BTreeMap::new(),
            },
            sig_hex: String::new(),
        };
        manifest.sign(operator_key);
        std::fs::write(
            dir.join("config").join("manifest.json"),
            serde_json::to_string(&manifest).unwrap(),
        )
        .unwrap();
    }

    fn fixture(prefix: &str) -> Fixture {
        let dir = temp_dir(prefix);
        write_manifest(&dir, "operator-key");
        std::fs::create_dir_all(dir.join("secrets")).unwrap();

        let mut cfg = AppConfig::default();
        cfg.paths.wal = dir.join("polyedge.wal");
        cfg.paths.event_log = dir.join("events.jsonl");
        cfg.paths.bot_state = dir.join("bot_state.json");
        cfg.paths.nonce_store = dir.join("nonces.json");
        cfg.paths.manifest = dir.join("config").join("manifest.json");
        cfg.paths.config_dir = dir.join("config");
        cfg.paths.secrets_dir = dir.join("secrets");
        cfg.arming.file_path = dir.join("armed");

        let machine = StateMachine::new(StateStore::new(&cfg.paths.bot_state), "secret");
        let coordinator = Coordinator::new(now_ms());
        let arming = ArmingCeremony::new(cfg.arming.clone(), "secret", now_ms());
        let wal = Mutex::new(WalWriter::open(&cfg.paths.wal).expect("wal"));
        let events = Mutex::new(EventStore::open(&cfg.paths.event_log).expect("events"));

        Fixture {
            dir,
            cfg,
            machine,
            coordinator,
            arming,
            orders: OrderStore::new(),
            reconcile: ReconcileEngine::new(),
            wal,
            events,
        }
    }

    fn context<'a>(fx: &'a Fixture, venue: &'a StubVenue) -> StartupContext<'a> {
        StartupContext {
            cfg: &fx.cfg,
            operator_key: "operator-key",
            machine: &fx.machine,
            coordinator: &fx.coordinator,
            arming: &fx.arming,
            orders: &fx.orders,
            reconcile: &fx.reconcile,
            venue,
            wal: &fx.wal,
            events: &fx.events,
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_ready() {
        let fx = fixture("startup_happy");
        let venue = StubVenue {
            server_time_skew_ms: 0,
            balance: Ok(500.0),
        };

        let outcome = run(context(&fx, &venue)).await.expect("run");
        let StartupOutcome::Ready(report) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert!(report.forced_downgrade.is_none());
        assert_eq!(report.wallet_usd, Some(500.0));
        assert_eq!(fx.coordinator.wallet_usd_last_good(), Some(500.0));
        assert!(fx.reconcile.last_completed_ms().is_some());

        let _ = std::fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test]
    async fn live_state_is_downgraded_before_workers() {
        let fx = fixture("startup_downgrade");
        fx.machine.current(0).unwrap();
        fx.machine.transition(TradingState::LiveArmed, 1).unwrap();
        fx.machine.transition(TradingState::LiveTrading, 2).unwrap();

        let venue = StubVenue {
            server_time_skew_ms: 0,
            balance: Ok(500.0),
        };
        let outcome = run(context(&fx, &venue)).await.expect("run");
        let StartupOutcome::Ready(report) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert_eq!(report.forced_downgrade, Some(TradingState::LiveTrading));
        assert_eq!(
            fx.machine.current(now_ms()).unwrap().state,
            TradingState::ObserveOnly
        );

        // the downgrade is durably recorded in WAL and event store
        let records = crate::persistence::wal::WalReader::new(&fx.cfg.paths.wal)
            .read_all()
            .unwrap();
        assert!(records
            .iter()
            .any(|r| r.record_type == WalRecordType::StateChanged));

        let _ = std::fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test]
    async fn tampered_manifest_halts() {
        let fx = fixture("startup_tamper");
        std::fs::write(
            fx.cfg.paths.config_dir.join("evidence_sources.json"),
            b"{\"tampered\":true}",
        )
        .unwrap();

        let venue = StubVenue {
            server_time_skew_ms: 0,
            balance: Ok(500.0),
        };
        let outcome = run(context(&fx, &venue)).await.expect("run");
        assert!(matches!(outcome, StartupOutcome::Halted(reason) if reason == "CONFIG_TAMPER"));
        assert_eq!(
            fx.machine.current(now_ms()).unwrap().state,
            TradingState::Halted
        );

        let _ = std::fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test]
    async fn clock_skew_sets_blocker() {
        let fx = fixture("startup_skew");
        let venue = StubVenue {
            server_time_skew_ms: 10_000,
            balance: Ok(500.0),
        };
        let outcome = run(context(&fx, &venue)).await.expect("run");
        assert!(matches!(outcome, StartupOutcome::Ready(_)));
        assert!(fx.machine.blocker_active(Blocker::ClockSkew));
        assert!(!fx.machine.paper_allowed());

        let _ = std::fs::remove_dir_all(&fx.dir);
    }

    #[tokio::test]
    async fn wal_orphan_is_adopted_pending_unknown() {
        let fx = fixture("startup_orphan");
        // a LIVE intent with no result: the process died mid-submit
        fx.wal
            .lock()
            .unwrap()
            .append(
                WalRecordType::OrderIntent,
                json!({
                    "decision_id_hex": "feed01",
                    "market_id": "mkt-9",
                    "side": "YES",
                    "client_order_id": "feed01",
                    "price": 0.4,
                    "size_usd_cents": 700,
                }),
            )
            .unwrap();

        let venue = StubVenue {
            server_time_skew_ms: 0,
            balance: Ok(500.0),
        };
        let outcome = run(context(&fx, &venue)).await.expect("run");
        let StartupOutcome::Ready(report) = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert_eq!(report.orphans_adopted, 1);

        let pending = fx.orders.pending_unknown();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OrderStatus::PendingUnknown);
        assert_eq!(pending[0].market_id, "mkt-9");
        // the startup state is OBSERVE_ONLY regardless of what died
        assert_eq!(
            fx.machine.current(now_ms()).unwrap().state,
            TradingState::ObserveOnly
        );

        let _ = std::fs::remove_dir_all(&fx.dir);
    }
}
