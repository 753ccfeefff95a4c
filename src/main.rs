mod budget;
mod clients;
mod config;
mod control;
mod error;
mod execution;
mod locks;
mod market;
mod ops;
mod persistence;
mod reasons;
mod reconciliation;
mod startup;
mod state;
mod strategy;
mod time;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::budget::BudgetManager;
use crate::clients::ai::AiAnalyst;
use crate::clients::venue::VenueClient;
use crate::clients::venue_rest::VenueRestClient;
use crate::config::AppConfig;
use crate::control::ControlHandler;
use crate::error::{BotError, BotResult};
use crate::execution::engine::{ExecutionEngine, SubmitReport};
use crate::execution::gate::{check_pre_exec, GateInputs};
use crate::execution::paper::PaperEngine;
use crate::market::candidates::{CandidateRateCaps, CandidateStatus, CandidateStore, TriggerTracker};
use crate::market::feed::{BookUpdate, FeedIngest};
use crate::market::filters::{check_eligibility, MarketInfo};
use crate::market::health::ws_healthy_decision;
use crate::market::snapshot::SnapshotStore;
use crate::ops::alerts::{AlertKind, AlertRouter, ChannelSink};
use crate::persistence::event_log::EventStore;
use crate::persistence::wal::WalWriter;
use crate::reconciliation::{GreenInputs, LocalPosition, ReconcileEngine};
use crate::state::arming::ArmingCeremony;
use crate::state::bot_state::{StateStore, TradingState};
use crate::state::coordinator::Coordinator;
use crate::state::machine::{Blocker, StateMachine};
use crate::state::orders::{OrderStore, Side};
use crate::strategy::calibration::{CalibrationTracker, W_AI_MAX};
use crate::strategy::decision::{decide, DecisionInputs, DecisionVerdict};
use crate::strategy::risk::RiskManager;
use crate::time::{next_utc_midnight_ms, now_ms};

/// Everything the worker loops share; the coordinator stays the only owner
/// of global mutable state.
struct Deps {
    cfg: AppConfig,
    machine: Arc<StateMachine>,
    coordinator: Arc<Coordinator>,
    snapshots: Arc<SnapshotStore>,
    orders: Arc<OrderStore>,
    candidates: Arc<CandidateStore>,
    triggers: Arc<TriggerTracker>,
    rate_caps: Arc<CandidateRateCaps>,
    calibration: Arc<CalibrationTracker>,
    risk: Arc<RiskManager>,
    budget: Arc<BudgetManager>,
    locks: Arc<crate::locks::LockManager>,
    reconcile: Arc<ReconcileEngine>,
    engine: Arc<ExecutionEngine>,
    paper: Arc<PaperEngine>,
    venue: Arc<dyn VenueClient>,
    analyst: Option<Arc<dyn AiAnalyst>>,
    alerts: Arc<AlertRouter>,
    events: Arc<Mutex<EventStore>>,
    watchlist: Arc<Mutex<HashMap<String, MarketInfo>>>,
    taker_vol_sigma_max: f64,
    fee_rate_bps: f64,
}

#[tokio::main]
async fn main() -> BotResult<()> {
    let cfg = config::load_config()?;
    ops::logging::init_with_default(&cfg.infra.log_level);

    let local_state_secret = read_secret(&cfg.paths.secrets_dir, "LOCAL_STATE_SECRET")?;
    let operator_key = read_secret(&cfg.paths.secrets_dir, "OPERATOR_SIGNING_KEY")?;

    let process_start = now_ms();
    let coordinator = Arc::new(Coordinator::new(process_start));
    let machine = Arc::new(StateMachine::new(
        StateStore::new(&cfg.paths.bot_state),
        local_state_secret.clone(),
    ));
    let arming = Arc::new(ArmingCeremony::new(
        cfg.arming.clone(),
        local_state_secret,
        process_start,
    ));
    let orders = Arc::new(OrderStore::new());
    let snapshots = Arc::new(SnapshotStore::new());
    let reconcile = Arc::new(ReconcileEngine::new());
    let wal = Arc::new(Mutex::new(WalWriter::open(&cfg.paths.wal)?));
    let events = Arc::new(Mutex::new(EventStore::open(&cfg.paths.event_log)?));
    let venue: Arc<dyn VenueClient> = Arc::new(VenueRestClient::new(&cfg.venue)?);

    let (tx_alerts, mut rx_alerts) = mpsc::channel(256);
    let alerts = Arc::new(AlertRouter::new(
        Box::new(ChannelSink::new(tx_alerts)),
        60_000,
    ));
    // the control transport (out of scope here) drains this channel
    tokio::spawn(async move {
        while let Some(alert) = rx_alerts.recv().await {
            tracing::warn!(
                target: "alerts_out",
                kind = alert.kind.as_str(),
                dedup_key = %alert.dedup_key,
                message = %alert.message,
                "alert ready for delivery"
            );
        }
    });

    let outcome = startup::run(startup::StartupContext {
        cfg: &cfg,
        operator_key: &operator_key,
        machine: &machine,
        coordinator: &coordinator,
        arming: &arming,
        orders: &orders,
        reconcile: &reconcile,
        venue: venue.as_ref(),
        wal: &wal,
        events: &events,
    })
    .await?;

    let control = Arc::new(ControlHandler::new(
        cfg.control.clone(),
        machine.clone(),
        coordinator.clone(),
        arming.clone(),
        orders.clone(),
        alerts.clone(),
        wal.clone(),
        events.clone(),
        cfg.paths.nonce_store.clone(),
    ));
    let (tx_control, rx_control) = mpsc::channel::<(i64, String)>(64);
    spawn_control_loop(control, rx_control);
    spawn_stdin_console(tx_control);

    let report = match outcome {
        startup::StartupOutcome::Ready(report) => report,
        startup::StartupOutcome::Halted(reason) => {
            let kind = if reason == "CONFIG_TAMPER" {
                AlertKind::ConfigTamper
            } else {
                AlertKind::Halted
            };
            alerts.raise(
                kind,
                format!("halt:startup:{reason}"),
                format!("startup halted: {reason}"),
                now_ms(),
            );
            tracing::error!(target: "boot", reason = %reason, "startup halted; control channel only");
            // sticky HALTED: the process stays up for /status and /unhalt
            futures_util::future::pending::<()>().await;
            unreachable!();
        }
    };

    if report.forced_downgrade.is_some() {
        alerts.raise(
            AlertKind::StartupDowngrade,
            "startup:downgrade",
            "live state downgraded to OBSERVE_ONLY on startup",
            now_ms(),
        );
    }
    if machine.blocker_active(Blocker::ClockSkew) {
        alerts.raise(
            AlertKind::ClockSkew,
            "startup:clock_skew",
            format!("clock skew detected: {:?} ms", report.clock_skew_ms),
            now_ms(),
        );
    }

    tracing::info!(
        target: "boot",
        wal_replayed = report.replay.inserted,
        orphans = report.orphans_adopted,
        wallet = ?report.wallet_usd,
        "polyedge starting workers"
    );

    let wallet0 = report.wallet_usd.unwrap_or(0.0);
    let deps = Arc::new(Deps {
        machine: machine.clone(),
        coordinator: coordinator.clone(),
        snapshots: snapshots.clone(),
        orders: orders.clone(),
        candidates: Arc::new(CandidateStore::new()),
        triggers: Arc::new(TriggerTracker::new(
            cfg.trading.trigger_persist_updates,
            cfg.trading.trigger_persist_min_s,
        )),
        rate_caps: Arc::new(CandidateRateCaps::new(
            cfg.trading.per_market_candidates_per_min_max as usize,
            cfg.trading.candidates_per_min_max as usize,
        )),
        calibration: Arc::new(CalibrationTracker::new()),
        risk: Arc::new(RiskManager::new(cfg.risk.clone())),
        budget: Arc::new(BudgetManager::new(cfg.budget.clone(), wallet0, now_ms())),
        locks: Arc::new(crate::locks::LockManager::new(format!(
            "polyedge-{process_start}"
        ))),
        reconcile: reconcile.clone(),
        engine: Arc::new(ExecutionEngine::new(
            venue.clone(),
            orders.clone(),
            machine.clone(),
            coordinator.clone(),
            wal.clone(),
            events.clone(),
            report.manifest.pinned.client_order_id_max_len,
        )),
        paper: Arc::new(PaperEngine::new(report.manifest.pinned.venue_tick_size, 0.0)),
        venue: venue.clone(),
        analyst: None,
        alerts: alerts.clone(),
        events: events.clone(),
        watchlist: Arc::new(Mutex::new(HashMap::new())),
        taker_vol_sigma_max: report.manifest.pinned.taker_vol_sigma_max,
        fee_rate_bps: 0.0,
        cfg,
    });

    // resolve any orphans adopted from the WAL before anything else trades
    for order in deps.orders.pending_unknown() {
        let deps = deps.clone();
        tokio::spawn(async move {
            match deps.engine.resolve_pending_unknown(order.order_id).await {
                Ok(resolution) => {
                    tracing::info!(target: "boot", ?resolution, "orphan resolved");
                    alert_resolution(&deps, &resolution);
                }
                Err(err) => {
                    tracing::error!(target: "boot", error = %err, "orphan resolution failed");
                }
            }
        });
    }

    // feed ingest: the WS transport (injected) pushes frames into tx_feed
    let (_tx_feed, rx_feed) = mpsc::channel::<BookUpdate>(4096);
    spawn_feed_worker(deps.clone(), rx_feed);

    spawn_pipeline_worker(deps.clone());
    spawn_reconcile_heartbeat(deps.clone());
    spawn_budget_reaper(deps.clone());
    spawn_risk_loop(deps.clone());

    let (shutdown_trigger, shutdown) = ops::shutdown::channel();
    tokio::spawn(ops::shutdown::listen_for_signals(shutdown_trigger));
    shutdown.wait().await;
    tracing::info!(target: "shutdown", "main loop exiting");
    Ok(())
}

fn read_secret(dir: &Path, name: &str) -> BotResult<String> {
    let path = dir.join(name);
    let value = std::fs::read_to_string(&path)
        .map_err(|e| BotError::InsecureSecrets(format!("{name} unreadable: {e}")))?;
    let value = value.trim().to_string();
    if value.is_empty() {
        return Err(BotError::InsecureSecrets(format!("{name} is empty")));
    }
    Ok(value)
}

fn spawn_control_loop(control: Arc<ControlHandler>, mut rx: mpsc::Receiver<(i64, String)>) {
    tokio::spawn(async move {
        while let Some((sender_id, text)) = rx.recv().await {
            let reply = control.handle(sender_id, &text, now_ms());
            tracing::info!(target: "control", sender_id, reply = %reply, "command handled");
            println!("{reply}");
        }
    });
}

/// Local operator console; the Telegram transport feeds the same channel.
fn spawn_stdin_console(tx: mpsc::Sender<(i64, String)>) {
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if tx.send((control::LOCAL_SENDER_ID, line)).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_feed_worker(deps: Arc<Deps>, mut rx_feed: mpsc::Receiver<BookUpdate>) {
    tokio::spawn(async move {
        let ingest = FeedIngest::new(deps.coordinator.clone(), deps.snapshots.clone());
        while let Some(update) = rx_feed.recv().await {
            let was_down = !deps.coordinator.ws_view().connected;
            deps.coordinator.ws_up();
            deps.machine.clear_blocker(Blocker::WsDown);
            if was_down {
                // reconnect is a reconcile trigger
                let deps = deps.clone();
                tokio::spawn(async move {
                    let wallet = deps.coordinator.wallet_usd_last_good().unwrap_or(0.0);
                    let positions = local_positions(&deps);
                    if let Err(err) = deps
                        .reconcile
                        .run_cycle(
                            deps.venue.as_ref(),
                            &deps.orders.active(),
                            &positions,
                            wallet,
                            now_ms(),
                        )
                        .await
                    {
                        tracing::warn!(target: "feed", error = %err, "reconnect reconcile failed");
                        deps.machine.set_blocker(Blocker::ReconcileDegraded);
                    }
                });
            }
            let market_id = update.market_id.clone();
            let snapshot = ingest.ingest(update);
            deps.risk.add_twap_sample(
                &market_id,
                snapshot.yes.best_bid,
                snapshot.yes.best_ask,
                snapshot.yes.top_depth_usd(),
                snapshot.snapshot_at_ms,
            );

            // pessimistic paper fills ride the same book updates
            let fills = deps.paper.on_book_update(
                deps.orders.as_ref(),
                &market_id,
                |order| match order.side {
                    Side::Yes => snapshot.yes.best_ask,
                    Side::No => snapshot.no.best_ask,
                },
                snapshot.snapshot_at_ms,
            );
            for fill in fills {
                if let Some(order) = deps.orders.get(fill.order_id) {
                    deps.risk.open_position(
                        &order.market_id,
                        order.side,
                        fill.fill_usd_cents,
                        fill.fill_price,
                        fill.ts_ms,
                    );
                    deps.risk
                        .record_trade(&order.market_id, fill.fill_price, fill.ts_ms);
                }
            }
        }
        deps.coordinator.ws_down();
        deps.machine.set_blocker(Blocker::WsDown);
        deps.alerts.raise(
            AlertKind::WsDown,
            "feed:closed",
            "ws feed channel closed",
            now_ms(),
        );
        tracing::warn!(target: "feed", "feed channel closed; ingest stopped");
    });
}

fn spawn_pipeline_worker(deps: Arc<Deps>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            deps.cfg.infra.fast_loop_s.max(1),
        ));
        loop {
            tick.tick().await;
            let markets: Vec<String> = {
                let watchlist = deps.watchlist.lock().unwrap_or_else(|p| p.into_inner());
                watchlist.keys().cloned().collect()
            };
            for market_id in markets {
                evaluate_market(&deps, &market_id).await;
            }
        }
    });
}

/// One pass of the candidate -> decision -> execution pipeline for a market.
async fn evaluate_market(deps: &Arc<Deps>, market_id: &str) {
    let now = now_ms();

    let state = match deps.machine.current(now) {
        Ok(bs) => bs,
        Err(err) => {
            tracing::error!(target: "pipeline", error = %err, "state read failed");
            return;
        }
    };
    if !state.state.can_submit() {
        return;
    }
    if state.state == TradingState::PaperTrading && !deps.machine.paper_allowed() {
        return;
    }
    if state.state == TradingState::LiveTrading && !deps.machine.live_allowed() {
        return;
    }
    if deps.coordinator.market_barred(market_id, now) {
        return;
    }

    let Some(snapshot) = deps.snapshots.latest(market_id) else {
        return;
    };
    let info = {
        let watchlist = deps.watchlist.lock().unwrap_or_else(|p| p.into_inner());
        watchlist.get(market_id).cloned()
    };
    let Some(info) = info else {
        return;
    };

    let health = ws_healthy_decision(market_id, &snapshot, deps.coordinator.ws_view(), now);
    if !health.healthy {
        log_no_trade(deps, market_id, reasons::ReasonCode::WsUnhealthyDecision, now);
        return;
    }
    if let Err(reason) = check_eligibility(&info, &snapshot, now / 1000) {
        log_no_trade(deps, market_id, reason, now);
        return;
    }
    if !deps.triggers.observe(market_id, "book_move", now) {
        return;
    }
    if !deps.rate_caps.try_admit(market_id, now) {
        return;
    }

    let candidate = deps.candidates.create(
        market_id,
        snapshot.snapshot_id,
        vec!["book_move".to_string()],
        now,
    );

    // the lock bounds execution attempts in this market; its version is
    // recorded now and re-checked immediately before the submit
    let worker_id = "pipeline";
    let Some(mut grant) = deps.locks.acquire(market_id, worker_id, now) else {
        let _ = deps
            .candidates
            .advance(candidate.candidate_id, CandidateStatus::Dropped);
        return;
    };
    let renewal_due = deps
        .locks
        .get(market_id)
        .map(|lock| now - lock.last_renewed_ms >= crate::locks::LOCK_RENEW_EVERY_MS)
        .unwrap_or(false);
    if renewal_due {
        match deps.locks.renew(market_id, worker_id, now) {
            Some(renewed) => grant = renewed,
            None => {
                if deps.orders.pending_unknown_in_market(market_id) {
                    tracing::error!(
                        target: "pipeline",
                        market_id,
                        "lock renewal failed with pending-unknown"
                    );
                    if let Err(err) = deps
                        .machine
                        .force_halt("LOCK_RENEW_FAILED_DURING_PENDING_UNKNOWN", now)
                    {
                        tracing::error!(target: "pipeline", error = %err, "halt failed");
                    }
                } else {
                    let _ = deps
                        .candidates
                        .advance(candidate.candidate_id, CandidateStatus::Dropped);
                }
                return;
            }
        }
    }

    // evidence gathering is injected upstream; by this point the bundle is in
    let _ = deps
        .candidates
        .advance(candidate.candidate_id, CandidateStatus::EvidenceDone);

    // AI path: reserve, analyze, settle; denial is a NO_TRADE, not a skip.
    let mut p_ai_cal = None;
    let mut dispute_risk = 0.0;
    let mut tier1_fallback = false;
    if let Some(analyst) = &deps.analyst {
        let correlation_id = candidate.candidate_id.to_string();
        match deps.budget.reserve(
            &analyst.model_key(),
            analyst.worst_case_usd(),
            &correlation_id,
            now,
        ) {
            Ok(reservation_id) => {
                match analyst
                    .analyze(
                        market_id.to_string(),
                        snapshot.book_hash_hex.clone(),
                        correlation_id,
                    )
                    .await
                {
                    Ok(estimate) => {
                        p_ai_cal = Some(estimate.p_ai_cal);
                        dispute_risk = estimate.dispute_risk;
                        tier1_fallback = estimate.tier1_fallback;
                        let _ = deps.budget.settle(
                            reservation_id,
                            Some(estimate.actual_cost_usd),
                            now_ms(),
                        );
                    }
                    Err(err) => {
                        tracing::warn!(target: "pipeline", error = %err, "ai analysis failed");
                        let _ = deps.budget.release(reservation_id, now_ms());
                        log_no_trade(deps, market_id, reasons::ReasonCode::AiTimeout, now);
                        let _ = deps
                            .candidates
                            .advance(candidate.candidate_id, CandidateStatus::Dropped);
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::debug!(target: "pipeline", error = %err, "budget denied");
                log_no_trade(deps, market_id, reasons::ReasonCode::AiBudgetDenied, now);
                let _ = deps
                    .candidates
                    .advance(candidate.candidate_id, CandidateStatus::Dropped);
                return;
            }
        }
    }
    let _ = deps
        .candidates
        .advance(candidate.candidate_id, CandidateStatus::AiDone);

    let Some(wallet) = deps.coordinator.wallet_usd_last_good() else {
        log_no_trade(deps, market_id, reasons::ReasonCode::WalletRefStale, now);
        return;
    };
    if let Err(reason) = deps.risk.can_open_position(market_id, wallet) {
        log_no_trade(deps, market_id, reason, now);
        return;
    }
    let venue_available = match deps.venue.balance_usd().await {
        Ok(usd) => usd,
        Err(_) => wallet,
    };
    let size_usd_cents = deps.risk.compute_order_size_cents(wallet, venue_available);
    if size_usd_cents <= 0 {
        log_no_trade(deps, market_id, reasons::ReasonCode::RiskLimitHit, now);
        return;
    }

    let is_paper = state.state == TradingState::PaperTrading;
    let decided_at = now_ms();
    let inputs = DecisionInputs {
        snapshot: &*snapshot,
        p_ai_cal,
        w_ai: deps.calibration.w_ai(&info.category, W_AI_MAX),
        dispute_risk,
        tier1_fallback,
        size_usd_cents,
        fee_rate_bps: deps.fee_rate_bps,
        is_paper,
        decision_to_exec_s: 0.0,
        days_to_resolution: ((info.resolution_at_s - decided_at / 1000) as f64 / 86_400.0)
            .max(0.0),
        mid_sigma_5m: deps.risk.mid_sigma(market_id, decided_at),
        taker_vol_sigma_max: deps.taker_vol_sigma_max,
        now_ms: decided_at,
    };
    let decision = match decide(&inputs) {
        DecisionVerdict::Trade(decision) => *decision,
        DecisionVerdict::NoTrade(reason) => {
            log_no_trade(deps, market_id, reason, decided_at);
            let _ = deps
                .candidates
                .advance(candidate.candidate_id, CandidateStatus::Dropped);
            return;
        }
    };
    let _ = deps
        .candidates
        .advance(candidate.candidate_id, CandidateStatus::Decided);

    // reconcile immediately before any submit; the venue view is
    // authoritative and the gate's RECONCILE_GREEN leans on this cycle
    let positions = local_positions(deps);
    if let Err(err) = deps
        .reconcile
        .run_cycle(
            deps.venue.as_ref(),
            &deps.orders.active(),
            &positions,
            wallet,
            now_ms(),
        )
        .await
    {
        tracing::warn!(target: "pipeline", error = %err, "pre-submit reconcile failed");
        log_no_trade(deps, market_id, reasons::ReasonCode::ReconcileNotGreen, now_ms());
        return;
    }

    if is_paper {
        if let Err(reason) = pre_exec_gate(
            deps,
            market_id,
            worker_id,
            grant.lock_version,
            &snapshot,
            candidate.created_ms,
            decision.decided_ms,
            deps.coordinator.barrier_generation(),
        ) {
            log_no_trade(deps, market_id, reason, now_ms());
            let _ = deps
                .candidates
                .advance(candidate.candidate_id, CandidateStatus::Dropped);
            return;
        }
        match deps.engine.submit_paper(&decision, now_ms()) {
            Ok(order) => {
                tracing::info!(
                    target: "pipeline",
                    market_id,
                    order_id = %order.order_id,
                    side = order.side.as_str(),
                    price = order.price,
                    "paper order resting"
                );
                let _ = deps
                    .candidates
                    .advance(candidate.candidate_id, CandidateStatus::Executed);
            }
            Err(err) => {
                tracing::error!(target: "pipeline", error = %err, "paper submit failed");
                deps.machine.set_blocker(Blocker::DbDegraded);
            }
        }
        return;
    }

    let gate_deps = deps.clone();
    let gate_snapshot = snapshot.clone();
    let gate_market = market_id.to_string();
    let candidate_created_ms = candidate.created_ms;
    let decision_decided_ms = decision.decided_ms;
    let lock_version = grant.lock_version;
    let gate_worker = worker_id.to_string();
    let report = deps
        .engine
        .submit_live(&decision, move |submit_generation| {
            pre_exec_gate(
                &gate_deps,
                &gate_market,
                &gate_worker,
                lock_version,
                gate_snapshot.as_ref(),
                candidate_created_ms,
                decision_decided_ms,
                submit_generation,
            )
        })
        .await;

    match report {
        Ok(SubmitReport::Submitted(order)) => {
            deps.risk.open_position(
                market_id,
                order.side,
                order.size_usd_cents,
                order.price,
                now_ms(),
            );
            let _ = deps
                .candidates
                .advance(candidate.candidate_id, CandidateStatus::Executed);
        }
        Ok(SubmitReport::PendingUnknown(order)) => {
            let deps = deps.clone();
            tokio::spawn(async move {
                match deps.engine.resolve_pending_unknown(order.order_id).await {
                    Ok(resolution) => {
                        tracing::info!(target: "pipeline", ?resolution, "pending resolved");
                        alert_resolution(&deps, &resolution);
                    }
                    Err(err) => {
                        tracing::error!(target: "pipeline", error = %err, "pending resolution failed");
                    }
                }
            });
        }
        Ok(SubmitReport::Aborted(reason)) => {
            log_no_trade(deps, market_id, reason, now_ms());
        }
        Ok(SubmitReport::EventStoreDegraded)
        | Ok(SubmitReport::EventStoreDegradedAfterResult(_)) => {
            deps.machine.set_blocker(Blocker::DbDegraded);
            if let Err(err) = deps.machine.transition(TradingState::ObserveOnly, now_ms()) {
                tracing::error!(target: "pipeline", error = %err, "degrade transition failed");
            }
        }
        Ok(SubmitReport::Rejected(_)) | Ok(SubmitReport::DuplicateDecision) => {}
        Err(err) => {
            // a WAL write failed; this is fatal for exposure-creating paths
            tracing::error!(target: "pipeline", error = %err, "submit failed durably");
            deps.machine.set_blocker(Blocker::WalDegraded);
            if let Err(halt_err) = deps.machine.force_halt("WAL_WRITE_FAILED", now_ms()) {
                tracing::error!(target: "pipeline", error = %halt_err, "halt failed");
            }
        }
    }
}

/// The full pre-exec conjunction, assembled from the live subsystems. Runs
/// immediately before a submit (inside the submit gate on the LIVE path).
#[allow(clippy::too_many_arguments)]
fn pre_exec_gate(
    deps: &Arc<Deps>,
    market_id: &str,
    worker_id: &str,
    lock_version: u64,
    snapshot: &crate::market::snapshot::Snapshot,
    candidate_created_ms: i64,
    decision_decided_ms: i64,
    submit_generation: u64,
) -> Result<(), reasons::ReasonCode> {
    let gate_now = now_ms();
    let durable_state = deps
        .machine
        .current(gate_now)
        .map(|bs| bs.state)
        .map_err(|_| reasons::ReasonCode::StateNotTradable)?;
    let green = deps
        .reconcile
        .reconcile_green(GreenInputs {
            now_ms: gate_now,
            last_ws_message_ms: deps.coordinator.ws_view().last_message_ms,
            barrier_active: deps.coordinator.barrier_active(),
            ws_down: deps.machine.blocker_active(Blocker::WsDown),
            any_pending_unknown: deps.orders.any_pending_unknown(),
        })
        .is_ok();
    let lock_valid = deps
        .locks
        .validate_for_submit(market_id, worker_id, lock_version, gate_now)
        .is_ok();
    check_pre_exec(&GateInputs {
        durable_state,
        barrier_active: deps.coordinator.barrier_active(),
        submit_generation,
        barrier_generation: deps.coordinator.barrier_generation(),
        candidate_created_ms,
        decision_decided_ms,
        market_id,
        snapshot,
        ws: deps.coordinator.ws_view(),
        reconcile_green: green,
        lock_valid,
        active_level2_or_3_mismatches: deps.reconcile.active_level2_or_3(),
        market_barred: deps.coordinator.market_barred(market_id, gate_now),
        now_ms: gate_now,
    })
}

fn alert_resolution(deps: &Arc<Deps>, resolution: &crate::execution::engine::PendingResolution) {
    use crate::execution::engine::PendingResolution;
    match resolution {
        PendingResolution::HaltMismatch => deps.alerts.raise(
            AlertKind::PendingUnknownMismatch,
            "pending:mismatch",
            "venue order does not match the decision; halted",
            now_ms(),
        ),
        PendingResolution::HaltOrphanRisk => deps.alerts.raise(
            AlertKind::OrphanRisk,
            "pending:orphan",
            "pending-unknown order unresolved after its budget; halted",
            now_ms(),
        ),
        PendingResolution::HaltResidualCancelUnknown => deps.alerts.raise(
            AlertKind::Halted,
            "pending:cancel_unknown",
            "residual cancel unresolved; halted",
            now_ms(),
        ),
        PendingResolution::Found { .. } | PendingResolution::AbsentConfirmed { .. } => {}
    }
}

fn local_positions(deps: &Arc<Deps>) -> Vec<LocalPosition> {
    deps.risk
        .positions_snapshot()
        .into_iter()
        .map(|(market_id, position)| LocalPosition {
            market_id,
            side: position.side,
            notional_usd_cents: position.notional_usd_cents,
        })
        .collect()
}

fn log_no_trade(deps: &Arc<Deps>, market_id: &str, reason: reasons::ReasonCode, at_ms: i64) {
    tracing::debug!(
        target: "pipeline",
        market_id,
        reason = reason.as_str(),
        "no trade"
    );
    let payload = serde_json::json!({
        "market_id": market_id,
        "reason": reason.as_str(),
    });
    if let Err(err) = deps
        .events
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .append("NO_TRADE", payload, at_ms)
    {
        tracing::warn!(target: "pipeline", error = %err, "no-trade event write failed");
        deps.machine.set_blocker(Blocker::DbDegraded);
    }
}

fn spawn_reconcile_heartbeat(deps: Arc<Deps>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            deps.cfg.infra.reconcile_heartbeat_s.max(1),
        ));
        loop {
            tick.tick().await;
            let wallet = deps.coordinator.wallet_usd_last_good().unwrap_or(0.0);
            let positions = local_positions(&deps);
            match deps
                .reconcile
                .run_cycle(
                    deps.venue.as_ref(),
                    &deps.orders.active(),
                    &positions,
                    wallet,
                    now_ms(),
                )
                .await
            {
                Ok(report) => {
                    deps.machine.clear_blocker(Blocker::ReconcileDegraded);
                    if report.escalated {
                        deps.alerts.raise(
                            AlertKind::ReconcileEscalation,
                            "reconcile:drift",
                            "cumulative level-1 drift escalated to level-2",
                            now_ms(),
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "reconcile", error = %err, "heartbeat cycle failed");
                    deps.machine.set_blocker(Blocker::ReconcileDegraded);
                }
            }

            match deps.engine.enforce_residuals(now_ms()).await {
                Ok(outcomes) if !outcomes.is_empty() => {
                    for outcome in &outcomes {
                        alert_resolution(&deps, outcome);
                    }
                    // every cancel is followed by its own reconcile cycle
                    let wallet = deps.coordinator.wallet_usd_last_good().unwrap_or(0.0);
                    let positions = local_positions(&deps);
                    if let Err(err) = deps
                        .reconcile
                        .run_cycle(
                            deps.venue.as_ref(),
                            &deps.orders.active(),
                            &positions,
                            wallet,
                            now_ms(),
                        )
                        .await
                    {
                        tracing::warn!(target: "reconcile", error = %err, "post-cancel cycle failed");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(target: "reconcile", error = %err, "residual enforcement failed");
                }
            }
        }
    });
}

fn spawn_budget_reaper(deps: Arc<Deps>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            deps.cfg.budget.reaper_interval_s.max(1),
        ));
        loop {
            tick.tick().await;
            let reaped = deps.budget.reap_expired(now_ms());
            if reaped > 0 && deps.budget.is_degraded() {
                if deps.machine.set_blocker(Blocker::CostAccountingDegraded) {
                    deps.alerts.raise(
                        AlertKind::CostAccountingDegraded,
                        "budget:force_settles",
                        "three or more force-settles today",
                        now_ms(),
                    );
                    let state = deps.machine.current(now_ms()).map(|bs| bs.state);
                    if matches!(state, Ok(state) if state.is_live()) {
                        if let Err(err) =
                            deps.machine.transition(TradingState::ObserveOnly, now_ms())
                        {
                            tracing::error!(target: "budget", error = %err, "degrade failed");
                        }
                    }
                }
            }
        }
    });
}

fn spawn_risk_loop(deps: Arc<Deps>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tick.tick().await;
            let now = now_ms();

            // HALTED_DAILY expires at the next UTC midnight
            match deps.machine.tick_daily_expiry(now) {
                Ok(Some(_)) => deps.risk.reset_daily_pnl(),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(target: "risk", error = %err, "daily expiry check failed")
                }
            }

            // wallet staleness forces OBSERVE_ONLY
            let stale_ms = deps.cfg.risk.wallet_ref_stale_s * 1000;
            if deps.coordinator.wallet_stale(now, stale_ms) {
                let state = deps.machine.current(now).map(|bs| bs.state);
                if matches!(state, Ok(s) if s.can_submit()) {
                    deps.alerts.raise(
                        AlertKind::WalletRefStale,
                        "risk:wallet_stale",
                        "wallet reference stale; downgrading",
                        now,
                    );
                    if let Err(err) = deps.machine.transition(TradingState::ObserveOnly, now) {
                        tracing::error!(target: "risk", error = %err, "stale downgrade failed");
                    }
                }
            }

            // risk marks for open positions; a dead mark chain is a halt and
            // only trade- or TWAP-backed marks may refresh the wallet ref
            let mut marks_trustworthy = true;
            for (market_id, _) in deps.risk.positions_snapshot() {
                match deps.risk.risk_mark(&market_id, now) {
                    Ok(mark) => {
                        if !mark.wallet_refresh_allowed() {
                            marks_trustworthy = false;
                        }
                    }
                    Err(streak) => {
                        marks_trustworthy = false;
                        if streak >= crate::strategy::risk::MARK_FAILURE_HALT_STREAK {
                            tracing::error!(target: "risk", market_id = %market_id, "risk mark dead");
                            if let Err(err) = deps.machine.force_halt("RISK_MARK_UNAVAILABLE", now) {
                                tracing::error!(target: "risk", error = %err, "halt failed");
                            }
                        }
                    }
                }
            }
            if marks_trustworthy {
                if let Ok(balance) = deps.venue.balance_usd().await {
                    deps.coordinator.set_wallet_usd(balance, now_ms());
                    deps.budget.update_wallet(balance);
                }
            }

            // daily stop
            if let Some(wallet) = deps.coordinator.wallet_usd_last_good() {
                if deps.risk.daily_stop_hit(wallet) {
                    let state = deps.machine.current(now).map(|bs| bs.state);
                    if matches!(
                        state,
                        Ok(TradingState::PaperTrading) | Ok(TradingState::LiveTrading)
                    ) {
                        deps.coordinator.raise_barrier();
                        deps.alerts.raise(
                            AlertKind::HaltedDaily,
                            "risk:daily_stop",
                            "daily stop hit; halting until UTC midnight",
                            now,
                        );
                        if let Err(err) =
                            deps.machine.halt_daily(next_utc_midnight_ms(now), now)
                        {
                            tracing::error!(target: "risk", error = %err, "daily halt failed");
                        }
                        // best-effort cancel of resting orders via the engine
                        for order in deps.orders.active() {
                            if order.is_paper || order.exchange_order_id.is_none() {
                                continue;
                            }
                            if let Err(err) = deps.engine.cancel_order(order.order_id).await {
                                tracing::warn!(
                                    target: "risk",
                                    error = %err,
                                    "daily-stop cancel failed"
                                );
                            }
                        }
                        deps.coordinator.clear_barrier();
                    }
                }
            }
        }
    });
}
