use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::config::ControlConfig;
use crate::error::BotResult;
use crate::ops::alerts::{AlertKind, AlertRouter};
use crate::persistence::event_log::EventStore;
use crate::persistence::wal::{WalRecordType, WalWriter};
use crate::state::arming::ArmingCeremony;
use crate::state::bot_state::TradingState;
use crate::state::coordinator::Coordinator;
use crate::state::machine::StateMachine;
use crate::state::orders::OrderStore;

/// The local console feeds commands with this sender id; it is trusted even
/// when the allowlist is empty.
pub const LOCAL_SENDER_ID: i64 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Status,
    Halt,
    Unhalt { totp: String },
    ResumePaper { totp: String },
    ArmLive,
    ConfirmLiveStep1 { nonce1: String, totp: String },
    ConfirmLiveStep2 { nonce2: String, totp: String },
}

impl ControlCommand {
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let command = parts.next()?;
        match command {
            "/status" => Some(ControlCommand::Status),
            "/halt" => Some(ControlCommand::Halt),
            "/unhalt" => Some(ControlCommand::Unhalt {
                totp: parts.next()?.to_string(),
            }),
            "/resume_paper" => Some(ControlCommand::ResumePaper {
                totp: parts.next()?.to_string(),
            }),
            "/arm_live" => Some(ControlCommand::ArmLive),
            "/confirm_live_step1" => Some(ControlCommand::ConfirmLiveStep1 {
                nonce1: parts.next()?.to_string(),
                totp: parts.next()?.to_string(),
            }),
            "/confirm_live_step2" => Some(ControlCommand::ConfirmLiveStep2 {
                nonce2: parts.next()?.to_string(),
                totp: parts.next()?.to_string(),
            }),
            _ => None,
        }
    }
}

/// Dispatches allowlisted operator commands into the state machine, the
/// arming ceremony and the coordinator. Replies are plain text for the
/// control transport to deliver.
pub struct ControlHandler {
    cfg: ControlConfig,
    machine: Arc<StateMachine>,
    coordinator: Arc<Coordinator>,
    arming: Arc<ArmingCeremony>,
    orders: Arc<OrderStore>,
    alerts: Arc<AlertRouter>,
    wal: Arc<Mutex<WalWriter>>,
    events: Arc<Mutex<EventStore>>,
    nonce_store: std::path::PathBuf,
}

impl ControlHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ControlConfig,
        machine: Arc<StateMachine>,
        coordinator: Arc<Coordinator>,
        arming: Arc<ArmingCeremony>,
        orders: Arc<OrderStore>,
        alerts: Arc<AlertRouter>,
        wal: Arc<Mutex<WalWriter>>,
        events: Arc<Mutex<EventStore>>,
        nonce_store: std::path::PathBuf,
    ) -> Self {
        Self {
            cfg,
            machine,
            coordinator,
            arming,
            orders,
            alerts,
            wal,
            events,
            nonce_store,
        }
    }

    fn sender_allowed(&self, sender_id: i64) -> bool {
        if self.cfg.allowed_user_ids.is_empty() {
            sender_id == LOCAL_SENDER_ID
        } else {
            self.cfg.allowed_user_ids.contains(&sender_id)
        }
    }

    pub fn handle(&self, sender_id: i64, text: &str, now_ms: i64) -> String {
        if !self.sender_allowed(sender_id) {
            tracing::warn!(target: "control", sender_id, "command from non-allowlisted sender");
            return "unauthorized".to_string();
        }
        let Some(command) = ControlCommand::parse(text) else {
            return "unknown command".to_string();
        };
        match self.dispatch(command, now_ms) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(target: "control", error = %err, "command failed");
                format!("error: {err}")
            }
        }
    }

    fn dispatch(&self, command: ControlCommand, now_ms: i64) -> BotResult<String> {
        match command {
            ControlCommand::Status => {
                let state = self.machine.current(now_ms)?;
                let blockers: Vec<&str> = self
                    .machine
                    .active_blockers()
                    .iter()
                    .map(|b| b.as_str())
                    .collect();
                Ok(format!(
                    "state={} counter={} barrier={} generation={} pending_unknown={} blockers=[{}] wallet={:?}",
                    state.state.as_str(),
                    state.counter,
                    self.coordinator.barrier_active(),
                    self.coordinator.barrier_generation(),
                    self.orders.pending_unknown().len(),
                    blockers.join(","),
                    self.coordinator.wallet_usd_last_good(),
                ))
            }
            ControlCommand::Halt => {
                let generation = self.coordinator.raise_barrier();
                self.machine.force_halt("OPERATOR_HALT", now_ms)?;
                self.alerts.raise(
                    AlertKind::Halted,
                    "halt:operator",
                    "operator halt; barrier raised",
                    now_ms,
                );
                Ok(format!("halted; barrier generation {generation}"))
            }
            ControlCommand::Unhalt { totp } => {
                self.arming.validate_totp(&totp, now_ms)?;
                let state = self.machine.current(now_ms)?;
                if state.state != TradingState::Halted {
                    return Ok(format!("not halted (state={})", state.state.as_str()));
                }
                self.machine.transition(TradingState::ObserveOnly, now_ms)?;
                self.coordinator.clear_barrier();
                Ok("unhalted to OBSERVE_ONLY".to_string())
            }
            ControlCommand::ResumePaper { totp } => {
                self.arming.validate_totp(&totp, now_ms)?;
                if !self.machine.paper_allowed() {
                    return Ok("blockers forbid PAPER".to_string());
                }
                self.machine
                    .transition(TradingState::PaperTrading, now_ms)?;
                Ok("PAPER_TRADING resumed".to_string())
            }
            ControlCommand::ArmLive => {
                let nonce1 = self.arming.begin(now_ms, &self.nonce_store)?;
                Ok(format!("nonce1={nonce1} (single use, 120s)"))
            }
            ControlCommand::ConfirmLiveStep1 { nonce1, totp } => {
                let nonce2 = self.arming.step1(&nonce1, &totp, now_ms, &self.nonce_store)?;
                let armed_until = now_ms + 300_000;
                self.machine
                    .transition_with(TradingState::LiveArmed, now_ms, |bs| {
                        bs.armed_until_ms = Some(armed_until);
                    })?;
                self.alerts.raise(
                    AlertKind::LiveArmed,
                    "arming:step1",
                    "LIVE_ARMED; write the arming file and confirm step 2",
                    now_ms,
                );
                Ok(format!("armed until +300s; nonce2={nonce2}"))
            }
            ControlCommand::ConfirmLiveStep2 { nonce2, totp } => {
                let state = self.machine.current(now_ms)?;
                if state.state != TradingState::LiveArmed {
                    return Ok(format!("not armed (state={})", state.state.as_str()));
                }
                match state.armed_until_ms {
                    Some(until) if now_ms <= until => {}
                    _ => return Ok("arming window expired".to_string()),
                }

                self.arming.step2(&nonce2, &totp, now_ms)?;

                let payload = json!({
                    "from": TradingState::LiveArmed.as_str(),
                    "to": TradingState::LiveTrading.as_str(),
                    "cause": "arming_ceremony",
                });
                self.wal
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .append(WalRecordType::StateChanged, payload.clone())?;
                self.events
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .append("STATE_CHANGED", payload, now_ms)?;
                self.machine
                    .transition(TradingState::LiveTrading, now_ms)?;

                if let Err(err) = self.arming.consume_arming_file() {
                    self.machine.force_halt("ARMING_FILE_DELETE_FAILED", now_ms)?;
                    return Err(err);
                }

                self.alerts.raise(
                    AlertKind::LiveTrading,
                    "arming:step2",
                    "LIVE_TRADING entered",
                    now_ms,
                );
                Ok("LIVE_TRADING".to_string())
            }
        }
    }
}
