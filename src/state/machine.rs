use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::{BotError, BotResult};
use crate::state::bot_state::{BotState, StateStore, TradingState};

/// Fail-closed conditions, orthogonal to the durable state. Any set blocker
/// bars new exposure; all but COST_ACCOUNTING_DEGRADED bar PAPER too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Blocker {
    WsDown,
    DbDegraded,
    WalDegraded,
    ReconcileDegraded,
    ClockSkew,
    CostAccountingDegraded,
    InjectionDetectorInvalid,
}

impl Blocker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Blocker::WsDown => "WS_DOWN",
            Blocker::DbDegraded => "DB_DEGRADED",
            Blocker::WalDegraded => "WAL_DEGRADED",
            Blocker::ReconcileDegraded => "RECONCILE_DEGRADED",
            Blocker::ClockSkew => "CLOCK_SKEW",
            Blocker::CostAccountingDegraded => "COST_ACCOUNTING_DEGRADED",
            Blocker::InjectionDetectorInvalid => "INJECTION_DETECTOR_INVALID",
        }
    }

    pub fn inhibits_paper(&self) -> bool {
        !matches!(self, Blocker::CostAccountingDegraded)
    }
}

/// Owner of the durable state lifecycle. Every mutation re-reads and
/// re-verifies the signed row; nothing is cached across await points.
pub struct StateMachine {
    store: StateStore,
    secret: String,
    blockers: Mutex<HashSet<Blocker>>,
}

impl StateMachine {
    pub fn new(store: StateStore, secret: impl Into<String>) -> Self {
        Self {
            store,
            secret: secret.into(),
            blockers: Mutex::new(HashSet::new()),
        }
    }

    /// Read and verify the durable row. A missing row is initialised to
    /// OBSERVE_ONLY; a row failing signature verification is replaced with a
    /// freshly signed HALTED row.
    pub fn current(&self, now_ms: i64) -> BotResult<BotState> {
        match self.store.load()? {
            None => {
                let bs = BotState::initial(now_ms, &self.secret);
                self.store.save(&bs)?;
                tracing::info!(target: "state", "bot state initialised: OBSERVE_ONLY");
                Ok(bs)
            }
            Some(bs) if bs.verify(&self.secret) => Ok(bs),
            Some(bs) => {
                tracing::error!(
                    target: "state",
                    counter = bs.counter,
                    "bot state signature verification failed; forcing HALTED"
                );
                let mut halted = bs;
                halted.state = TradingState::Halted;
                halted.counter += 1;
                halted.ts_ms = now_ms;
                halted.armed_until_ms = None;
                halted.sign(&self.secret);
                self.store.save(&halted)?;
                Ok(halted)
            }
        }
    }

    pub fn transition(&self, to: TradingState, now_ms: i64) -> BotResult<BotState> {
        self.transition_with(to, now_ms, |_| {})
    }

    pub fn transition_with(
        &self,
        to: TradingState,
        now_ms: i64,
        mutate: impl FnOnce(&mut BotState),
    ) -> BotResult<BotState> {
        let current = self.current(now_ms)?;
        if !is_legal(current.state, to) {
            return Err(BotError::InvalidTransition {
                from: current.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        let mut next = current.clone();
        next.state = to;
        next.counter += 1;
        next.ts_ms = now_ms;
        if !to.is_live() {
            next.armed_until_ms = None;
        }
        if to != TradingState::HaltedDaily {
            next.halt_until_ms = None;
            next.halt_resume_state = None;
        }
        mutate(&mut next);
        next.sign(&self.secret);
        self.store.save(&next)?;
        tracing::info!(
            target: "state",
            from = current.state.as_str(),
            to = to.as_str(),
            counter = next.counter,
            "state transition"
        );
        Ok(next)
    }

    /// HALTED is reachable from every state and sticky.
    pub fn force_halt(&self, reason: &str, now_ms: i64) -> BotResult<BotState> {
        tracing::error!(target: "state", reason = %reason, "forcing HALTED");
        self.transition(TradingState::Halted, now_ms)
    }

    /// Daily stop: remember what to resume into at the next UTC midnight.
    pub fn halt_daily(&self, halt_until_ms: i64, now_ms: i64) -> BotResult<BotState> {
        let prior = self.current(now_ms)?.state;
        let resume = if prior == TradingState::PaperTrading {
            TradingState::PaperTrading
        } else {
            TradingState::ObserveOnly
        };
        self.transition_with(TradingState::HaltedDaily, now_ms, |bs| {
            bs.halt_until_ms = Some(halt_until_ms);
            bs.halt_resume_state = Some(resume);
        })
    }

    /// Expire HALTED_DAILY once its midnight deadline has passed. Returns the
    /// new state when a transition happened.
    pub fn tick_daily_expiry(&self, now_ms: i64) -> BotResult<Option<BotState>> {
        let current = self.current(now_ms)?;
        if current.state != TradingState::HaltedDaily {
            return Ok(None);
        }
        let Some(until) = current.halt_until_ms else {
            return Ok(None);
        };
        if now_ms < until {
            return Ok(None);
        }
        let resume = current
            .halt_resume_state
            .unwrap_or(TradingState::ObserveOnly);
        Ok(Some(self.transition(resume, now_ms)?))
    }

    pub fn set_blocker(&self, blocker: Blocker) -> bool {
        let newly = self
            .blockers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(blocker);
        if newly {
            tracing::warn!(target: "state", blocker = blocker.as_str(), "blocker set");
        }
        newly
    }

    pub fn clear_blocker(&self, blocker: Blocker) -> bool {
        let cleared = self
            .blockers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&blocker);
        if cleared {
            tracing::info!(target: "state", blocker = blocker.as_str(), "blocker cleared");
        }
        cleared
    }

    pub fn blocker_active(&self, blocker: Blocker) -> bool {
        self.blockers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&blocker)
    }

    pub fn active_blockers(&self) -> Vec<Blocker> {
        self.blockers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Zero blockers is a precondition for any LIVE submit.
    pub fn live_allowed(&self) -> bool {
        self.blockers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }

    /// PAPER may continue under COST_ACCOUNTING_DEGRADED only.
    pub fn paper_allowed(&self) -> bool {
        self.blockers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .all(|b| !b.inhibits_paper())
    }
}

fn is_legal(from: TradingState, to: TradingState) -> bool {
    use TradingState::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (_, Halted) => true,
        (Halted, ObserveOnly) => true,
        (HaltedDaily, ObserveOnly | PaperTrading) => true,
        (ObserveOnly, PaperTrading) | (PaperTrading, ObserveOnly) => true,
        (ObserveOnly | PaperTrading, LiveArmed) => true,
        (LiveArmed, LiveTrading) => true,
        (LiveArmed | LiveTrading, ObserveOnly | PaperTrading) => true,
        (ObserveOnly | PaperTrading | LiveTrading, HaltedDaily) => true,
        _ => false,
    }
}
