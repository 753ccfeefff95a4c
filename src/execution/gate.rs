use crate::market::health::ws_healthy_exec;
use crate::market::snapshot::Snapshot;
use crate::reasons::ReasonCode;
use crate::state::bot_state::TradingState;
use crate::state::coordinator::WsView;

pub const CANDIDATE_MAX_AGE_MS: i64 = 120_000;
pub const DECISION_TO_EXEC_MAX_MS: i64 = 8_000;

/// Everything the pre-exec gate looks at, gathered immediately before the
/// network submit. No suspension is allowed between this check and the
/// outbound call other than the call itself.
#[derive(Debug, Clone)]
pub struct GateInputs<'a> {
    pub durable_state: TradingState,
    pub barrier_active: bool,
    pub submit_generation: u64,
    pub barrier_generation: u64,
    pub candidate_created_ms: i64,
    pub decision_decided_ms: i64,
    pub market_id: &'a str,
    pub snapshot: &'a Snapshot,
    pub ws: WsView,
    pub reconcile_green: bool,
    pub lock_valid: bool,
    pub active_level2_or_3_mismatches: usize,
    pub market_barred: bool,
    pub now_ms: i64,
}

/// The full conjunction from the execution design; every failure maps to its
/// most specific reason code. Order matters only for which code is reported
/// first; all conditions are required.
pub fn check_pre_exec(inputs: &GateInputs<'_>) -> Result<(), ReasonCode> {
    if !inputs.durable_state.can_submit() {
        return Err(ReasonCode::StateNotTradable);
    }
    if inputs.barrier_active || inputs.submit_generation != inputs.barrier_generation {
        return Err(ReasonCode::BarrierActive);
    }
    if inputs.now_ms - inputs.candidate_created_ms > CANDIDATE_MAX_AGE_MS {
        return Err(ReasonCode::CandidateExpired);
    }
    let health = ws_healthy_exec(inputs.market_id, inputs.snapshot, inputs.ws, inputs.now_ms);
    if !health.healthy {
        return Err(ReasonCode::WsUnhealthyExec);
    }
    if inputs.snapshot.ws_epoch != inputs.ws.epoch {
        return Err(ReasonCode::WsUnhealthyExec);
    }
    if inputs.now_ms - inputs.decision_decided_ms > DECISION_TO_EXEC_MAX_MS {
        return Err(ReasonCode::DecisionStale);
    }
    if !inputs.reconcile_green {
        return Err(ReasonCode::ReconcileNotGreen);
    }
    if !inputs.lock_valid {
        return Err(ReasonCode::LockLost);
    }
    if inputs.active_level2_or_3_mismatches > 0 {
        return Err(ReasonCode::MismatchActive);
    }
    if inputs.market_barred {
        return Err(ReasonCode::MarketBarred);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::snapshot::{BookSide, DepthLevel, SnapshotSource};

    fn snapshot(now_ms: i64) -> Snapshot {
        let side = BookSide {
            best_bid: Some(0.40),
            best_ask: Some(0.42),
            depth: vec![DepthLevel {
                price: 0.42,
                size_usd: 120.0,
            }],
        };
        Snapshot::build(
            "mkt-1",
            now_ms,
            SnapshotSource::Ws,
            0,
            now_ms,
            now_ms,
            now_ms,
            side.clone(),
            side,
        )
    }

    fn passing<'a>(snapshot: &'a Snapshot, now_ms: i64) -> GateInputs<'a> {
        GateInputs {
            durable_state: TradingState::PaperTrading,
            barrier_active: false,
            submit_generation: 0,
            barrier_generation: 0,
            candidate_created_ms: now_ms - 1_000,
            decision_decided_ms: now_ms - 500,
            market_id: "mkt-1",
            snapshot,
            ws: WsView {
                connected: true,
                epoch: 0,
                last_message_ms: now_ms,
            },
            reconcile_green: true,
            lock_valid: true,
            active_level2_or_3_mismatches: 0,
            market_barred: false,
            now_ms,
        }
    }

    #[test]
    fn all_conditions_met_passes() {
        let snap = snapshot(100_000);
        assert!(check_pre_exec(&passing(&snap, 100_000)).is_ok());
    }

    #[test]
    fn observe_only_and_halted_cannot_submit() {
        let snap = snapshot(100_000);
        let mut inputs = passing(&snap, 100_000);
        inputs.durable_state = TradingState::ObserveOnly;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::StateNotTradable));
        inputs.durable_state = TradingState::Halted;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::StateNotTradable));
        // armed is not yet trading
        inputs.durable_state = TradingState::LiveArmed;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::StateNotTradable));
    }

    #[test]
    fn generation_mismatch_is_barrier_active() {
        let snap = snapshot(100_000);
        let mut inputs = passing(&snap, 100_000);
        // a halt happened after this submit started
        inputs.barrier_generation = 1;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::BarrierActive));

        let mut inputs = passing(&snap, 100_000);
        inputs.barrier_active = true;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::BarrierActive));
    }

    #[test]
    fn candidate_age_boundary() {
        let snap = snapshot(100_000);
        let mut inputs = passing(&snap, 100_000);
        inputs.candidate_created_ms = 100_000 - CANDIDATE_MAX_AGE_MS;
        assert!(check_pre_exec(&inputs).is_ok());
        inputs.candidate_created_ms -= 1;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::CandidateExpired));
    }

    #[test]
    fn decision_to_exec_boundary_at_eight_seconds() {
        let snap = snapshot(100_000);
        let mut inputs = passing(&snap, 100_000);
        inputs.decision_decided_ms = 100_000 - DECISION_TO_EXEC_MAX_MS;
        assert!(check_pre_exec(&inputs).is_ok());
        // 8.001s fails
        inputs.decision_decided_ms -= 1;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::DecisionStale));
    }

    #[test]
    fn stale_snapshot_fails_exec_health() {
        let snap = snapshot(100_000);
        // 8.5s later: candidate and decision fresh enough, snapshot is not
        let mut inputs = passing(&snap, 108_500);
        inputs.candidate_created_ms = 100_000;
        inputs.decision_decided_ms = 105_000;
        inputs.ws.last_message_ms = 108_500;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::WsUnhealthyExec));
    }

    #[test]
    fn remaining_conjuncts_each_block() {
        let snap = snapshot(100_000);

        let mut inputs = passing(&snap, 100_000);
        inputs.reconcile_green = false;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::ReconcileNotGreen));

        let mut inputs = passing(&snap, 100_000);
        inputs.lock_valid = false;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::LockLost));

        let mut inputs = passing(&snap, 100_000);
        inputs.active_level2_or_3_mismatches = 1;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::MismatchActive));

        let mut inputs = passing(&snap, 100_000);
        inputs.market_barred = true;
        assert_eq!(check_pre_exec(&inputs), Err(ReasonCode::MarketBarred));
    }
}
