use std::fmt;

/// Canonical no-trade / abort reason codes as they appear in the event log.
/// Every fail-closed path resolves to the most specific code available.
#[allow(dead_code)] // evidence/injection/AI codes are produced by the injected collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    WsUnhealthyDecision,
    WsUnhealthyExec,
    SnapshotInvalidBook,
    SnapshotAskSumAnomaly,
    SpreadTooWide,
    DepthTooThin,
    MarketNotEligible,
    TimeToResolutionOutOfRange,
    EvidenceRequired,
    EvidenceConflict,
    EvidenceTier1Insufficient,
    InjectionDetected,
    AiBudgetDenied,
    AiQuorumFailed,
    AiDisagreement,
    AiSchemaInvalid,
    AiTimeout,
    PEffOutlier,
    EvTooLow,
    RiskLimitHit,
    ReconcileNotGreen,
    LockLost,
    BarrierActive,
    StateNotTradable,
    CandidateExpired,
    DecisionStale,
    MismatchActive,
    MarketBarred,
    WalletRefStale,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::WsUnhealthyDecision => "WS_UNHEALTHY_DECISION",
            ReasonCode::WsUnhealthyExec => "WS_UNHEALTHY_EXEC",
            ReasonCode::SnapshotInvalidBook => "SNAPSHOT_INVALID_BOOK",
            ReasonCode::SnapshotAskSumAnomaly => "SNAPSHOT_ASK_SUM_ANOMALY",
            ReasonCode::SpreadTooWide => "SPREAD_TOO_WIDE",
            ReasonCode::DepthTooThin => "DEPTH_TOO_THIN",
            ReasonCode::MarketNotEligible => "MARKET_NOT_ELIGIBLE",
            ReasonCode::TimeToResolutionOutOfRange => "TIME_TO_RESOLUTION_OUT_OF_RANGE",
            ReasonCode::EvidenceRequired => "EVIDENCE_REQUIRED",
            ReasonCode::EvidenceConflict => "EVIDENCE_CONFLICT",
            ReasonCode::EvidenceTier1Insufficient => "EVIDENCE_TIER1_INSUFFICIENT",
            ReasonCode::InjectionDetected => "INJECTION_DETECTED",
            ReasonCode::AiBudgetDenied => "AI_BUDGET_DENIED",
            ReasonCode::AiQuorumFailed => "AI_QUORUM_FAILED",
            ReasonCode::AiDisagreement => "AI_DISAGREEMENT",
            ReasonCode::AiSchemaInvalid => "AI_SCHEMA_INVALID",
            ReasonCode::AiTimeout => "AI_TIMEOUT",
            ReasonCode::PEffOutlier => "P_EFF_OUTLIER",
            ReasonCode::EvTooLow => "EV_TOO_LOW",
            ReasonCode::RiskLimitHit => "RISK_LIMIT_HIT",
            ReasonCode::ReconcileNotGreen => "RECONCILE_NOT_GREEN",
            ReasonCode::LockLost => "LOCK_LOST",
            ReasonCode::BarrierActive => "BARRIER_ACTIVE",
            ReasonCode::StateNotTradable => "STATE_NOT_TRADABLE",
            ReasonCode::CandidateExpired => "CANDIDATE_EXPIRED",
            ReasonCode::DecisionStale => "DECISION_STALE",
            ReasonCode::MismatchActive => "MISMATCH_ACTIVE",
            ReasonCode::MarketBarred => "MARKET_BARRED",
            ReasonCode::WalletRefStale => "WALLET_REF_STALE",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
