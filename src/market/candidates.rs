use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::{BotError, BotResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateStatus {
    New,
    Filtered,
    EvidenceDone,
    AiDone,
    Decided,
    Executed,
    Dropped,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::New => "NEW",
            CandidateStatus::Filtered => "FILTERED",
            CandidateStatus::EvidenceDone => "EVIDENCE_DONE",
            CandidateStatus::AiDone => "AI_DONE",
            CandidateStatus::Decided => "DECIDED",
            CandidateStatus::Executed => "EXECUTED",
            CandidateStatus::Dropped => "DROPPED",
        }
    }

}

fn transition_legal(from: CandidateStatus, to: CandidateStatus) -> bool {
    use CandidateStatus::*;
    match (from, to) {
        (New, Filtered | EvidenceDone | Dropped) => true,
        (EvidenceDone, AiDone | Dropped) => true,
        (AiDone, Decided | Dropped) => true,
        (Decided, Executed | Dropped) => true,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub candidate_id: Uuid,
    pub market_id: String,
    pub snapshot_id: Uuid,
    pub created_ms: i64,
    pub trigger_reasons: Vec<String>,
    pub status: CandidateStatus,
    pub state_version: u64,
}

/// Candidate lifecycle store with monotonic per-candidate state versions.
#[derive(Debug, Default)]
pub struct CandidateStore {
    inner: Mutex<HashMap<Uuid, Candidate>>,
}

impl CandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        market_id: impl Into<String>,
        snapshot_id: Uuid,
        trigger_reasons: Vec<String>,
        now_ms: i64,
    ) -> Candidate {
        let candidate = Candidate {
            candidate_id: Uuid::new_v4(),
            market_id: market_id.into(),
            snapshot_id,
            created_ms: now_ms,
            trigger_reasons,
            status: CandidateStatus::New,
            state_version: 1,
        };
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(candidate.candidate_id, candidate.clone());
        candidate
    }

    pub fn get(&self, candidate_id: Uuid) -> Option<Candidate> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&candidate_id)
            .cloned()
    }

    pub fn advance(&self, candidate_id: Uuid, to: CandidateStatus) -> BotResult<Candidate> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let candidate = inner
            .get_mut(&candidate_id)
            .ok_or_else(|| BotError::Other(format!("unknown candidate {candidate_id}")))?;
        if !transition_legal(candidate.status, to) {
            return Err(BotError::InvalidTransition {
                from: candidate.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        candidate.status = to;
        candidate.state_version += 1;
        Ok(candidate.clone())
    }
}

/// Spoof resistance: a trigger only becomes actionable after it persists
/// across enough updates and enough wall time.
#[derive(Debug)]
pub struct TriggerTracker {
    persist_updates: u32,
    persist_min_ms: i64,
    seen: Mutex<HashMap<(String, String), TriggerSeen>>,
}

#[derive(Debug, Clone, Copy)]
struct TriggerSeen {
    first_ms: i64,
    updates: u32,
}

impl TriggerTracker {
    pub fn new(persist_updates: u32, persist_min_s: i64) -> Self {
        Self {
            persist_updates,
            persist_min_ms: persist_min_s * 1000,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record one observation of a trigger; true once it has persisted.
    pub fn observe(&self, market_id: &str, trigger: &str, now_ms: i64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        let entry = seen
            .entry((market_id.to_string(), trigger.to_string()))
            .or_insert(TriggerSeen {
                first_ms: now_ms,
                updates: 0,
            });
        entry.updates += 1;
        entry.updates >= self.persist_updates
            && now_ms - entry.first_ms >= self.persist_min_ms
    }

    /// The trigger stopped firing; restart its persistence clock.
    pub fn reset(&self, market_id: &str, trigger: &str) {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(market_id.to_string(), trigger.to_string()));
    }
}

/// Sliding-window candidate admission caps, per market and global.
#[derive(Debug)]
pub struct CandidateRateCaps {
    per_market_per_min: usize,
    global_per_min: usize,
    inner: Mutex<RateInner>,
}

#[derive(Debug, Default)]
struct RateInner {
    per_market: HashMap<String, VecDeque<i64>>,
    global: VecDeque<i64>,
}

impl CandidateRateCaps {
    pub fn new(per_market_per_min: usize, global_per_min: usize) -> Self {
        Self {
            per_market_per_min,
            global_per_min,
            inner: Mutex::new(RateInner::default()),
        }
    }

    pub fn try_admit(&self, market_id: &str, now_ms: i64) -> bool {
        let cutoff = now_ms - 60_000;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        while inner.global.front().is_some_and(|t| *t < cutoff) {
            inner.global.pop_front();
        }
        let market = inner.per_market.entry(market_id.to_string()).or_default();
        while market.front().is_some_and(|t| *t < cutoff) {
            market.pop_front();
        }

        if market.len() >= self.per_market_per_min {
            return false;
        }
        if inner.global.len() >= self.global_per_min {
            return false;
        }

        if let Some(queue) = inner.per_market.get_mut(market_id) {
            queue.push_back(now_ms);
        }
        inner.global.push_back(now_ms);
        true
    }
}
