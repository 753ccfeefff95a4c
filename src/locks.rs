use std::collections::HashMap;
use std::sync::Mutex;

use crate::reasons::ReasonCode;

pub const LOCK_TTL_MS: i64 = 60_000;
pub const LOCK_RENEW_EVERY_MS: i64 = 10_000;
pub const LOCK_STEAL_GRACE_MS: i64 = 5_000;
pub const MIN_LOCK_TTL_BEFORE_SUBMIT_MS: i64 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct MarketLock {
    pub market_id: String,
    pub owner_instance: String,
    pub owner_worker: String,
    pub lock_version: u64,
    pub owner_heartbeat_ms: i64,
    pub expires_at_ms: i64,
    pub last_renewed_ms: i64,
}

impl MarketLock {
    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at_ms
    }

    fn is_stealable(&self, now_ms: i64) -> bool {
        (self.is_expired(now_ms) && now_ms - self.expires_at_ms >= LOCK_STEAL_GRACE_MS)
            || self.owner_heartbeat_ms < now_ms - 2 * LOCK_TTL_MS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub lock_version: u64,
    pub expires_at_ms: i64,
}

/// Leased per-market locks bounding concurrent execution attempts. Acquire
/// and every renewal bump the monotonic `lock_version`; the version recorded
/// at decision time is re-checked immediately before the network submit.
#[derive(Debug)]
pub struct LockManager {
    instance_id: String,
    locks: Mutex<HashMap<String, MarketLock>>,
}

impl LockManager {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, market_id: &str, worker_id: &str, now_ms: i64) -> Option<LockGrant> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = locks.get_mut(market_id) {
            if existing.owner_instance == self.instance_id
                && existing.owner_worker == worker_id
                && !existing.is_expired(now_ms)
            {
                return Some(LockGrant {
                    lock_version: existing.lock_version,
                    expires_at_ms: existing.expires_at_ms,
                });
            }
            if !existing.is_stealable(now_ms) {
                return None;
            }
            let version = existing.lock_version + 1;
            tracing::warn!(
                target: "locks",
                market_id,
                from = %existing.owner_worker,
                to = worker_id,
                version,
                "expired lock stolen"
            );
            *existing = MarketLock {
                market_id: market_id.to_string(),
                owner_instance: self.instance_id.clone(),
                owner_worker: worker_id.to_string(),
                lock_version: version,
                owner_heartbeat_ms: now_ms,
                expires_at_ms: now_ms + LOCK_TTL_MS,
                last_renewed_ms: now_ms,
            };
            return Some(LockGrant {
                lock_version: version,
                expires_at_ms: now_ms + LOCK_TTL_MS,
            });
        }

        let lock = MarketLock {
            market_id: market_id.to_string(),
            owner_instance: self.instance_id.clone(),
            owner_worker: worker_id.to_string(),
            lock_version: 1,
            owner_heartbeat_ms: now_ms,
            expires_at_ms: now_ms + LOCK_TTL_MS,
            last_renewed_ms: now_ms,
        };
        let grant = LockGrant {
            lock_version: lock.lock_version,
            expires_at_ms: lock.expires_at_ms,
        };
        locks.insert(market_id.to_string(), lock);
        tracing::debug!(target: "locks", market_id, worker_id, version = 1u64, "lock acquired");
        Some(grant)
    }

    /// Heartbeat renewal; bumps the version so any stale decision-time grant
    /// fails its submit-time check.
    pub fn renew(&self, market_id: &str, worker_id: &str, now_ms: i64) -> Option<LockGrant> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let lock = locks.get_mut(market_id)?;
        if lock.owner_instance != self.instance_id || lock.owner_worker != worker_id {
            return None;
        }
        lock.owner_heartbeat_ms = now_ms;
        lock.expires_at_ms = now_ms + LOCK_TTL_MS;
        lock.last_renewed_ms = now_ms;
        lock.lock_version += 1;
        Some(LockGrant {
            lock_version: lock.lock_version,
            expires_at_ms: lock.expires_at_ms,
        })
    }

    pub fn release(&self, market_id: &str, worker_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let owned = matches!(
            locks.get(market_id),
            Some(lock) if lock.owner_instance == self.instance_id && lock.owner_worker == worker_id
        );
        if owned {
            locks.remove(market_id);
        }
        owned
    }

    /// Submit-time validation: owner matches, at least 10 s of lease left,
    /// and the version still equals the decision-time version.
    pub fn validate_for_submit(
        &self,
        market_id: &str,
        worker_id: &str,
        expected_version: u64,
        now_ms: i64,
    ) -> Result<(), ReasonCode> {
        let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let Some(lock) = locks.get(market_id) else {
            return Err(ReasonCode::LockLost);
        };
        if lock.owner_instance != self.instance_id || lock.owner_worker != worker_id {
            return Err(ReasonCode::LockLost);
        }
        if lock.expires_at_ms - now_ms < MIN_LOCK_TTL_BEFORE_SUBMIT_MS {
            return Err(ReasonCode::LockLost);
        }
        if lock.lock_version != expected_version {
            return Err(ReasonCode::LockLost);
        }
        Ok(())
    }

    pub fn get(&self, market_id: &str) -> Option<MarketLock> {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(market_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_reacquire_by_owner() {
        let mgr = LockManager::new("inst-1");
        let grant = mgr.acquire("mkt-1", "w1", 0).expect("acquire");
        assert_eq!(grant.lock_version, 1);

        // same worker re-acquires without a version bump
        let again = mgr.acquire("mkt-1", "w1", 1_000).expect("re-acquire");
        assert_eq!(again.lock_version, 1);

        // different worker is refused while the lease is live
        assert!(mgr.acquire("mkt-1", "w2", 1_000).is_none());
    }

    #[test]
    fn steal_needs_expiry_plus_grace() {
        let mgr = LockManager::new("inst-1");
        mgr.acquire("mkt-1", "w1", 0).expect("acquire");

        // expired but inside the 5s grace
        assert!(mgr.acquire("mkt-1", "w2", LOCK_TTL_MS + 4_999).is_none());
        // expired + grace elapsed
        let stolen = mgr
            .acquire("mkt-1", "w2", LOCK_TTL_MS + 5_000)
            .expect("steal");
        assert_eq!(stolen.lock_version, 2);
    }

    #[test]
    fn stale_heartbeat_allows_steal() {
        let mgr = LockManager::new("inst-1");
        mgr.acquire("mkt-1", "w1", 0).expect("acquire");
        // heartbeat older than 2 x TTL
        let stolen = mgr.acquire("mkt-1", "w2", 2 * LOCK_TTL_MS + 1).expect("steal");
        assert_eq!(stolen.lock_version, 2);
    }

    #[test]
    fn renew_bumps_version_and_extends() {
        let mgr = LockManager::new("inst-1");
        let grant = mgr.acquire("mkt-1", "w1", 0).expect("acquire");
        let renewed = mgr.renew("mkt-1", "w1", 10_000).expect("renew");
        assert_eq!(renewed.lock_version, grant.lock_version + 1);
        assert_eq!(renewed.expires_at_ms, 10_000 + LOCK_TTL_MS);

        assert!(mgr.renew("mkt-1", "w2", 10_000).is_none());
    }

    #[test]
    fn submit_validation_checks_version_and_ttl() {
        let mgr = LockManager::new("inst-1");
        let grant = mgr.acquire("mkt-1", "w1", 0).expect("acquire");

        assert!(mgr
            .validate_for_submit("mkt-1", "w1", grant.lock_version, 1_000)
            .is_ok());

        // under 10s of lease remaining
        let late = LOCK_TTL_MS - MIN_LOCK_TTL_BEFORE_SUBMIT_MS + 1;
        assert_eq!(
            mgr.validate_for_submit("mkt-1", "w1", grant.lock_version, late),
            Err(ReasonCode::LockLost)
        );

        // version moved on (renewal happened after the decision)
        mgr.renew("mkt-1", "w1", 2_000);
        assert_eq!(
            mgr.validate_for_submit("mkt-1", "w1", grant.lock_version, 3_000),
            Err(ReasonCode::LockLost)
        );
    }

    #[test]
    fn release_only_by_owner() {
        let mgr = LockManager::new("inst-1");
        mgr.acquire("mkt-1", "w1", 0).expect("acquire");
        assert!(!mgr.release("mkt-1", "w2"));
        assert!(mgr.release("mkt-1", "w1"));
        assert!(mgr.get("mkt-1").is_none());
    }
}
