use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{constant_time_eq, hmac_sha256_hex};
use crate::error::{BotError, BotResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingState {
    ObserveOnly,
    PaperTrading,
    LiveArmed,
    LiveTrading,
    Halted,
    HaltedDaily,
}

impl TradingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingState::ObserveOnly => "OBSERVE_ONLY",
            TradingState::PaperTrading => "PAPER_TRADING",
            TradingState::LiveArmed => "LIVE_ARMED",
            TradingState::LiveTrading => "LIVE_TRADING",
            TradingState::Halted => "HALTED",
            TradingState::HaltedDaily => "HALTED_DAILY",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, TradingState::LiveArmed | TradingState::LiveTrading)
    }

    pub fn can_submit(&self) -> bool {
        matches!(self, TradingState::PaperTrading | TradingState::LiveTrading)
    }
}

impl fmt::Display for TradingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable singleton trading state. The signature covers every prior
/// field; a row that fails verification forces HALTED.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotState {
    pub state: TradingState,
    pub counter: u64,
    pub ts_ms: i64,
    pub armed_until_ms: Option<i64>,
    pub halt_until_ms: Option<i64>,
    pub halt_resume_state: Option<TradingState>,
    pub sig_hex: String,
}

impl BotState {
    pub fn initial(now_ms: i64, secret: &str) -> Self {
        let mut bs = Self {
            state: TradingState::ObserveOnly,
            counter: 1,
            ts_ms: now_ms,
            armed_until_ms: None,
            halt_until_ms: None,
            halt_resume_state: None,
            sig_hex: String::new(),
        };
        bs.sign(secret);
        bs
    }

    fn canonical(&self) -> String {
        format!(
            "state={}|counter={}|ts_ms={}|armed_until={}|halt_until={}|resume={}",
            self.state.as_str(),
            self.counter,
            self.ts_ms,
            self.armed_until_ms.unwrap_or(-1),
            self.halt_until_ms.unwrap_or(-1),
            self.halt_resume_state
                .map(|s| s.as_str())
                .unwrap_or("NONE"),
        )
    }

    pub fn sign(&mut self, secret: &str) {
        self.sig_hex = hmac_sha256_hex(secret, &self.canonical());
    }

    pub fn verify(&self, secret: &str) -> bool {
        let expected = hmac_sha256_hex(secret, &self.canonical());
        constant_time_eq(expected.as_bytes(), self.sig_hex.as_bytes())
    }
}

/// File-backed store for the singleton row. Saves go through a temp file and
/// an atomic rename so a crash mid-write cannot leave a torn state row.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> BotResult<Option<BotState>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let bs: BotState = serde_json::from_str(&raw)
            .map_err(|e| BotError::Other(format!("bot_state unparseable: {e}")))?;
        Ok(Some(bs))
    }

    pub fn save(&self, bs: &BotState) -> BotResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_vec(bs).map_err(|e| BotError::Other(e.to_string()))?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(prefix: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        dir.push(format!("{prefix}_{}_{}", std::process::id(), nanos));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir.join("bot_state.json")
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let mut bs = BotState::initial(1_000, "secret");
        assert!(bs.verify("secret"));
        assert!(!bs.verify("other"));

        bs.state = TradingState::PaperTrading;
        // signature now stale for the mutated fields
        assert!(!bs.verify("secret"));
        bs.sign("secret");
        assert!(bs.verify("secret"));
    }

    #[test]
    fn signature_covers_optional_fields() {
        let mut bs = BotState::initial(1_000, "secret");
        bs.armed_until_ms = Some(2_000);
        assert!(!bs.verify("secret"));
    }

    #[test]
    fn store_roundtrips() {
        let path = temp_path("bot_state_store");
        let store = StateStore::new(&path);
        assert!(store.load().expect("load empty").is_none());

        let bs = BotState::initial(42, "secret");
        store.save(&bs).expect("save");
        let loaded = store.load().expect("load").expect("present");
        assert_eq!(loaded, bs);
        assert!(loaded.verify("secret"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
