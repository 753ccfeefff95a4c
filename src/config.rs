use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{BotError, BotResult};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub budget: BudgetConfig,
    pub venue: VenueConfig,
    pub arming: ArmingConfig,
    pub infra: InfraConfig,
    pub paths: PathsConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Candidate freshness ceiling at execution time.
    pub candidate_max_age_s: i64,
    pub decision_to_exec_max_s: f64,
    pub paper_fee_multiplier: f64,
    pub paper_min_fee_bps: f64,
    pub trigger_persist_updates: u32,
    pub trigger_persist_min_s: i64,
    pub candidates_per_min_max: u32,
    pub per_market_candidates_per_min_max: u32,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            candidate_max_age_s: 120,
            decision_to_exec_max_s: 8.0,
            paper_fee_multiplier: 2.0,
            paper_min_fee_bps: 10.0,
            trigger_persist_updates: 3,
            trigger_persist_min_s: 6,
            candidates_per_min_max: 50,
            per_market_candidates_per_min_max: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RiskConfig {
    pub daily_stop_loss_pct: f64,
    pub max_per_market_pct: f64,
    pub max_total_exposure_pct: f64,
    pub max_open_positions: usize,
    pub wallet_ref_stale_s: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_stop_loss_pct: 0.03,
            max_per_market_pct: 0.02,
            max_total_exposure_pct: 0.10,
            max_open_positions: 5,
            wallet_ref_stale_s: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub daily_cap_usd_user: f64,
    pub daily_cap_pct_of_wallet: f64,
    pub window_s: i64,
    pub window_cap_pct_of_daily: f64,
    pub analyses_per_day_hard_cap: u32,
    pub reservation_expiry_s: i64,
    pub reaper_interval_s: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_cap_usd_user: 2.00,
            daily_cap_pct_of_wallet: 0.005,
            window_s: 600,
            window_cap_pct_of_daily: 0.20,
            analyses_per_day_hard_cap: 100,
            reservation_expiry_s: 120,
            reaper_interval_s: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VenueConfig {
    pub rest_base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://clob.polymarket.com".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArmingConfig {
    pub file_path: PathBuf,
    pub window_s: i64,
    pub nonce1_ttl_s: i64,
    pub file_max_age_s: i64,
    pub totp_replay_block_s: i64,
}

impl Default for ArmingConfig {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from("/var/run/polyedge/armed"),
            window_s: 300,
            nonce1_ttl_s: 120,
            file_max_age_s: 900,
            totp_replay_block_s: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InfraConfig {
    pub log_level: String,
    pub fast_loop_s: u64,
    pub reconcile_heartbeat_s: u64,
    pub clock_skew_max_s: i64,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            fast_loop_s: 2,
            reconcile_heartbeat_s: 60,
            clock_skew_max_s: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub wal: PathBuf,
    pub event_log: PathBuf,
    pub bot_state: PathBuf,
    pub nonce_store: PathBuf,
    pub manifest: PathBuf,
    pub config_dir: PathBuf,
    pub secrets_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            wal: PathBuf::from("data/polyedge.wal"),
            event_log: PathBuf::from("data/events.jsonl"),
            bot_state: PathBuf::from("data/bot_state.json"),
            nonce_store: PathBuf::from("data/arming_nonces.json"),
            manifest: PathBuf::from("config/manifest.json"),
            config_dir: PathBuf::from("config"),
            secrets_dir: PathBuf::from("secrets"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    pub allowed_user_ids: Vec<i64>,
    pub allowed_chat_ids: Vec<i64>,
}

pub fn load_config() -> BotResult<AppConfig> {
    load_config_from("polyedge.toml")
}

pub fn load_config_from(path: &str) -> BotResult<AppConfig> {
    let figment = Figment::from(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("POLYEDGE_").split("__"));
    let cfg: AppConfig = figment
        .extract()
        .map_err(|e| BotError::Config(e.to_string()))?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &AppConfig) -> BotResult<()> {
    if cfg.risk.max_per_market_pct <= 0.0 || cfg.risk.max_per_market_pct > 1.0 {
        return Err(BotError::Config(
            "risk.max_per_market_pct out of (0, 1]".to_string(),
        ));
    }
    if cfg.budget.window_s <= 0 || cfg.budget.reservation_expiry_s <= 0 {
        return Err(BotError::Config(
            "budget window / expiry must be positive".to_string(),
        ));
    }
    if cfg.trading.decision_to_exec_max_s <= 0.0 {
        return Err(BotError::Config(
            "trading.decision_to_exec_max_s must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Signed config manifest: SHA-256 hashes of every config artifact plus the
/// operational values the venue and the execution engine must not be able to
/// drift on without an operator re-sign.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SignedManifest {
    pub artifacts: BTreeMap<String, String>,
    pub pinned: PinnedValues,
    pub sig_hex: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PinnedValues {
    pub client_order_id_max_len: usize,
    pub venue_tick_size: f64,
    pub taker_vol_sigma_max: f64,
    pub model_pricing_usd_per_mtoken: BTreeMap<String, f64>,
}

impl SignedManifest {
    fn canonical_payload(&self) -> String {
        let mut lines: Vec<String> = self
            .artifacts
            .iter()
            .map(|(name, hash)| format!("{name}={hash}"))
            .collect();
        lines.push(format!(
            "client_order_id_max_len={}",
            self.pinned.client_order_id_max_len
        ));
        lines.push(format!("venue_tick_size={:.6}", self.pinned.venue_tick_size));
        lines.push(format!(
            "taker_vol_sigma_max={:.6}",
            self.pinned.taker_vol_sigma_max
        ));
        for (model, price) in &self.pinned.model_pricing_usd_per_mtoken {
            lines.push(format!("model:{model}={price:.6}"));
        }
        lines.join("\n")
    }

    pub fn sign(&mut self, operator_key: &str) {
        self.sig_hex = hmac_sha256_hex(operator_key, &self.canonical_payload());
    }

    pub fn verify_signature(&self, operator_key: &str) -> bool {
        let expected = hmac_sha256_hex(operator_key, &self.canonical_payload());
        constant_time_eq(expected.as_bytes(), self.sig_hex.as_bytes())
    }
}

pub fn file_sha256_hex(path: &Path) -> BotResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Load the manifest, verify its signature and every artifact hash.
/// Any failure is CONFIG_TAMPER and the caller must halt.
pub fn verify_manifest(
    manifest_path: &Path,
    config_dir: &Path,
    operator_key: &str,
) -> BotResult<SignedManifest> {
    let raw = std::fs::read_to_string(manifest_path)
        .map_err(|e| BotError::ConfigTamper(format!("manifest unreadable: {e}")))?;
    let manifest: SignedManifest = serde_json::from_str(&raw)
        .map_err(|e| BotError::ConfigTamper(format!("manifest unparseable: {e}")))?;

    if !manifest.verify_signature(operator_key) {
        return Err(BotError::ConfigTamper("manifest signature mismatch".to_string()));
    }

    for (name, expected) in &manifest.artifacts {
        let path = config_dir.join(name);
        let actual = file_sha256_hex(&path)
            .map_err(|_| BotError::ConfigTamper(format!("artifact missing: {name}")))?;
        if !constant_time_eq(actual.as_bytes(), expected.as_bytes()) {
            return Err(BotError::ConfigTamper(format!("artifact hash mismatch: {name}")));
        }
    }

    Ok(manifest)
}

/// Secret files must not be readable or writable by others.
#[cfg(unix)]
pub fn verify_secret_permissions(dir: &Path) -> BotResult<()> {
    use std::os::unix::fs::MetadataExt;

    let entries = std::fs::read_dir(dir)
        .map_err(|e| BotError::InsecureSecrets(format!("secrets dir unreadable: {e}")))?;
    for entry in entries.flatten() {
        let meta = entry
            .metadata()
            .map_err(|e| BotError::InsecureSecrets(e.to_string()))?;
        if !meta.is_file() {
            continue;
        }
        let mode = meta.mode();
        if mode & 0o004 != 0 {
            return Err(BotError::InsecureSecrets(format!(
                "{} is world-readable (mode {:o})",
                entry.path().display(),
                mode & 0o777
            )));
        }
        if mode & 0o002 != 0 {
            return Err(BotError::InsecureSecrets(format!(
                "{} is world-writable (mode {:o})",
                entry.path().display(),
                mode & 0o777
            )));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn verify_secret_permissions(_dir: &Path) -> BotResult<()> {
    Ok(())
}

pub fn hmac_sha256_hex(key: &str, payload: &str) -> String {
    // Hmac accepts keys of any length; the error arm fails closed into an
    // empty digest that can never verify.
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key.as_bytes()) else {
        return String::new();
    };
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        dir.push(format!("{prefix}_{}_{}", std::process::id(), nanos));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn make_manifest(dir: &Path, key: &str) -> SignedManifest {
        let artifact = dir.join("evidence_sources.json");
        fs::write(&artifact, b"{\"sources\":[]}").expect("write artifact");
        let mut artifacts = BTreeMap::new();
        artifacts.insert(
            "evidence_sources.json".to_string(),
            file_sha256_hex(&artifact).expect("hash artifact"),
        );
        let mut manifest = SignedManifest {
            artifacts,
            pinned: PinnedValues {
                client_order_id_max_len: 32,
                venue_tick_size: 0.01,
                taker_vol_sigma_max: 0.01,
                model_pricing_usd_per_mtoken: BTreeMap::new(),
            },
            sig_hex: String::new(),
        };
        manifest.sign(key);
        manifest
    }

    #[test]
    fn manifest_roundtrip_verifies() {
        let dir = temp_dir("manifest_ok");
        let manifest = make_manifest(&dir, "operator-key");
        let path = dir.join("manifest.json");
        fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();

        let loaded = verify_manifest(&path, &dir, "operator-key").expect("verify");
        assert_eq!(loaded.pinned.client_order_id_max_len, 32);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn tampered_artifact_is_rejected() {
        let dir = temp_dir("manifest_tamper");
        let manifest = make_manifest(&dir, "operator-key");
        let path = dir.join("manifest.json");
        fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();

        fs::write(dir.join("evidence_sources.json"), b"{\"sources\":[\"x\"]}").unwrap();
        let err = verify_manifest(&path, &dir, "operator-key").unwrap_err();
        assert!(matches!(err, BotError::ConfigTamper(_)));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let dir = temp_dir("manifest_key");
        let manifest = make_manifest(&dir, "operator-key");
        let path = dir.join("manifest.json");
        fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();

        let err = verify_manifest(&path, &dir, "other-key").unwrap_err();
        assert!(matches!(err, BotError::ConfigTamper(_)));

        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn world_readable_secret_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir("secrets_perm");
        let secret = dir.join("LOCAL_STATE_SECRET");
        fs::write(&secret, b"hunter2").unwrap();

        fs::set_permissions(&secret, fs::Permissions::from_mode(0o640)).unwrap();
        assert!(verify_secret_permissions(&dir).is_ok());

        fs::set_permissions(&secret, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(verify_secret_permissions(&dir).is_err());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(validate(&AppConfig::default()).is_ok());
    }
}
