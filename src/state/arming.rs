use std::path::Path;
use std::sync::Mutex;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{constant_time_eq, hmac_sha256_hex, ArmingConfig};
use crate::error::{BotError, BotResult};

const TOTP_WINDOW_S: i64 = 30;

/// Time-based one-time code derived from the shared operator secret: the
/// first six hex chars of HMAC-SHA256(secret, window index). The current and
/// the previous window are accepted.
pub fn totp_code(secret: &str, now_ms: i64) -> String {
    let window = now_ms / 1000 / TOTP_WINDOW_S;
    hmac_sha256_hex(secret, &window.to_string())[..6].to_string()
}

fn totp_matches(secret: &str, code: &str, now_ms: i64) -> bool {
    let window = now_ms / 1000 / TOTP_WINDOW_S;
    for w in [window, window - 1] {
        let expected = &hmac_sha256_hex(secret, &w.to_string())[..6];
        if constant_time_eq(expected.as_bytes(), code.as_bytes()) {
            return true;
        }
    }
    false
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArmingFileRecord {
    pub nonce2: String,
    pub ts_utc: i64,
    pub process_start_unix_ms: i64,
    pub sig: String,
}

impl ArmingFileRecord {
    pub fn signed(nonce2: &str, ts_utc: i64, process_start_unix_ms: i64, secret: &str) -> Self {
        let sig = hmac_sha256_hex(
            secret,
            &format!("{nonce2}|{ts_utc}|{process_start_unix_ms}"),
        );
        Self {
            nonce2: nonce2.to_string(),
            ts_utc,
            process_start_unix_ms,
            sig,
        }
    }

    fn verify(&self, secret: &str) -> bool {
        let expected = hmac_sha256_hex(
            secret,
            &format!("{}|{}|{}", self.nonce2, self.ts_utc, self.process_start_unix_ms),
        );
        constant_time_eq(expected.as_bytes(), self.sig.as_bytes())
    }
}

#[derive(Debug, Clone)]
struct MintedNonce {
    value: String,
    minted_ms: i64,
}

#[derive(Debug, Default)]
struct Inner {
    nonce1: Option<MintedNonce>,
    nonce2: Option<MintedNonce>,
    last_totp: Option<(String, i64)>,
}

/// Two-step LIVE arming ceremony. Step 1 consumes nonce1 and a fresh TOTP
/// and yields nonce2; the operator then writes the local arming file; step 2
/// consumes nonce2, a second TOTP, and the validated file. Nonces are
/// per-process and additionally persisted so a restart can invalidate them.
pub struct ArmingCeremony {
    cfg: ArmingConfig,
    secret: String,
    process_start_unix_ms: i64,
    inner: Mutex<Inner>,
}

impl ArmingCeremony {
    pub fn new(cfg: ArmingConfig, secret: impl Into<String>, process_start_unix_ms: i64) -> Self {
        Self {
            cfg,
            secret: secret.into(),
            process_start_unix_ms,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// `/arm_live`: mint nonce1 (single use, 120 s TTL).
    pub fn begin(&self, now_ms: i64, nonce_store: &Path) -> BotResult<String> {
        let nonce = mint_nonce();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.nonce1 = Some(MintedNonce {
            value: nonce.clone(),
            minted_ms: now_ms,
        });
        inner.nonce2 = None;
        persist_nonces(nonce_store, &inner)?;
        tracing::info!(target: "arming", "arming begun; nonce1 minted");
        Ok(nonce)
    }

    /// Step 1: validate + consume nonce1 and the TOTP; mint nonce2. The
    /// caller persists LIVE_ARMED with `armed_until = now + window`.
    pub fn step1(
        &self,
        nonce1: &str,
        totp: &str,
        now_ms: i64,
        nonce_store: &Path,
    ) -> BotResult<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let minted = inner
            .nonce1
            .take()
            .ok_or_else(|| BotError::Arming("no nonce1 outstanding".to_string()))?;
        if now_ms.saturating_sub(minted.minted_ms) > self.cfg.nonce1_ttl_s * 1000 {
            return Err(BotError::Arming("nonce1 expired".to_string()));
        }
        if !constant_time_eq(minted.value.as_bytes(), nonce1.as_bytes()) {
            return Err(BotError::Arming("nonce1 mismatch".to_string()));
        }

        self.check_totp(&mut inner, totp, now_ms)?;

        let nonce2 = mint_nonce();
        inner.nonce2 = Some(MintedNonce {
            value: nonce2.clone(),
            minted_ms: now_ms,
        });
        persist_nonces(nonce_store, &inner)?;
        tracing::info!(target: "arming", "arming step 1 complete; nonce2 minted");
        Ok(nonce2)
    }

    /// Step 2: validate nonce2, the second TOTP, and the arming file. The
    /// caller must already have checked state == LIVE_ARMED and
    /// `now <= armed_until`; on Ok it transitions to LIVE_TRADING and deletes
    /// the file, halting if the delete fails.
    pub fn step2(&self, nonce2: &str, totp: &str, now_ms: i64) -> BotResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        let minted = inner
            .nonce2
            .take()
            .ok_or_else(|| BotError::Arming("no nonce2 outstanding".to_string()))?;
        if !constant_time_eq(minted.value.as_bytes(), nonce2.as_bytes()) {
            return Err(BotError::Arming("nonce2 mismatch".to_string()));
        }

        self.check_totp(&mut inner, totp, now_ms)?;
        self.validate_arming_file(nonce2, now_ms)?;
        tracing::info!(target: "arming", "arming step 2 validated");
        Ok(())
    }

    /// Standalone TOTP validation with the same replay block; used by
    /// `/unhalt` and `/resume_paper`.
    pub fn validate_totp(&self, code: &str, now_ms: i64) -> BotResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        self.check_totp(&mut inner, code, now_ms)
    }

    fn check_totp(&self, inner: &mut Inner, code: &str, now_ms: i64) -> BotResult<()> {
        if code.len() < 6 {
            return Err(BotError::Arming("totp code too short".to_string()));
        }
        if let Some((last_code, last_ms)) = &inner.last_totp {
            if last_code == code
                && now_ms.saturating_sub(*last_ms) < self.cfg.totp_replay_block_s * 1000
            {
                return Err(BotError::Arming("totp replay blocked".to_string()));
            }
        }
        if !totp_matches(&self.secret, code, now_ms) {
            return Err(BotError::Arming("totp invalid".to_string()));
        }
        inner.last_totp = Some((code.to_string(), now_ms));
        Ok(())
    }

    fn validate_arming_file(&self, nonce2: &str, now_ms: i64) -> BotResult<()> {
        let path = &self.cfg.file_path;
        if !path.is_file() {
            return Err(BotError::Arming("arming file missing".to_string()));
        }

        check_file_ownership(path)?;

        let raw = std::fs::read_to_string(path)
            .map_err(|e| BotError::Arming(format!("arming file unreadable: {e}")))?;
        let record: ArmingFileRecord = serde_json::from_str(raw.trim())
            .map_err(|e| BotError::Arming(format!("arming file unparseable: {e}")))?;

        if !constant_time_eq(record.nonce2.as_bytes(), nonce2.as_bytes()) {
            return Err(BotError::Arming("arming file nonce2 mismatch".to_string()));
        }
        if !record.verify(&self.secret) {
            return Err(BotError::Arming("arming file signature mismatch".to_string()));
        }

        let now_s = now_ms / 1000;
        let age_s = now_s - record.ts_utc;
        if age_s > self.cfg.file_max_age_s {
            return Err(BotError::Arming(format!("arming file too old: {age_s}s")));
        }
        if age_s.abs() > self.cfg.window_s {
            return Err(BotError::Arming(format!(
                "arming file outside window: {age_s}s"
            )));
        }

        let drift_ms = (record.process_start_unix_ms - self.process_start_unix_ms).abs();
        if drift_ms > 5_000 {
            return Err(BotError::Arming(
                "arming file bound to a different process".to_string(),
            ));
        }

        Ok(())
    }

    /// Startup step: remove a stale arming file. Failure is fatal upstream.
    pub fn remove_arming_file(&self) -> BotResult<()> {
        match std::fs::remove_file(&self.cfg.file_path) {
            Ok(()) => {
                tracing::warn!(target: "arming", "stale arming file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BotError::Arming(format!("arming file removal failed: {e}"))),
        }
    }

    /// Delete the arming file after a successful step 2; the caller HALTs on
    /// failure so an armed file can never outlive the ceremony.
    pub fn consume_arming_file(&self) -> BotResult<()> {
        std::fs::remove_file(&self.cfg.file_path)
            .map_err(|e| BotError::Arming(format!("arming file delete failed: {e}")))
    }

    /// Startup step: drop any persisted nonces from a previous process.
    pub fn invalidate_persisted_nonces(nonce_store: &Path) -> BotResult<()> {
        if let Some(parent) = nonce_store.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(nonce_store, b"{}\n")
            .map_err(|e| BotError::Arming(format!("nonce invalidation failed: {e}")))?;
        Ok(())
    }
}

fn mint_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn persist_nonces(nonce_store: &Path, inner: &Inner) -> BotResult<()> {
    if let Some(parent) = nonce_store.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let value = serde_json::json!({
        "nonce1": inner.nonce1.as_ref().map(|n| n.value.clone()),
        "nonce2": inner.nonce2.as_ref().map(|n| n.value.clone()),
    });
    std::fs::write(nonce_store, value.to_string())
        .map_err(|e| BotError::Arming(format!("nonce persist failed: {e}")))?;
    Ok(())
}

/// The arming file must be mode 0640 (no world access, no group write) and
/// owned by root or the bot user.
#[cfg(unix)]
fn check_file_ownership(path: &Path) -> BotResult<()> {
    use std::os::unix::fs::MetadataExt;

    let meta = std::fs::metadata(path)
        .map_err(|e| BotError::Arming(format!("arming file stat failed: {e}")))?;
    let mode = meta.mode() & 0o777;
    if mode & 0o027 != 0 {
        return Err(BotError::Arming(format!(
            "arming file permissions too open: {mode:o}"
        )));
    }
    if meta.uid() != 0 && meta.uid() != geteuid() {
        return Err(BotError::Arming("arming file owner invalid".to_string()));
    }
    Ok(())
}

#[cfg(unix)]
fn geteuid() -> u32 {
    extern "C" {
        fn geteuid() -> u32;
    }
    unsafe { geteuid() }
}

#[cfg(not(unix))]
fn check_file_ownership(_path: &Path) -> BotResult<()> {
    Ok(())
}
