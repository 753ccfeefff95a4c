use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BotError, BotResult};
use crate::persistence::event_log::EventStore;
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalRecordType {
    StateChanged,
    /// LIVE submits only. PAPER entries never touch the WAL.
    OrderIntent,
    OrderIntentAborted,
    OrderResult,
    /// LIVE cancels only.
    CancelIntent,
    CancelResult,
}

impl WalRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalRecordType::StateChanged => "STATE_CHANGED",
            WalRecordType::OrderIntent => "ORDER_INTENT",
            WalRecordType::OrderIntentAborted => "ORDER_INTENT_ABORTED",
            WalRecordType::OrderResult => "ORDER_RESULT",
            WalRecordType::CancelIntent => "CANCEL_INTENT",
            WalRecordType::CancelResult => "CANCEL_RESULT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalRecord {
    pub record_id: Uuid,
    pub record_type: WalRecordType,
    pub ts_ms: i64,
    pub payload: Value,
}

/// Append-only WAL writer, one canonical JSON line per record, fsync before
/// the write call returns. Any I/O failure is `BotError::Wal`; callers treat
/// it as fatal.
#[derive(Debug)]
pub struct WalWriter {
    file: File,
}

impl WalWriter {
    pub fn open(path: impl AsRef<Path>) -> BotResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BotError::Wal(format!("create wal dir: {e}")))?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o640);
        }
        let file = opts
            .open(path)
            .map_err(|e| BotError::Wal(format!("open wal: {e}")))?;
        Ok(Self { file })
    }

    pub fn append(&mut self, record_type: WalRecordType, payload: Value) -> BotResult<WalRecord> {
        self.append_at(record_type, payload, now_ms())
    }

    pub fn append_at(
        &mut self,
        record_type: WalRecordType,
        payload: Value,
        ts_ms: i64,
    ) -> BotResult<WalRecord> {
        let record = WalRecord {
            record_id: Uuid::new_v4(),
            record_type,
            ts_ms,
            payload,
        };
        // serde_json maps are ordered, so the line is canonical as serialized.
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| BotError::Wal(format!("serialize record: {e}")))?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .map_err(|e| BotError::Wal(format!("wal write failed: {e}")))?;
        self.file
            .sync_data()
            .map_err(|e| BotError::Wal(format!("wal fsync failed: {e}")))?;

        tracing::debug!(
            target: "wal",
            record_type = record.record_type.as_str(),
            record_id = %record.record_id,
            "wal record written"
        );
        Ok(record)
    }
}

/// Reads WAL records in offset order. A parse failure means a torn or
/// corrupted log and is fatal.
pub struct WalReader {
    path: PathBuf,
}

impl WalReader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn read_all(&self) -> BotResult<Vec<WalRecord>> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| BotError::Wal(format!("open wal: {e}")))?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| BotError::Wal(format!("read wal: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: WalRecord = serde_json::from_str(&line).map_err(|e| {
                BotError::Wal(format!("wal corrupted at line {}: {e}", line_no + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// An ORDER_INTENT with no ORDER_RESULT or ORDER_INTENT_ABORTED: the process
/// died between the durable intent and the durable outcome, so the order may
/// or may not exist at the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanIntent {
    pub decision_id_hex: String,
    pub market_id: String,
    pub side: String,
    pub client_order_id: String,
    pub price: f64,
    pub size_usd_cents: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub inserted: usize,
    pub deduped: usize,
    pub orphans: usize,
}

/// Replay the WAL into the event store in offset order. Idempotent: records
/// already present (by payload hash) are skipped, so replaying into a
/// non-empty store converges on the same final state as a single in-order
/// apply. Returns orphaned intents for adoption as PENDING_UNKNOWN.
pub fn replay_into_event_store(
    wal_path: &Path,
    store: &mut EventStore,
) -> BotResult<(ReplayStats, Vec<OrphanIntent>)> {
    let records = WalReader::new(wal_path).read_all()?;
    let mut stats = ReplayStats::default();
    if records.is_empty() {
        tracing::info!(target: "wal", "wal replay: no records");
        return Ok((stats, Vec::new()));
    }

    let mut intents: HashMap<String, WalRecord> = HashMap::new();
    let mut resolved: HashSet<String> = HashSet::new();

    for record in &records {
        let decision_id = record
            .payload
            .get("decision_id_hex")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match record.record_type {
            WalRecordType::OrderIntent => {
                intents.insert(decision_id, record.clone());
            }
            WalRecordType::OrderResult | WalRecordType::OrderIntentAborted => {
                if !decision_id.is_empty() {
                    resolved.insert(decision_id);
                }
            }
            _ => {}
        }
    }

    for record in &records {
        let applied = store
            .append_with_id(
                record.record_type.as_str(),
                record.record_id.to_string(),
                record.payload.clone(),
                record.ts_ms,
            )
            .map_err(|e| BotError::Wal(format!("replay insert failed: {e}")))?;
        if applied {
            stats.inserted += 1;
        } else {
            stats.deduped += 1;
        }
    }

    let mut orphans = Vec::new();
    for (decision_id, record) in intents {
        if resolved.contains(&decision_id) {
            continue;
        }
        tracing::warn!(
            target: "wal",
            decision_id = %decision_id,
            "orphaned ORDER_INTENT; adopting as PENDING_UNKNOWN"
        );
        let payload = &record.payload;
        orphans.push(OrphanIntent {
            decision_id_hex: decision_id.clone(),
            market_id: payload
                .get("market_id")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN")
                .to_string(),
            side: payload
                .get("side")
                .and_then(Value::as_str)
                .unwrap_or("YES")
                .to_string(),
            client_order_id: payload
                .get("client_order_id")
                .and_then(Value::as_str)
                .unwrap_or(decision_id.as_str())
                .to_string(),
            price: payload.get("price").and_then(Value::as_f64).unwrap_or(0.0),
            size_usd_cents: payload
                .get("size_usd_cents")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        });
    }
    stats.orphans = orphans.len();

    tracing::info!(
        target: "wal",
        inserted = stats.inserted,
        deduped = stats.deduped,
        orphans = stats.orphans,
        "wal replay complete"
    );
    Ok((stats, orphans))
}
