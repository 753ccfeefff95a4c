use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{BotError, BotResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub seq: u64,
    pub event_id: String,
    pub ts_ms: i64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub payload_hash: String,
}

/// Append-only event store backed by a JSONL file. The payload hash is
/// unique: appending a record whose hash is already present is a no-op, which
/// makes WAL replay idempotent. A write failure surfaces as
/// `BotError::EventStore`; the caller sets DB_DEGRADED.
#[derive(Debug)]
pub struct EventStore {
    file: File,
    seq: u64,
    hashes: HashSet<String>,
    records: Vec<EventRecord>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> BotResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BotError::EventStore(format!("create event dir: {e}")))?;
        }

        let mut seq = 0u64;
        let mut hashes = HashSet::new();
        let mut records = Vec::new();
        if path.is_file() {
            let reader = BufReader::new(
                File::open(&path).map_err(|e| BotError::EventStore(format!("open: {e}")))?,
            );
            for (line_no, line) in reader.lines().enumerate() {
                let line = line.map_err(|e| BotError::EventStore(format!("read: {e}")))?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: EventRecord = serde_json::from_str(&line).map_err(|e| {
                    BotError::EventStore(format!("corrupt at line {}: {e}", line_no + 1))
                })?;
                seq = seq.max(record.seq);
                hashes.insert(record.payload_hash.clone());
                records.push(record);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BotError::EventStore(format!("open append: {e}")))?;

        Ok(Self {
            file,
            seq,
            hashes,
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Append with a fresh event id. Returns the applied record.
    pub fn append(&mut self, event: &str, payload: Value, ts_ms: i64) -> BotResult<EventRecord> {
        let event_id = Uuid::new_v4().to_string();
        if !self.append_with_id(event, event_id, payload, ts_ms)? {
            return Err(BotError::EventStore("fresh event id collided".to_string()));
        }
        self.records
            .last()
            .cloned()
            .ok_or_else(|| BotError::EventStore("store empty after append".to_string()))
    }

    /// Append a record with a caller-supplied event id (WAL replay path).
    /// Returns false when the payload hash already exists.
    pub fn append_with_id(
        &mut self,
        event: &str,
        event_id: String,
        payload: Value,
        ts_ms: i64,
    ) -> BotResult<bool> {
        let payload_hash = payload_hash(&event_id, event, &payload);
        if self.hashes.contains(&payload_hash) {
            return Ok(false);
        }

        self.seq += 1;
        let record = EventRecord {
            seq: self.seq,
            event_id,
            ts_ms,
            event: event.to_string(),
            correlation_id: payload
                .get("correlation_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            payload,
            payload_hash: payload_hash.clone(),
        };

        let mut line = serde_json::to_vec(&record)
            .map_err(|e| BotError::EventStore(format!("serialize: {e}")))?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .map_err(|e| BotError::EventStore(format!("write: {e}")))?;
        self.file
            .flush()
            .map_err(|e| BotError::EventStore(format!("flush: {e}")))?;

        self.hashes.insert(payload_hash);
        self.records.push(record);
        Ok(true)
    }
}

fn payload_hash(event_id: &str, event: &str, payload: &Value) -> String {
    // serde_json maps serialize with sorted keys, so this string is canonical.
    let canonical = serde_json::json!({
        "event": event,
        "event_id": event_id,
        "payload": payload,
    })
    .to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(prefix: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        dir.push(format!("{prefix}_{}_{}", std::process::id(), nanos));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn append_persists_and_reloads() {
        let dir = temp_dir("event_store_reload");
        let path = dir.join("events.jsonl");

        {
            let mut store = EventStore::open(&path).expect("open");
            store
                .append("STATE_CHANGED", json!({"to": "PAPER_TRADING"}), 100)
                .expect("append");
            store
                .append("ORDER_RESULT", json!({"decision_id_hex": "ab"}), 101)
                .expect("append");
        }

        let store = EventStore::open(&path).expect("reopen");
        assert_eq!(store.len(), 2);
        assert_eq!(store.records()[0].seq, 1);
        assert_eq!(store.records()[1].event, "ORDER_RESULT");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn duplicate_payload_hash_is_deduped() {
        let dir = temp_dir("event_store_dedup");
        let mut store = EventStore::open(dir.join("events.jsonl")).expect("open");

        let applied = store
            .append_with_id("ORDER_INTENT", "id-1".to_string(), json!({"a": 1}), 5)
            .expect("append");
        let again = store
            .append_with_id("ORDER_INTENT", "id-1".to_string(), json!({"a": 1}), 5)
            .expect("append");

        assert!(applied);
        assert!(!again);
        assert_eq!(store.len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn same_payload_different_event_id_is_kept() {
        let dir = temp_dir("event_store_ids");
        let mut store = EventStore::open(dir.join("events.jsonl")).expect("open");

        store
            .append_with_id("ORDER_INTENT", "id-1".to_string(), json!({"a": 1}), 5)
            .expect("append");
        let applied = store
            .append_with_id("ORDER_INTENT", "id-2".to_string(), json!({"a": 1}), 5)
            .expect("append");

        assert!(applied);
        assert_eq!(store.len(), 2);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn correlation_id_is_lifted_from_payload() {
        let dir = temp_dir("event_store_corr");
        let mut store = EventStore::open(dir.join("events.jsonl")).expect("open");

        let record = store
            .append(
                "AI_ANALYSIS",
                json!({"correlation_id": "corr-7", "model": "m"}),
                9,
            )
            .expect("append");
        assert_eq!(record.correlation_id.as_deref(), Some("corr-7"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
