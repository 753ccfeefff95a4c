pub mod event_log;
pub mod wal;

#[allow(unused_imports)]
pub use event_log::{EventRecord, EventStore};
#[allow(unused_imports)]
pub use wal::{
    replay_into_event_store, OrphanIntent, ReplayStats, WalReader, WalRecord, WalRecordType,
    WalWriter,
};
