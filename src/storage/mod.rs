//! Durable list storage (spec §4.6, §6.1).
//!
//! `ListStorage` is the abstract port the repository depends on;
//! [`MemoryStorage`] is the test double and [`FileStorage`] the durable
//! JSON-file binding. Operations and snapshots are kept as `serde_json`
//! blobs here — the storage layer doesn't need to know the concrete CRDT
//! op shape, only that it can round-trip JSON (mirrors how the teacher's
//! sync tables store `data`/`record_id` as opaque msgpack blobs).

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::sync_op::SyncOp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredList {
    pub list_id: String,
    pub state: serde_json::Value,
    pub operations: Vec<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StoredRegistry {
    pub state: serde_json::Value,
    pub operations: Vec<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncCursor {
    pub client_id: String,
    pub last_server_seq: u64,
    pub dataset_generation_key: String,
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self { client_id: String::new(), last_server_seq: 0, dataset_generation_key: String::new() }
    }
}

/// Ops carry their own `clock` field (top-level key `"clock"` in the JSON
/// blob) so `persist_operations` can apply the compaction rule (spec §4.6)
/// without deserialising into a concrete op type.
pub fn op_clock(op: &serde_json::Value) -> u64 {
    op.get("clock").and_then(|v| v.as_u64()).unwrap_or(0)
}

pub fn snapshot_clock(snapshot: &serde_json::Value) -> u64 {
    snapshot.get("clock").and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Retains ops whose `clock >= snapshot_clock.saturating_sub(margin)`
/// (spec §4.6 compaction policy).
pub fn compact_ops(ops: Vec<serde_json::Value>, snapshot: &serde_json::Value, margin: u64) -> Vec<serde_json::Value> {
    let floor = snapshot_clock(snapshot).saturating_sub(margin);
    ops.into_iter().filter(|op| op_clock(op) >= floor).collect()
}

#[async_trait]
pub trait ListStorage: Send + Sync {
    async fn ready(&self) -> Result<()>;
    async fn clear(&self) -> Result<()>;

    async fn load_registry(&self) -> Result<Option<StoredRegistry>>;
    async fn load_all_lists(&self) -> Result<Vec<StoredList>>;
    async fn load_list(&self, list_id: &str) -> Result<Option<StoredList>>;

    /// Appends `ops` to the persisted log for `list_id` and replaces the
    /// snapshot atomically; the persisted log MAY be compacted relative to
    /// `snapshot`'s clock (spec §4.6).
    async fn persist_operations(
        &self,
        list_id: &str,
        ops: Vec<serde_json::Value>,
        snapshot: serde_json::Value,
    ) -> Result<()>;

    async fn persist_registry(&self, ops: Vec<serde_json::Value>, snapshot: serde_json::Value) -> Result<()>;

    async fn load_sync_state(&self) -> Result<Option<SyncCursor>>;
    async fn persist_sync_state(&self, cursor: SyncCursor) -> Result<()>;

    async fn load_outbox(&self) -> Result<Vec<SyncOp>>;
    async fn persist_outbox(&self, outbox: Vec<SyncOp>) -> Result<()>;
}
