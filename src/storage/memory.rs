use super::{compact_ops, ListStorage, StoredList, StoredRegistry, SyncCursor};
use crate::error::Result;
use crate::sync_op::SyncOp;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// In-memory [`ListStorage`] used by tests and as the minimal "no disk
/// available" host binding (spec §6.1: "in-memory stub for tests").
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    compaction_margin: u64,
}

#[derive(Default)]
struct Inner {
    registry: Option<StoredRegistry>,
    lists: HashMap<String, StoredList>,
    sync_state: Option<SyncCursor>,
    outbox: Vec<SyncOp>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()), compaction_margin: 0 }
    }

    pub fn with_compaction_margin(margin: u64) -> Self {
        Self { inner: Mutex::new(Inner::default()), compaction_margin: margin }
    }
}

#[async_trait]
impl ListStorage for MemoryStorage {
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.lock().await = Inner::default();
        Ok(())
    }

    async fn load_registry(&self) -> Result<Option<StoredRegistry>> {
        Ok(self.inner.lock().await.registry.clone())
    }

    async fn load_all_lists(&self) -> Result<Vec<StoredList>> {
        Ok(self.inner.lock().await.lists.values().cloned().collect())
    }

    async fn load_list(&self, list_id: &str) -> Result<Option<StoredList>> {
        Ok(self.inner.lock().await.lists.get(list_id).cloned())
    }

    async fn persist_operations(&self, list_id: &str, ops: Vec<serde_json::Value>, snapshot: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let margin = self.compaction_margin;
        let entry = inner.lists.entry(list_id.to_string()).or_insert_with(|| StoredList {
            list_id: list_id.to_string(),
            state: serde_json::Value::Null,
            operations: Vec::new(),
            updated_at: chrono::Utc::now(),
        });
        entry.operations.extend(ops);
        entry.operations = compact_ops(std::mem::take(&mut entry.operations), &snapshot, margin);
        entry.state = snapshot;
        entry.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn persist_registry(&self, ops: Vec<serde_json::Value>, snapshot: serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let margin = self.compaction_margin;
        let mut operations = inner.registry.as_ref().map(|r| r.operations.clone()).unwrap_or_default();
        operations.extend(ops);
        operations = compact_ops(operations, &snapshot, margin);
        inner.registry = Some(StoredRegistry { state: snapshot, operations, updated_at: chrono::Utc::now() });
        Ok(())
    }

    async fn load_sync_state(&self) -> Result<Option<SyncCursor>> {
        Ok(self.inner.lock().await.sync_state.clone())
    }

    async fn persist_sync_state(&self, cursor: SyncCursor) -> Result<()> {
        self.inner.lock().await.sync_state = Some(cursor);
        Ok(())
    }

    async fn load_outbox(&self) -> Result<Vec<SyncOp>> {
        Ok(self.inner.lock().await.outbox.clone())
    }

    async fn persist_outbox(&self, outbox: Vec<SyncOp>) -> Result<()> {
        self.inner.lock().await.outbox = outbox;
        Ok(())
    }
}
