use super::{compact_ops, ListStorage, StoredList, StoredRegistry, SyncCursor};
use crate::error::{Error, Result};
use crate::sync_op::SyncOp;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Durable JSON-file-backed [`ListStorage`] (spec §4.6, §6.1).
///
/// Namespaces map directly onto files under `root`:
/// `lists/<id>.snapshot.json`, `lists/<id>.ops.json`, `registry.snapshot.json`,
/// `registry.ops.json`, `sync.state.json`, `sync.outbox.json`. Writes are
/// serialised through a single mutex, which is sufficient for the
/// single-tasked access pattern the repository guarantees (spec §5).
pub struct FileStorage {
    root: PathBuf,
    compaction_margin: u64,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), compaction_margin: 0, lock: Mutex::new(()) }
    }

    pub fn with_compaction_margin(root: impl Into<PathBuf>, margin: u64) -> Self {
        Self { root: root.into(), compaction_margin: margin, lock: Mutex::new(()) }
    }

    fn lists_dir(&self) -> PathBuf {
        self.root.join("lists")
    }

    fn snapshot_path(&self, list_id: &str) -> PathBuf {
        self.lists_dir().join(format!("{list_id}.snapshot.json"))
    }

    fn ops_path(&self, list_id: &str) -> PathBuf {
        self.lists_dir().join(format!("{list_id}.ops.json"))
    }

    fn registry_snapshot_path(&self) -> PathBuf {
        self.root.join("registry.snapshot.json")
    }

    fn registry_ops_path(&self) -> PathBuf {
        self.root.join("registry.ops.json")
    }

    fn sync_state_path(&self) -> PathBuf {
        self.root.join("sync.state.json")
    }

    fn outbox_path(&self) -> PathBuf {
        self.root.join("sync.outbox.json")
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::storage(format!("corrupt json at {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage(format!("reading {}: {e}", path.display()))),
        }
    }

    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("creating {}: {e}", parent.display())))?;
        }
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::storage(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| Error::storage(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| Error::storage(format!("renaming into {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl ListStorage for FileStorage {
    async fn ready(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.lists_dir())
            .await
            .map_err(|e| Error::storage(format!("creating storage root: {e}")))
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if tokio::fs::metadata(&self.root).await.is_ok() {
            tokio::fs::remove_dir_all(&self.root).await.map_err(|e| Error::storage(e.to_string()))?;
        }
        tokio::fs::create_dir_all(self.lists_dir()).await.map_err(|e| Error::storage(e.to_string()))
    }

    async fn load_registry(&self) -> Result<Option<StoredRegistry>> {
        let state: Option<serde_json::Value> = Self::read_json(&self.registry_snapshot_path()).await?;
        let Some(state) = state else { return Ok(None) };
        let operations: Vec<serde_json::Value> = Self::read_json(&self.registry_ops_path()).await?.unwrap_or_default();
        let updated_at = tokio::fs::metadata(&self.registry_snapshot_path())
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(chrono::Utc::now);
        Ok(Some(StoredRegistry { state, operations, updated_at }))
    }

    async fn load_all_lists(&self) -> Result<Vec<StoredList>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.lists_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(Error::storage(e.to_string())),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::storage(e.to_string()))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(list_id) = name.strip_suffix(".snapshot.json") else { continue };
            if let Some(stored) = self.load_list(list_id).await? {
                out.push(stored);
            }
        }
        Ok(out)
    }

    async fn load_list(&self, list_id: &str) -> Result<Option<StoredList>> {
        let state: Option<serde_json::Value> = Self::read_json(&self.snapshot_path(list_id)).await?;
        let Some(state) = state else { return Ok(None) };
        let operations: Vec<serde_json::Value> = Self::read_json(&self.ops_path(list_id)).await?.unwrap_or_default();
        let updated_at = tokio::fs::metadata(self.snapshot_path(list_id))
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(chrono::DateTime::<chrono::Utc>::from)
            .unwrap_or_else(chrono::Utc::now);
        Ok(Some(StoredList { list_id: list_id.to_string(), state, operations, updated_at }))
    }

    async fn persist_operations(&self, list_id: &str, ops: Vec<serde_json::Value>, snapshot: serde_json::Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut existing: Vec<serde_json::Value> = Self::read_json(&self.ops_path(list_id)).await?.unwrap_or_default();
        existing.extend(ops);
        let compacted = compact_ops(existing, &snapshot, self.compaction_margin);
        Self::write_json(&self.snapshot_path(list_id), &snapshot).await?;
        Self::write_json(&self.ops_path(list_id), &compacted).await
    }

    async fn persist_registry(&self, ops: Vec<serde_json::Value>, snapshot: serde_json::Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut existing: Vec<serde_json::Value> = Self::read_json(&self.registry_ops_path()).await?.unwrap_or_default();
        existing.extend(ops);
        let compacted = compact_ops(existing, &snapshot, self.compaction_margin);
        Self::write_json(&self.registry_snapshot_path(), &snapshot).await?;
        Self::write_json(&self.registry_ops_path(), &compacted).await
    }

    async fn load_sync_state(&self) -> Result<Option<SyncCursor>> {
        Self::read_json(&self.sync_state_path()).await
    }

    async fn persist_sync_state(&self, cursor: SyncCursor) -> Result<()> {
        let _guard = self.lock.lock().await;
        Self::write_json(&self.sync_state_path(), &cursor).await
    }

    async fn load_outbox(&self) -> Result<Vec<SyncOp>> {
        Ok(Self::read_json(&self.outbox_path()).await?.unwrap_or_default())
    }

    async fn persist_outbox(&self, outbox: Vec<SyncOp>) -> Result<()> {
        let _guard = self.lock.lock().await;
        Self::write_json(&self.outbox_path(), &outbox).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persists_and_reloads_a_list_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.ready().await.unwrap();

        storage
            .persist_operations("l1", vec![serde_json::json!({"clock": 1})], serde_json::json!({"clock": 1, "title": "Home"}))
            .await
            .unwrap();

        let loaded = storage.load_list("l1").await.unwrap().unwrap();
        assert_eq!(loaded.state["title"], "Home");
        assert_eq!(loaded.operations.len(), 1);
    }

    #[tokio::test]
    async fn outbox_survives_a_reload_of_the_same_root() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path());
            storage.ready().await.unwrap();
            storage
                .persist_outbox(vec![SyncOp {
                    scope: crate::sync_op::Scope::List,
                    resource_id: "l1".into(),
                    actor: crate::clock::ActorId::new("a"),
                    clock: 1,
                    payload: serde_json::json!({}),
                    server_seq: None,
                }])
                .await
                .unwrap();
        }
        let storage = FileStorage::new(dir.path());
        let outbox = storage.load_outbox().await.unwrap();
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn compaction_drops_ops_older_than_the_snapshot_floor() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::with_compaction_margin(dir.path(), 1);
        storage.ready().await.unwrap();
        storage
            .persist_operations("l1", vec![serde_json::json!({"clock": 1}), serde_json::json!({"clock": 2})], serde_json::json!({"clock": 2}))
            .await
            .unwrap();
        storage
            .persist_operations("l1", vec![serde_json::json!({"clock": 5})], serde_json::json!({"clock": 5}))
            .await
            .unwrap();
        let loaded = storage.load_list("l1").await.unwrap().unwrap();
        // floor = 5 - margin(1) = 4; clock 1 and 2 should be dropped.
        assert!(loaded.operations.iter().all(|op| super::super::op_clock(op) >= 4));
    }
}
