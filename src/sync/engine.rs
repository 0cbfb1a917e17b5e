//! Sync engine: bootstrap/pull/push/reset protocol driver (spec §4.8).

use super::{
    BootstrapResponse, ConflictResponse, Method, PullResponseOk, PushRequest, PushResponseOk, ResetRequest,
    ResetResponseOk, Transport,
};
use crate::error::{Error, Result};
use crate::storage::{ListStorage, SyncCursor};
use crate::sync_op::SyncOp;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Engine-side hook into the repository: remote-op application and
/// dataset-reset snapshot adoption (spec §4.7 "Remote op application",
/// §4.8 "Snapshot handler"). Held as a [`Weak`] reference so the engine
/// never keeps the host alive past its own lifetime.
#[async_trait]
pub trait SyncHost: Send + Sync {
    async fn apply_remote_ops(&self, ops: Vec<SyncOp>) -> Result<()>;
    async fn apply_snapshot_blob(&self, snapshot: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SyncConfig {
    pub client_id: String,
    /// Default 2000ms (spec §4.8).
    pub poll_interval: Duration,
    pub on_connection_error: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Consecutive transport failures before `on_connection_error` fires
    /// and the engine disables itself (spec §7: "on repeated failure").
    pub failure_threshold: u32,
}

impl SyncConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            poll_interval: Duration::from_millis(2000),
            on_connection_error: None,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Disabled,
    Initialized,
    Active,
    Syncing,
    AdoptingSnapshot,
}

struct RuntimeState {
    phase: Phase,
    last_server_seq: u64,
    dataset_generation_key: String,
    outbox: Vec<SyncOp>,
}

pub struct SyncEngine {
    storage: Arc<dyn ListStorage>,
    transport: Arc<dyn Transport>,
    host: Weak<dyn SyncHost>,
    config: SyncConfig,
    state: Mutex<RuntimeState>,
    sync_lock: Mutex<()>,
    active: AtomicBool,
    consecutive_failures: AtomicU32,
    poll_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(storage: Arc<dyn ListStorage>, transport: Arc<dyn Transport>, host: Weak<dyn SyncHost>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            storage,
            transport,
            host,
            config,
            state: Mutex::new(RuntimeState {
                phase: Phase::Disabled,
                last_server_seq: 0,
                dataset_generation_key: String::new(),
                outbox: Vec::new(),
            }),
            sync_lock: Mutex::new(()),
            active: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            poll_handle: StdMutex::new(None),
        })
    }

    /// Loads the persisted sync cursor and outbox into memory and marks the
    /// engine `Initialized`.
    pub async fn init(&self) -> Result<()> {
        let cursor = self.storage.load_sync_state().await?.unwrap_or(SyncCursor {
            client_id: self.config.client_id.clone(),
            last_server_seq: 0,
            dataset_generation_key: String::new(),
        });
        let outbox = self.storage.load_outbox().await?;
        let mut state = self.state.lock().await;
        state.last_server_seq = cursor.last_server_seq;
        state.dataset_generation_key = cursor.dataset_generation_key;
        state.outbox = outbox;
        state.phase = Phase::Initialized;
        Ok(())
    }

    /// Durably enqueues a locally generated envelope (spec §4.7 step 4,
    /// §8 property 7). Called by the repository when the engine is
    /// initialised; when it isn't, the repository appends to the outbox
    /// directly through [`ListStorage`] instead.
    pub async fn enqueue(&self, op: SyncOp) -> Result<()> {
        let mut state = self.state.lock().await;
        state.outbox.push(op);
        self.storage.persist_outbox(state.outbox.clone()).await
    }

    fn host(&self) -> Option<Arc<dyn SyncHost>> {
        self.host.upgrade()
    }

    async fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    async fn record_failure(&self, err: &Error) {
        tracing::warn!(?err, "sync transport call failed; will retry next tick");
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.failure_threshold {
            tracing::error!(failures, "disabling sync after repeated transport failures");
            if let Some(cb) = &self.config.on_connection_error {
                cb();
            }
            self.disable().await;
        }
    }

    /// Idempotent: disabling an already-disabled engine is a no-op beyond
    /// clearing the active flag. The outbox remains on disk (spec §7).
    pub async fn disable(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.state.lock().await.phase = Phase::Disabled;
        if let Some(handle) = self.poll_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn adopt_conflict(&self, conflict: ConflictResponse) -> Result<()> {
        let mut state = self.state.lock().await;
        if conflict.dataset_generation_key == state.dataset_generation_key {
            return Ok(());
        }
        state.phase = Phase::AdoptingSnapshot;
        state.dataset_generation_key = conflict.dataset_generation_key.clone();
        state.last_server_seq = 0;
        state.outbox.clear();
        drop(state);

        self.storage.persist_outbox(Vec::new()).await?;
        self.storage
            .persist_sync_state(SyncCursor {
                client_id: self.config.client_id.clone(),
                last_server_seq: 0,
                dataset_generation_key: conflict.dataset_generation_key,
            })
            .await?;

        if let Some(host) = self.host() {
            host.apply_snapshot_blob(&conflict.snapshot).await?;
        }

        self.state.lock().await.phase = Phase::Active;
        Ok(())
    }

    async fn persist_cursor(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.storage
            .persist_sync_state(SyncCursor {
                client_id: self.config.client_id.clone(),
                last_server_seq: state.last_server_seq,
                dataset_generation_key: state.dataset_generation_key.clone(),
            })
            .await
    }

    /// `GET /sync/bootstrap` on first run: outbox empty AND (`lastServerSeq
    /// == 0` OR no dataset key) (spec §4.8).
    async fn maybe_bootstrap(&self) -> Result<bool> {
        let should = {
            let state = self.state.lock().await;
            state.outbox.is_empty() && (state.last_server_seq == 0 || state.dataset_generation_key.is_empty())
        };
        if !should {
            return Ok(false);
        }

        let (status, json) = match self.transport.call("/sync/bootstrap", Method::Get, None).await {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(&e).await;
                return Ok(true);
            }
        };
        if status < 200 || status >= 300 {
            self.record_failure(&Error::transport(format!("bootstrap returned status {status}"))).await;
            return Ok(true);
        }
        self.record_success().await;

        let resp: BootstrapResponse =
            serde_json::from_value(json).map_err(|e| Error::transport(format!("decoding bootstrap response: {e}")))?;

        let mut state = self.state.lock().await;
        let key_changed = resp.dataset_generation_key != state.dataset_generation_key;
        state.dataset_generation_key = resp.dataset_generation_key;
        drop(state);

        if let (true, Some(snapshot)) = (key_changed, resp.snapshot) {
            if let Some(host) = self.host() {
                host.apply_snapshot_blob(&snapshot).await?;
            }
        } else if let Some(host) = self.host() {
            host.apply_remote_ops(resp.ops).await?;
        }

        self.state.lock().await.last_server_seq = resp.server_seq;
        self.persist_cursor().await?;
        Ok(true)
    }

    /// `POST /sync/push` (spec §4.8).
    pub async fn flush_outbox(&self) -> Result<()> {
        let ops = self.state.lock().await.outbox.clone();
        if ops.is_empty() {
            return Ok(());
        }

        let dataset_generation_key = self.state.lock().await.dataset_generation_key.clone();
        let body = serde_json::to_value(PushRequest { client_id: self.config.client_id.clone(), dataset_generation_key, ops })
            .map_err(|e| Error::transport(e.to_string()))?;

        let (status, json) = match self.transport.call("/sync/push", Method::Post, Some(body)).await {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(&e).await;
                return Ok(());
            }
        };

        if status == 409 {
            let conflict: ConflictResponse =
                serde_json::from_value(json).map_err(|e| Error::transport(format!("decoding 409 body: {e}")))?;
            self.record_success().await;
            return self.adopt_conflict(conflict).await;
        }
        if status < 200 || status >= 300 {
            self.record_failure(&Error::transport(format!("push returned status {status}"))).await;
            return Ok(());
        }
        self.record_success().await;

        let resp: PushResponseOk =
            serde_json::from_value(json).map_err(|e| Error::transport(format!("decoding push response: {e}")))?;

        let mut state = self.state.lock().await;
        if let Some(key) = resp.dataset_generation_key {
            state.dataset_generation_key = key;
        }
        state.outbox.clear();
        drop(state);

        self.storage.persist_outbox(Vec::new()).await?;
        self.persist_cursor().await
    }

    /// `GET /sync/pull?since=...` (spec §4.8).
    pub async fn pull(&self) -> Result<()> {
        let (since, client_id, key) = {
            let state = self.state.lock().await;
            (state.last_server_seq, self.config.client_id.clone(), state.dataset_generation_key.clone())
        };
        let path = format!("/sync/pull?since={since}&clientId={client_id}&datasetGenerationKey={key}");

        let (status, json) = match self.transport.call(&path, Method::Get, None).await {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(&e).await;
                return Ok(());
            }
        };

        if status == 409 {
            let conflict: ConflictResponse =
                serde_json::from_value(json).map_err(|e| Error::transport(format!("decoding 409 body: {e}")))?;
            self.record_success().await;
            return self.adopt_conflict(conflict).await;
        }
        if status < 200 || status >= 300 {
            self.record_failure(&Error::transport(format!("pull returned status {status}"))).await;
            return Ok(());
        }
        self.record_success().await;

        let resp: PullResponseOk =
            serde_json::from_value(json).map_err(|e| Error::transport(format!("decoding pull response: {e}")))?;

        let key_changed = resp.dataset_generation_key != key;
        if key_changed {
            if let (Some(snapshot), Some(host)) = (&resp.snapshot, self.host()) {
                host.apply_snapshot_blob(snapshot).await?;
            }
        } else if let Some(host) = self.host() {
            host.apply_remote_ops(resp.ops).await?;
        }

        let mut state = self.state.lock().await;
        state.last_server_seq = resp.server_seq;
        state.dataset_generation_key = resp.dataset_generation_key;
        drop(state);
        self.persist_cursor().await
    }

    /// `POST /sync/reset` (spec §4.8): generates a fresh dataset generation
    /// key locally and pushes a full-dataset replacement.
    pub async fn reset_with_snapshot(&self, snapshot_text: String) -> Result<()> {
        let new_key = format!("gen-{}", uuid::Uuid::new_v4());
        let body = serde_json::to_value(ResetRequest {
            client_id: self.config.client_id.clone(),
            dataset_generation_key: new_key.clone(),
            snapshot: snapshot_text,
        })
        .map_err(|e| Error::transport(e.to_string()))?;

        let (status, json) = self.transport.call("/sync/reset", Method::Post, Some(body)).await?;
        if status < 200 || status >= 300 {
            return Err(Error::transport(format!("reset returned status {status}")));
        }
        let resp: ResetResponseOk =
            serde_json::from_value(json).map_err(|e| Error::transport(format!("decoding reset response: {e}")))?;

        let mut state = self.state.lock().await;
        state.dataset_generation_key = resp.dataset_generation_key;
        state.last_server_seq = resp.server_seq;
        state.outbox.clear();
        drop(state);

        self.storage.persist_outbox(Vec::new()).await?;
        self.persist_cursor().await
    }

    /// One push/pull pair, serialised through `sync_lock` so concurrent
    /// callers never interleave (spec §4.8, §5 "Sync queue").
    pub async fn sync_once(&self) -> Result<()> {
        let _guard = self.sync_lock.lock().await;
        self.state.lock().await.phase = Phase::Syncing;

        if self.maybe_bootstrap().await? {
            self.state.lock().await.phase = Phase::Active;
            return Ok(());
        }

        self.flush_outbox().await?;
        self.pull().await?;
        self.state.lock().await.phase = Phase::Active;
        Ok(())
    }

    /// Triggers an immediate sync, then schedules `syncOnce` every
    /// `poll_interval` while active (spec §4.8 "Polling loop"). Idempotent:
    /// calling `start` while already active replaces the running loop.
    pub fn start(self: &Arc<Self>) {
        self.active.store(true, Ordering::SeqCst);
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if !engine.active.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(err) = engine.sync_once().await {
                    tracing::warn!(?err, "sync_once failed; retrying next tick");
                }
                tokio::time::sleep(engine.config.poll_interval).await;
            }
        });
        if let Some(previous) = self.poll_handle.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }
}
