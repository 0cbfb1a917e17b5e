//! Lamport clock and actor identity (spec §3, §4.2).
//!
//! The teacher crate (`sd-core-sync`) seeds a hybrid-logical clock from a
//! persisted instance [`uuid::Uuid`] via `HLCBuilder::new().with_id(..)`.
//! This crate's CRDTs only need Lamport's original integer clock (spec
//! explicitly specifies `t := max(t, remote) + 1`), so `LamportClock` is a
//! plain `u64` counter, but actor-id persistence follows the same "read or
//! generate and store" shape as the teacher's instance id.

use async_trait::async_trait;
use std::fmt;

/// Opaque, non-empty, stable-per-device actor identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        debug_assert!(!raw.is_empty(), "ActorId must be non-empty");
        Self(raw)
    }

    pub fn generate() -> Self {
        Self(format!("actor-{}", uuid::Uuid::new_v4()))
    }

    /// Actor id used to generate deterministic positions during snapshot
    /// import (spec §6.3).
    pub fn synthetic_import() -> Self {
        Self("actor-import".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Minimal synchronous key/value port used to persist the actor id
/// (spec §4.2, §6.4). Production hosts bind this to their platform store;
/// tests inject [`InMemoryKv`]. Modeled as async so a durable on-disk
/// binding (e.g. a single small file) can be plugged in without changing
/// the trait.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> crate::error::Result<()>;
}

/// In-memory [`KvStore`] for tests and as a same-process default.
#[derive(Default)]
pub struct InMemoryKv(tokio::sync::Mutex<std::collections::HashMap<String, String>>);

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Option<String> {
        self.0.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) -> crate::error::Result<()> {
        self.0.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Reads the persisted actor id under `key`; generates and (best-effort)
/// persists a fresh one on first use. Failure to persist is non-fatal —
/// the generated id is still returned (spec §4.2).
pub async fn ensure_actor_id(storage: &dyn KvStore, key: &str) -> ActorId {
    if let Some(existing) = storage.get(key).await {
        if !existing.is_empty() {
            return ActorId::new(existing);
        }
    }

    let generated = ActorId::generate();
    if let Err(err) = storage.set(key, generated.as_str()).await {
        tracing::warn!(?err, "failed to persist generated actor id; continuing in-memory");
    }
    generated
}

/// Monotonic local event timestamp (spec §3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LamportClock(u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// `t := max(t, remote) + 1`.
    pub fn tick(&mut self, remote: Option<u64>) -> u64 {
        let base = remote.map_or(self.0, |r| self.0.max(r));
        self.0 = base + 1;
        self.0
    }

    /// `t := max(t, remote)`.
    pub fn merge(&mut self, remote: u64) {
        self.0 = self.0.max(remote);
    }
}
