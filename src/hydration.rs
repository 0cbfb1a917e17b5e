//! Replays snapshots + ops into fresh CRDT instances on boot (spec §4.6).
//!
//! For each list (and the registry), a CRDT is seeded from the stored
//! snapshot and then the stored op log is replayed through
//! `applyOperation`. Hydration is idempotent — a fresh CRDT's seen-set is
//! empty, so replaying the same ops against it always converges to the
//! same visible state — and the caller is responsible for not notifying
//! listeners until it completes (spec §4.6).

use crate::clock::ActorId;
use crate::error::{Error, Result};
use crate::registry::{AppliedRegistryOp, RegistryCrdt, RegistryState};
use crate::storage::{ListStorage, StoredList, StoredRegistry};
use crate::task_list::{AppliedTaskListOp, TaskListCrdt, TaskListState};
use std::collections::HashMap;

pub async fn hydrate_registry(storage: &dyn ListStorage, actor: ActorId) -> Result<RegistryCrdt> {
    let mut registry = RegistryCrdt::new(actor);
    if let Some(StoredRegistry { state, operations, .. }) = storage.load_registry().await? {
        if !state.is_null() {
            let state: RegistryState = serde_json::from_value(state)
                .map_err(|e| Error::storage(format!("decoding registry snapshot: {e}")))?;
            registry.import_state(state);
        }
        for op in operations {
            let op: AppliedRegistryOp = serde_json::from_value(op)
                .map_err(|e| Error::storage(format!("decoding registry op: {e}")))?;
            registry.apply_operation(op).await?;
        }
    }
    Ok(registry)
}

pub async fn hydrate_list(storage: &dyn ListStorage, list_id: &str, actor: ActorId) -> Result<Option<TaskListCrdt>> {
    let Some(StoredList { state, operations, .. }) = storage.load_list(list_id).await? else {
        return Ok(None);
    };
    let mut list = TaskListCrdt::new(actor);
    if !state.is_null() {
        let state: TaskListState =
            serde_json::from_value(state).map_err(|e| Error::storage(format!("decoding list snapshot: {e}")))?;
        list.import_state(state);
    }
    for op in operations {
        let op: AppliedTaskListOp =
            serde_json::from_value(op).map_err(|e| Error::storage(format!("decoding list op: {e}")))?;
        list.apply_operation(op)?;
    }
    Ok(Some(list))
}

pub async fn hydrate_all_lists(storage: &dyn ListStorage, actor: ActorId) -> Result<HashMap<String, TaskListCrdt>> {
    let mut out = HashMap::new();
    for stored in storage.load_all_lists().await? {
        if let Some(list) = hydrate_list(storage, &stored.list_id, actor.clone()).await? {
            out.insert(stored.list_id, list);
        }
    }
    Ok(out)
}
