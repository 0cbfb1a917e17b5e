//! Repository: the single orchestration point owning both CRDTs, storage,
//! listener sets, and the optional sync engine (spec §4.7).

use crate::clock::ActorId;
use crate::error::{Error, Result};
use crate::hydration;
use crate::ordered_set::{Applied, CrdtOp, OrderedSetEntry};
use crate::position::Position;
use crate::registry::{AppliedRegistryOp, ListMeta, RegistryCrdt};
use crate::snapshot::{self, ExportSnapshot};
use crate::storage::ListStorage;
use crate::sync::{SyncConfig, SyncEngine, SyncHost, Transport};
use crate::sync_op::{Scope, SyncOp};
use crate::task_list::{AppliedTaskListOp, InsertTaskArgs, MoveTaskArgs, TaskItemData, TaskItemPatch, TaskListCrdt, TaskListOp, TaskListState};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OnceCell, RwLock};

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub scope: Scope,
    pub resource_id: String,
}

pub type ChangeHandler = Box<dyn Fn(&ChangeEvent) + Send + Sync>;
pub type RegistryHandler = Box<dyn Fn(&[OrderedSetEntry<ListMeta>]) + Send + Sync>;
pub type ListHandler = Box<dyn Fn(&TaskListState) + Send + Sync>;

#[derive(Default)]
pub struct CreateListArgs {
    pub list_id: Option<String>,
    pub title: Option<String>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub items: Vec<InitialTaskItem>,
}

/// One seed item for `createList`'s `items?` (spec §4.7); inserted in
/// document order via `generate_insert` before the list's snapshot is
/// first persisted.
#[derive(Default)]
pub struct InitialTaskItem {
    pub item_id: Option<String>,
    pub text: String,
    pub done: bool,
    pub note: String,
}

#[derive(Default)]
pub struct InsertTaskCall {
    pub item_id: Option<String>,
    pub text: String,
    pub done: Option<bool>,
    pub note: Option<String>,
    pub after: Option<String>,
    pub before: Option<String>,
    pub position: Option<Position>,
}

#[derive(Default)]
pub struct PlacementArgs {
    pub after: Option<String>,
    pub before: Option<String>,
    pub position: Option<Position>,
}

pub struct SplitTaskArgs {
    pub before_text: String,
    pub after_text: String,
    pub new_item_id: Option<String>,
}

fn call_handlers<T>(handlers: &[Box<dyn Fn(&T) + Send + Sync>], arg: &T) {
    for handler in handlers {
        // Spec §4.7: "handlers run synchronously in a try/ignore block" —
        // a panicking subscriber must not take down its siblings.
        let _ = std::panic::catch_unwind(AssertUnwindSafe(|| handler(arg)));
    }
}

fn next_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

/// Owns one `RegistryCrdt`, the `listId -> TaskListCrdt` map, the storage
/// port, listener sets, the history-suppression counter, and an optional
/// `SyncEngine` (spec §4.7). Constructed behind an `Arc` because the sync
/// engine holds a `Weak<dyn SyncHost>` back-reference to it.
pub struct Repository {
    storage: Arc<dyn ListStorage>,
    actor: ActorId,
    registry: Mutex<RegistryCrdt>,
    lists: Mutex<HashMap<String, TaskListCrdt>>,
    sync: RwLock<Option<Arc<SyncEngine>>>,
    init: OnceCell<()>,
    history_suppressed: AtomicU32,
    history_queue: Mutex<()>,
    text_queues: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    pending_inserts: Mutex<HashMap<(String, String), Arc<Notify>>>,
    outbox_queue: Mutex<()>,
    global_listeners: RwLock<Vec<ChangeHandler>>,
    registry_listeners: RwLock<Vec<RegistryHandler>>,
    list_listeners: RwLock<HashMap<String, Vec<ListHandler>>>,
}

impl Repository {
    pub fn new(storage: Arc<dyn ListStorage>, actor: ActorId) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(RegistryCrdt::new(actor.clone())),
            lists: Mutex::new(HashMap::new()),
            storage,
            actor,
            sync: RwLock::new(None),
            init: OnceCell::new(),
            history_suppressed: AtomicU32::new(0),
            history_queue: Mutex::new(()),
            text_queues: Mutex::new(HashMap::new()),
            pending_inserts: Mutex::new(HashMap::new()),
            outbox_queue: Mutex::new(()),
            global_listeners: RwLock::new(Vec::new()),
            registry_listeners: RwLock::new(Vec::new()),
            list_listeners: RwLock::new(HashMap::new()),
        })
    }

    /// One-shot; concurrent callers share the same future (spec §5 "Init
    /// queue").
    pub async fn initialize(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                self.storage.ready().await?;
                let registry = hydration::hydrate_registry(self.storage.as_ref(), self.actor.clone()).await?;
                let lists = hydration::hydrate_all_lists(self.storage.as_ref(), self.actor.clone()).await?;
                *self.registry.lock().await = registry;
                *self.lists.lock().await = lists;
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Wires a transport into a fresh [`SyncEngine`] bound to this
    /// repository via a `Weak<dyn SyncHost>` (no retain cycle: the engine
    /// never keeps the repository alive past its own `Arc`).
    pub async fn attach_sync_engine(self: &Arc<Self>, transport: Arc<dyn Transport>, config: SyncConfig) -> Result<Arc<SyncEngine>> {
        let host: Arc<dyn SyncHost> = self.clone();
        let engine = SyncEngine::new(self.storage.clone(), transport, Arc::downgrade(&host), config);
        engine.init().await?;
        *self.sync.write().await = Some(engine.clone());
        Ok(engine)
    }

    pub fn is_history_suppressed(&self) -> bool {
        self.history_suppressed.load(Ordering::SeqCst) > 0
    }

    /// Serialisation point for an external undo/redo manager (spec §5
    /// "History queue") — not re-specified here (spec §1 non-goal).
    pub async fn lock_history_queue(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.history_queue.lock().await
    }

    async fn text_queue(&self, key: &(String, String)) -> Arc<Mutex<()>> {
        self.text_queues.lock().await.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn enqueue_sync(&self, scope: Scope, resource_id: String, actor: ActorId, clock: u64, payload: Value) -> Result<()> {
        let op = SyncOp { scope, resource_id, actor, clock, payload, server_seq: None };
        let engine = self.sync.read().await.clone();
        match engine {
            Some(engine) => engine.enqueue(op).await,
            None => {
                let _guard = self.outbox_queue.lock().await;
                let mut outbox = self.storage.load_outbox().await?;
                outbox.push(op);
                self.storage.persist_outbox(outbox).await
            }
        }
    }

    async fn emit(&self, scope: Scope, resource_id: &str) {
        let event = ChangeEvent { scope, resource_id: resource_id.to_string() };
        call_handlers(&self.global_listeners.read().await, &event);

        match scope {
            Scope::Registry => {
                let snapshot = self.registry.lock().await.get_snapshot();
                call_handlers(&self.registry_listeners.read().await, &snapshot);
            }
            Scope::List => {
                let state = self.lists.lock().await.get(resource_id).map(|l| l.get_state());
                if let Some(state) = state {
                    if let Some(handlers) = self.list_listeners.read().await.get(resource_id) {
                        call_handlers(handlers, &state);
                    }
                }
            }
        }
    }

    /// Persists, emits, then (unless `remote`) enqueues every touched
    /// registry op for sync — the four-step mutation orchestration of
    /// spec §4.7.
    async fn finish_registry_mutation(&self, ops: Vec<AppliedRegistryOp>, remote: bool) {
        let state = self.registry.lock().await.get_state();
        let ops_json: Vec<Value> = ops.iter().filter_map(|o| serde_json::to_value(o).ok()).collect();
        match serde_json::to_value(&state) {
            Ok(snapshot) => {
                if let Err(e) = self.storage.persist_registry(ops_json, snapshot).await {
                    tracing::warn!(error = %e, "failed to persist registry operations");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize registry snapshot"),
        }

        self.emit(Scope::Registry, "registry").await;

        if !remote {
            for op in ops {
                let payload = serde_json::to_value(&op.op).unwrap_or(Value::Null);
                if let Err(e) = self.enqueue_sync(Scope::Registry, "registry".to_string(), op.actor, op.clock, payload).await {
                    tracing::warn!(error = %e, "failed to enqueue registry sync op");
                }
            }
        }
    }

    async fn finish_list_mutation(&self, list_id: &str, ops: Vec<AppliedTaskListOp>, remote: bool) {
        let state = self.lists.lock().await.get(list_id).map(|l| l.get_state());
        if let Some(state) = &state {
            let ops_json: Vec<Value> = ops.iter().filter_map(|o| serde_json::to_value(o).ok()).collect();
            match serde_json::to_value(state) {
                Ok(snapshot) => {
                    if let Err(e) = self.storage.persist_operations(list_id, ops_json, snapshot).await {
                        tracing::warn!(error = %e, list_id, "failed to persist list operations");
                    }
                }
                Err(e) => tracing::warn!(error = %e, list_id, "failed to serialize list snapshot"),
            }
        }

        self.emit(Scope::List, list_id).await;

        if !remote {
            for op in ops {
                let payload = serde_json::to_value(&op.op).unwrap_or(Value::Null);
                if let Err(e) = self.enqueue_sync(Scope::List, list_id.to_string(), op.actor, op.clock, payload).await {
                    tracing::warn!(error = %e, "failed to enqueue list sync op");
                }
            }
        }
    }

    // ---- mutating API (spec §4.7) -----------------------------------

    pub async fn create_list(&self, args: CreateListArgs) -> Result<OrderedSetEntry<ListMeta>> {
        self.initialize().await?;
        let list_id = args.list_id.unwrap_or_else(|| next_id("list"));
        let title = args.title.unwrap_or_default();

        let applied = self.registry.lock().await.generate_create(list_id.clone(), title, args.after, args.before, None).await?;

        let mut list = TaskListCrdt::new(self.actor.clone());
        let mut item_ops = Vec::new();
        let mut previous_item_id: Option<String> = None;
        for item in args.items {
            let item_id = item.item_id.unwrap_or_else(|| next_id("item"));
            let item_applied = list.generate_insert(InsertTaskArgs {
                id: item_id.clone(),
                text: item.text,
                done: item.done,
                note: item.note,
                after: previous_item_id.clone(),
                before: None,
                position: None,
            })?;
            previous_item_id = Some(item_id);
            item_ops.push(item_applied);
        }
        self.lists.lock().await.insert(list_id.clone(), list);

        self.finish_registry_mutation(vec![applied], false).await;
        // Persist the list's own snapshot immediately — even with zero
        // items — so it survives a restart (hydrate_all_lists enumerates
        // snapshot files on disk; a list with none would otherwise vanish).
        self.finish_list_mutation(&list_id, item_ops, false).await;

        self.registry.lock().await.get_snapshot().into_iter().find(|e| e.id == list_id).ok_or(Error::MissingItem(list_id))
    }

    pub async fn remove_list(&self, list_id: &str) -> Result<()> {
        self.initialize().await?;
        let applied = self.registry.lock().await.generate_remove(list_id).await?;
        self.finish_registry_mutation(vec![applied], false).await;
        Ok(())
    }

    pub async fn rename_list(&self, list_id: &str, title: String) -> Result<OrderedSetEntry<ListMeta>> {
        self.initialize().await?;
        let applied = self.registry.lock().await.generate_rename(list_id, title).await?;
        self.finish_registry_mutation(vec![applied], false).await;
        self.registry
            .lock()
            .await
            .get_snapshot()
            .into_iter()
            .find(|e| e.id == list_id)
            .ok_or_else(|| Error::MissingItem(list_id.to_string()))
    }

    pub async fn reorder_list(&self, list_id: String, placement: PlacementArgs) -> Result<()> {
        self.initialize().await?;
        let applied = self.registry.lock().await.generate_reorder(list_id, placement.after, placement.before, placement.position).await?;
        self.finish_registry_mutation(vec![applied], false).await;
        Ok(())
    }

    pub async fn insert_task(&self, list_id: &str, call: InsertTaskCall) -> Result<OrderedSetEntry<TaskItemData>> {
        self.initialize().await?;
        let item_id = call.item_id.unwrap_or_else(|| next_id("item"));
        let key = (list_id.to_string(), item_id.clone());
        let notify = Arc::new(Notify::new());
        self.pending_inserts.lock().await.insert(key.clone(), notify.clone());

        let outcome = async {
            let mut lists = self.lists.lock().await;
            let list = lists.get_mut(list_id).ok_or_else(|| Error::MissingItem(list_id.to_string()))?;
            list.generate_insert(InsertTaskArgs {
                id: item_id.clone(),
                text: call.text,
                done: call.done.unwrap_or(false),
                note: call.note.unwrap_or_default(),
                after: call.after,
                before: call.before,
                position: call.position,
            })
        }
        .await;

        self.pending_inserts.lock().await.remove(&key);
        notify.notify_waiters();
        let applied = outcome?;

        self.finish_list_mutation(list_id, vec![applied], false).await;
        self.lists
            .lock()
            .await
            .get(list_id)
            .and_then(|l| l.get_item(&item_id).cloned())
            .ok_or(Error::MissingItem(item_id))
    }

    pub async fn remove_task(&self, list_id: &str, item_id: &str) -> Result<()> {
        self.initialize().await?;
        let applied = {
            let mut lists = self.lists.lock().await;
            let list = lists.get_mut(list_id).ok_or_else(|| Error::MissingItem(list_id.to_string()))?;
            list.generate_remove(item_id)?
        };
        self.finish_list_mutation(list_id, vec![applied], false).await;
        Ok(())
    }

    pub async fn toggle_task(&self, list_id: &str, item_id: &str, explicit: Option<bool>) -> Result<Option<OrderedSetEntry<TaskItemData>>> {
        self.initialize().await?;
        let applied = {
            let mut lists = self.lists.lock().await;
            let list = lists.get_mut(list_id).ok_or_else(|| Error::MissingItem(list_id.to_string()))?;
            list.generate_toggle(item_id, explicit)?
        };
        self.finish_list_mutation(list_id, vec![applied], false).await;
        Ok(self.lists.lock().await.get(list_id).and_then(|l| l.get_item(item_id).cloned()))
    }

    /// Awaits any in-flight `insertTask` for this id, then (for `text`
    /// patches) serialises behind the per-`(listId, itemId)` text queue so
    /// rapid keystrokes apply in order (spec §5).
    pub async fn update_task(&self, list_id: &str, item_id: &str, patch: TaskItemPatch) -> Result<Option<OrderedSetEntry<TaskItemData>>> {
        self.initialize().await?;
        let key = (list_id.to_string(), item_id.to_string());

        if let Some(notify) = self.pending_inserts.lock().await.get(&key).cloned() {
            notify.notified().await;
        }

        let text_lock = if patch.text.is_some() { Some(self.text_queue(&key).await) } else { None };
        let _text_guard = match &text_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let applied = {
            let mut lists = self.lists.lock().await;
            let list = lists.get_mut(list_id).ok_or_else(|| Error::MissingItem(list_id.to_string()))?;
            list.generate_update(item_id, patch)?
        };
        self.finish_list_mutation(list_id, vec![applied], false).await;
        Ok(self.lists.lock().await.get(list_id).and_then(|l| l.get_item(item_id).cloned()))
    }

    pub async fn move_task_within_list(&self, list_id: &str, item_id: &str, placement: PlacementArgs) -> Result<()> {
        self.initialize().await?;
        let applied = {
            let mut lists = self.lists.lock().await;
            let list = lists.get_mut(list_id).ok_or_else(|| Error::MissingItem(list_id.to_string()))?;
            list.generate_move(MoveTaskArgs { id: item_id.to_string(), after: placement.after, before: placement.before, position: placement.position })?
        };
        self.finish_list_mutation(list_id, vec![applied], false).await;
        Ok(())
    }

    /// Generates `remove` on the source list and `insert` on the target,
    /// persisting both before emitting either change event (spec §4.7).
    pub async fn move_task(
        &self,
        source_list_id: &str,
        target_list_id: &str,
        item_id: &str,
        placement: PlacementArgs,
    ) -> Result<OrderedSetEntry<TaskItemData>> {
        self.initialize().await?;

        let (remove_applied, item_data) = {
            let mut lists = self.lists.lock().await;
            let source = lists.get_mut(source_list_id).ok_or_else(|| Error::MissingItem(source_list_id.to_string()))?;
            let data = source.get_item(item_id).ok_or_else(|| Error::MissingItem(item_id.to_string()))?.data.clone();
            let applied = source.generate_remove(item_id)?;
            (applied, data)
        };

        let insert_applied = {
            let mut lists = self.lists.lock().await;
            let target = lists.get_mut(target_list_id).ok_or_else(|| Error::MissingItem(target_list_id.to_string()))?;
            target.generate_insert(InsertTaskArgs {
                id: item_id.to_string(),
                text: item_data.text,
                done: item_data.done,
                note: item_data.note,
                after: placement.after,
                before: placement.before,
                position: placement.position,
            })?
        };

        let source_state = self.lists.lock().await.get(source_list_id).map(|l| l.get_state());
        let target_state = self.lists.lock().await.get(target_list_id).map(|l| l.get_state());

        if let Some(state) = &source_state {
            if let Ok(snapshot) = serde_json::to_value(state) {
                let ops = vec![serde_json::to_value(&remove_applied).unwrap_or(Value::Null)];
                if let Err(e) = self.storage.persist_operations(source_list_id, ops, snapshot).await {
                    tracing::warn!(error = %e, "failed to persist source list during moveTask");
                }
            }
        }
        if let Some(state) = &target_state {
            if let Ok(snapshot) = serde_json::to_value(state) {
                let ops = vec![serde_json::to_value(&insert_applied).unwrap_or(Value::Null)];
                if let Err(e) = self.storage.persist_operations(target_list_id, ops, snapshot).await {
                    tracing::warn!(error = %e, "failed to persist target list during moveTask");
                }
            }
        }

        self.emit(Scope::List, source_list_id).await;
        self.emit(Scope::List, target_list_id).await;

        let remove_payload = serde_json::to_value(&remove_applied.op).unwrap_or(Value::Null);
        if let Err(e) = self.enqueue_sync(Scope::List, source_list_id.to_string(), remove_applied.actor, remove_applied.clock, remove_payload).await {
            tracing::warn!(error = %e, "failed to enqueue moveTask source op");
        }
        let insert_payload = serde_json::to_value(&insert_applied.op).unwrap_or(Value::Null);
        if let Err(e) = self.enqueue_sync(Scope::List, target_list_id.to_string(), insert_applied.actor, insert_applied.clock, insert_payload).await {
            tracing::warn!(error = %e, "failed to enqueue moveTask target op");
        }

        self.lists
            .lock()
            .await
            .get(target_list_id)
            .and_then(|l| l.get_item(item_id).cloned())
            .ok_or_else(|| Error::MissingItem(item_id.to_string()))
    }

    /// Single composite op producing `(update old, insert new)` (spec
    /// §4.7).
    pub async fn split_task(&self, list_id: &str, item_id: &str, args: SplitTaskArgs) -> Result<OrderedSetEntry<TaskItemData>> {
        self.initialize().await?;
        let new_id = args.new_item_id.unwrap_or_else(|| next_id("item"));

        let (update_applied, insert_applied) = {
            let mut lists = self.lists.lock().await;
            let list = lists.get_mut(list_id).ok_or_else(|| Error::MissingItem(list_id.to_string()))?;
            let update = list.generate_update(item_id, TaskItemPatch { text: Some(args.before_text), ..Default::default() })?;
            let insert = list.generate_insert(InsertTaskArgs {
                id: new_id.clone(),
                text: args.after_text,
                done: false,
                note: String::new(),
                after: Some(item_id.to_string()),
                before: None,
                position: None,
            })?;
            (update, insert)
        };

        self.finish_list_mutation(list_id, vec![update_applied, insert_applied], false).await;
        self.lists.lock().await.get(list_id).and_then(|l| l.get_item(&new_id).cloned()).ok_or(Error::MissingItem(new_id))
    }

    /// `(update prev, remove current)` (spec §4.7).
    pub async fn merge_task(&self, list_id: &str, prev_id: &str, current_id: &str, merged_text: String) -> Result<()> {
        self.initialize().await?;
        let (update_applied, remove_applied) = {
            let mut lists = self.lists.lock().await;
            let list = lists.get_mut(list_id).ok_or_else(|| Error::MissingItem(list_id.to_string()))?;
            let update = list.generate_update(prev_id, TaskItemPatch { text: Some(merged_text), ..Default::default() })?;
            let remove = list.generate_remove(current_id)?;
            (update, remove)
        };
        self.finish_list_mutation(list_id, vec![update_applied, remove_applied], false).await;
        Ok(())
    }

    // ---- queries ------------------------------------------------------

    pub async fn get_registry_snapshot(&self) -> Result<Vec<OrderedSetEntry<ListMeta>>> {
        self.initialize().await?;
        Ok(self.registry.lock().await.get_snapshot())
    }

    pub async fn get_list_state(&self, list_id: &str) -> Result<Option<TaskListState>> {
        self.initialize().await?;
        Ok(self.lists.lock().await.get(list_id).map(|l| l.get_state()))
    }

    pub async fn get_list_snapshot(&self, list_id: &str) -> Result<Option<Vec<OrderedSetEntry<TaskItemData>>>> {
        Ok(self.get_list_state(list_id).await?.map(|s| s.entries))
    }

    pub async fn get_task_snapshot(&self, list_id: &str, item_id: &str) -> Result<Option<OrderedSetEntry<TaskItemData>>> {
        self.initialize().await?;
        Ok(self.lists.lock().await.get(list_id).and_then(|l| l.get_item(item_id).cloned()))
    }

    pub async fn export_snapshot_data(&self, exported_at: String, app_version: Option<String>) -> Result<ExportSnapshot> {
        self.initialize().await?;
        let registry = self.registry.lock().await;
        let lists = self.lists.lock().await;
        Ok(snapshot::export_snapshot(&registry, &lists, exported_at, app_version))
    }

    /// Replaces all in-memory and persisted state with a parsed snapshot.
    /// When `publish_snapshot` is set, also pushes the replacement upstream
    /// via the attached sync engine's `resetWithSnapshot` (spec §6.3,
    /// §4.8 "Reset").
    pub async fn replace_with_snapshot(&self, parsed: &ExportSnapshot, publish_snapshot: bool) -> Result<()> {
        self.initialize().await?;
        let (registry, lists) = snapshot::build_from_snapshot(parsed).await?;
        *self.registry.lock().await = registry;
        *self.lists.lock().await = lists;

        let registry_state = self.registry.lock().await.export_state();
        if let Ok(snap) = serde_json::to_value(&registry_state) {
            if let Err(e) = self.storage.persist_registry(Vec::new(), snap).await {
                tracing::warn!(error = %e, "failed to persist registry after snapshot replace");
            }
        }

        let list_ids: Vec<String> = self.lists.lock().await.keys().cloned().collect();
        for list_id in &list_ids {
            let state = self.lists.lock().await.get(list_id).map(|l| l.export_state());
            if let Some(state) = state {
                if let Ok(snap) = serde_json::to_value(&state) {
                    if let Err(e) = self.storage.persist_operations(list_id, Vec::new(), snap).await {
                        tracing::warn!(error = %e, list_id, "failed to persist list after snapshot replace");
                    }
                }
            }
        }

        self.emit(Scope::Registry, "registry").await;
        for list_id in &list_ids {
            self.emit(Scope::List, list_id).await;
        }

        if publish_snapshot {
            if let Some(engine) = self.sync.read().await.clone() {
                match serde_json::to_string(parsed) {
                    Ok(text) => {
                        if let Err(e) = engine.reset_with_snapshot(text).await {
                            tracing::warn!(error = %e, "failed to publish snapshot reset to sync engine");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to serialize snapshot for reset"),
                }
            }
        }
        Ok(())
    }

    // ---- observation ----------------------------------------------------

    pub async fn subscribe(&self, handler: ChangeHandler) {
        self.global_listeners.write().await.push(handler);
    }

    pub async fn subscribe_registry(&self, handler: RegistryHandler, emit_current: bool) {
        if emit_current {
            let snapshot = self.registry.lock().await.get_snapshot();
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&snapshot)));
        }
        self.registry_listeners.write().await.push(handler);
    }

    pub async fn subscribe_list(&self, list_id: &str, handler: ListHandler, emit_current: bool) {
        if emit_current {
            if let Some(state) = self.lists.lock().await.get(list_id).map(|l| l.get_state()) {
                let _ = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&state)));
            }
        }
        self.list_listeners.write().await.entry(list_id.to_string()).or_default().push(handler);
    }
}

#[async_trait]
impl SyncHost for Repository {
    /// Groups ops by `(scope, resourceId)`, applies them under the
    /// history-suppression counter, then persists and emits per resource
    /// without re-queuing them for sync (spec §4.7).
    async fn apply_remote_ops(&self, ops: Vec<SyncOp>) -> Result<()> {
        self.initialize().await?;
        self.history_suppressed.fetch_add(1, Ordering::SeqCst);

        let mut by_list: HashMap<String, Vec<AppliedTaskListOp>> = HashMap::new();
        let mut registry_ops: Vec<AppliedRegistryOp> = Vec::new();
        let mut first_err = None;

        for op in ops {
            let applied = match op.scope {
                Scope::Registry => {
                    let crdt_op: CrdtOp<ListMeta> = match serde_json::from_value(op.payload) {
                        Ok(op) => op,
                        Err(e) => {
                            first_err.get_or_insert(Error::storage(format!("decoding registry payload: {e}")));
                            continue;
                        }
                    };
                    let applied = Applied { actor: op.actor, clock: op.clock, op: crdt_op };
                    if let Err(e) = self.registry.lock().await.apply_operation(applied.clone()).await {
                        first_err.get_or_insert(e);
                        continue;
                    }
                    registry_ops.push(applied);
                    None::<(String, AppliedTaskListOp)>
                }
                Scope::List => {
                    let list_op: TaskListOp = match serde_json::from_value(op.payload) {
                        Ok(op) => op,
                        Err(e) => {
                            first_err.get_or_insert(Error::storage(format!("decoding list payload: {e}")));
                            continue;
                        }
                    };
                    let applied = AppliedTaskListOp { actor: op.actor, clock: op.clock, op: list_op };
                    let apply_result = {
                        let mut lists = self.lists.lock().await;
                        let list = lists.entry(op.resource_id.clone()).or_insert_with(|| TaskListCrdt::new(self.actor.clone()));
                        list.apply_operation(applied.clone())
                    };
                    if let Err(e) = apply_result {
                        first_err.get_or_insert(e);
                        continue;
                    }
                    Some((op.resource_id, applied))
                }
            };
            if let Some((list_id, applied)) = applied {
                by_list.entry(list_id).or_default().push(applied);
            }
        }

        if !registry_ops.is_empty() {
            self.finish_registry_mutation(registry_ops, true).await;
        }
        for (list_id, ops) in by_list {
            self.finish_list_mutation(&list_id, ops, true).await;
        }

        self.history_suppressed.fetch_sub(1, Ordering::SeqCst);
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn apply_snapshot_blob(&self, snapshot_text: &str) -> Result<()> {
        let parsed = snapshot::parse(snapshot_text)?;
        self.replace_with_snapshot(&parsed, false).await
    }
}
