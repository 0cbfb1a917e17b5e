//! Registry CRDT: ordered catalogue of lists (spec §3 `RegistryState`, §4.5).

use crate::clock::ActorId;
use crate::error::Result;
use crate::ordered_set::{Applied, CrdtData, CrdtOp, InsertArgs, MoveArgs, OrderedSetCrdt, OrderedSetEntry};
use crate::position::Position;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct ListMeta {
    pub title: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ListMetaPatch {
    pub title: Option<String>,
}

impl CrdtData for ListMeta {
    type Patch = ListMetaPatch;

    fn apply_patch(&mut self, patch: &Self::Patch) -> bool {
        if let Some(title) = &patch.title {
            if *title != self.title {
                self.title = title.clone();
                return true;
            }
        }
        false
    }

    fn full_patch(&self) -> Self::Patch {
        ListMetaPatch { title: Some(self.title.clone()) }
    }
}

pub type RegistryOp = CrdtOp<ListMeta>;
pub type AppliedRegistryOp = Applied<ListMeta>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegistryState {
    pub clock: u64,
    pub entries: Vec<OrderedSetEntry<ListMeta>>,
}

type Handler = Box<dyn Fn(&[OrderedSetEntry<ListMeta>]) + Send + Sync>;

/// Ordered catalogue of lists. `subscribe` is supported directly (spec
/// §4.5: "the registry drives sidebar updates directly").
pub struct RegistryCrdt {
    entries: OrderedSetCrdt<ListMeta>,
    listeners: Arc<RwLock<Vec<Handler>>>,
}

impl RegistryCrdt {
    pub fn new(actor: ActorId) -> Self {
        Self {
            entries: OrderedSetCrdt::new(actor),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn subscribe(&self, handler: Handler) {
        self.listeners.write().await.push(handler);
    }

    async fn notify(&self) {
        let snapshot = self.entries.get_snapshot(false);
        for handler in self.listeners.read().await.iter() {
            handler(&snapshot);
        }
    }

    pub async fn generate_create(&mut self, list_id: String, title: String, after: Option<String>, before: Option<String>, position: Option<Position>) -> Result<AppliedRegistryOp> {
        let generated = self.entries.generate_insert(InsertArgs {
            id: list_id,
            data: ListMeta { title },
            after,
            before,
            position,
        })?;
        self.notify().await;
        Ok(generated.op)
    }

    pub async fn generate_remove(&mut self, list_id: &str) -> Result<AppliedRegistryOp> {
        let generated = self.entries.generate_remove(list_id)?;
        self.notify().await;
        Ok(generated.op)
    }

    pub async fn generate_rename(&mut self, list_id: &str, title: String) -> Result<AppliedRegistryOp> {
        let generated = self.entries.generate_update(list_id, ListMetaPatch { title: Some(title) })?;
        self.notify().await;
        Ok(generated.op)
    }

    pub async fn generate_reorder(&mut self, list_id: String, after: Option<String>, before: Option<String>, position: Option<Position>) -> Result<AppliedRegistryOp> {
        let generated = self.entries.generate_move(MoveArgs { id: list_id, after, before, position })?;
        self.notify().await;
        Ok(generated.op)
    }

    pub async fn apply_operation(&mut self, op: AppliedRegistryOp) -> Result<bool> {
        let changed = self.entries.apply_operation(op)?;
        if changed {
            self.notify().await;
        }
        Ok(changed)
    }

    pub fn get_snapshot(&self) -> Vec<OrderedSetEntry<ListMeta>> {
        self.entries.get_snapshot(false)
    }

    pub fn get_state(&self) -> RegistryState {
        RegistryState { clock: self.entries.clock_value(), entries: self.entries.get_snapshot(false) }
    }

    pub fn export_state(&self) -> RegistryState {
        let (clock, entries) = self.entries.export_state();
        RegistryState { clock, entries }
    }

    pub fn import_state(&mut self, state: RegistryState) {
        self.entries.import_records(state.clock, state.entries);
    }

    pub fn contains(&self, list_id: &str) -> bool {
        self.entries.get(list_id).map(|e| e.is_live()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_rename_reorder_remove() {
        let mut registry = RegistryCrdt::new(ActorId::new("a"));
        registry.generate_create("l1".into(), "Groceries".into(), None, None, None).await.unwrap();
        registry.generate_create("l2".into(), "Chores".into(), Some("l1".into()), None, None).await.unwrap();
        assert_eq!(registry.get_snapshot().iter().map(|e| e.id.clone()).collect::<Vec<_>>(), vec!["l1", "l2"]);

        registry.generate_rename("l1", "Shopping".into()).await.unwrap();
        assert_eq!(registry.get_snapshot()[0].data.title, "Shopping");

        registry.generate_reorder("l2".into(), None, Some("l1".into()), None).await.unwrap();
        assert_eq!(registry.get_snapshot().iter().map(|e| e.id.clone()).collect::<Vec<_>>(), vec!["l2", "l1"]);

        registry.generate_remove("l2").await.unwrap();
        assert_eq!(registry.get_snapshot().iter().map(|e| e.id.clone()).collect::<Vec<_>>(), vec!["l1"]);
    }

    #[tokio::test]
    async fn subscribers_are_notified_on_change() {
        let mut registry = RegistryCrdt::new(ActorId::new("a"));
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        registry
            .subscribe(Box::new(move |_| {
                count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }))
            .await;
        registry.generate_create("l1".into(), "A".into(), None, None, None).await.unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
