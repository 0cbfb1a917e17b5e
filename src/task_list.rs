//! Task list CRDT: ordered tasks plus a last-writer-wins title register
//! (spec §3 `TaskListState`, §4.4).

use crate::clock::{ActorId, LamportClock};
use crate::error::Result;
use crate::ordered_set::{Applied, CrdtData, CrdtOp, Generated, InsertArgs, MoveArgs, OrderedSetCrdt, OrderedSetEntry};
use crate::position::Position;

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct TaskItemData {
    pub text: String,
    pub done: bool,
    /// Normalised to `""` when absent (spec §9 open question: the source
    /// normalises `note` to empty string rather than modelling "unset").
    pub note: String,
}

/// `None` fields are "not supplied"; `note` additionally distinguishes
/// "explicitly cleared" (`Some(String::new())`) from "left untouched"
/// (`None`) at the call-site (see [`TaskListCrdt::generate_update`]) even
/// though the stored `TaskItemData::note` itself has no tri-state — per the
/// open question, this crate preserves the source's flagged ambiguity
/// instead of silently resolving it.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TaskItemPatch {
    pub text: Option<String>,
    pub done: Option<bool>,
    pub note: Option<String>,
}

impl CrdtData for TaskItemData {
    type Patch = TaskItemPatch;

    fn apply_patch(&mut self, patch: &Self::Patch) -> bool {
        let mut changed = false;
        if let Some(text) = &patch.text {
            if *text != self.text {
                self.text = text.clone();
                changed = true;
            }
        }
        if let Some(done) = patch.done {
            if done != self.done {
                self.done = done;
                changed = true;
            }
        }
        if let Some(note) = &patch.note {
            if *note != self.note {
                self.note = note.clone();
                changed = true;
            }
        }
        changed
    }

    fn full_patch(&self) -> Self::Patch {
        TaskItemPatch {
            text: Some(self.text.clone()),
            done: Some(self.done),
            note: Some(self.note.clone()),
        }
    }
}

/// Wire payload for a task-list op: the generic ordered-set ops plus the
/// list-scoped `renameList` (spec design note 1: a sealed, tagged variant
/// rather than an open payload bag).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum TaskListOp {
    Insert { id: String, pos: Position, data: TaskItemData },
    Update { id: String, patch: TaskItemPatch },
    Move { id: String, pos: Position },
    Remove { id: String },
    RenameList { title: String },
}

impl From<CrdtOp<TaskItemData>> for TaskListOp {
    fn from(op: CrdtOp<TaskItemData>) -> Self {
        match op {
            CrdtOp::Insert { id, pos, data } => Self::Insert { id, pos, data },
            CrdtOp::Update { id, patch } => Self::Update { id, patch },
            CrdtOp::Move { id, pos } => Self::Move { id, pos },
            CrdtOp::Remove { id } => Self::Remove { id },
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppliedTaskListOp {
    pub actor: ActorId,
    pub clock: u64,
    pub op: TaskListOp,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskListState {
    pub clock: u64,
    pub title: String,
    pub title_updated_at: u64,
    pub entries: Vec<OrderedSetEntry<TaskItemData>>,
}

pub struct InsertTaskArgs {
    pub id: String,
    pub text: String,
    pub done: bool,
    pub note: String,
    pub after: Option<String>,
    pub before: Option<String>,
    pub position: Option<Position>,
}

pub struct MoveTaskArgs {
    pub id: String,
    pub after: Option<String>,
    pub before: Option<String>,
    pub position: Option<Position>,
}

pub struct TaskListCrdt {
    actor: ActorId,
    items: OrderedSetCrdt<TaskItemData>,
    clock: LamportClock,
    title: String,
    title_updated_at: u64,
}

impl TaskListCrdt {
    pub fn new(actor: ActorId) -> Self {
        Self {
            items: OrderedSetCrdt::new(actor.clone()),
            actor,
            clock: LamportClock::new(),
            title: String::new(),
            title_updated_at: 0,
        }
    }

    fn wrap(&self, generated: Generated<TaskItemData>) -> AppliedTaskListOp {
        AppliedTaskListOp {
            actor: generated.op.actor,
            clock: generated.op.clock,
            op: generated.op.op.into(),
        }
    }

    pub fn generate_insert(&mut self, args: InsertTaskArgs) -> Result<AppliedTaskListOp> {
        let generated = self.items.generate_insert(InsertArgs {
            id: args.id,
            data: TaskItemData { text: args.text, done: args.done, note: args.note },
            after: args.after,
            before: args.before,
            position: args.position,
        })?;
        self.clock.merge(self.items.clock_value());
        Ok(self.wrap(generated))
    }

    pub fn generate_update(&mut self, id: &str, patch: TaskItemPatch) -> Result<AppliedTaskListOp> {
        let generated = self.items.generate_update(id, patch)?;
        self.clock.merge(self.items.clock_value());
        Ok(self.wrap(generated))
    }

    pub fn generate_toggle(&mut self, id: &str, explicit: Option<bool>) -> Result<AppliedTaskListOp> {
        let done = match explicit {
            Some(v) => v,
            None => !self.items.get(id).map(|e| e.data.done).unwrap_or(false),
        };
        self.generate_update(id, TaskItemPatch { done: Some(done), ..Default::default() })
    }

    pub fn generate_move(&mut self, args: MoveTaskArgs) -> Result<AppliedTaskListOp> {
        let generated = self.items.generate_move(MoveArgs {
            id: args.id,
            after: args.after,
            before: args.before,
            position: args.position,
        })?;
        self.clock.merge(self.items.clock_value());
        Ok(self.wrap(generated))
    }

    pub fn generate_remove(&mut self, id: &str) -> Result<AppliedTaskListOp> {
        let generated = self.items.generate_remove(id)?;
        self.clock.merge(self.items.clock_value());
        Ok(self.wrap(generated))
    }

    pub fn generate_rename(&mut self, title: String) -> AppliedTaskListOp {
        let clock = self.clock.tick(Some(self.items.clock_value()));
        self.items.merge_clock(clock);
        self.apply_rename(&self.actor.clone(), clock, title.clone());
        AppliedTaskListOp {
            actor: self.actor.clone(),
            clock,
            op: TaskListOp::RenameList { title },
        }
    }

    fn apply_rename(&mut self, _actor: &ActorId, clock: u64, title: String) -> bool {
        if clock > self.title_updated_at || (clock == self.title_updated_at && title > self.title) {
            self.title = title;
            self.title_updated_at = clock;
            true
        } else {
            false
        }
    }

    /// Dispatches `insert|update|remove|move` to the ordered set;
    /// `renameList` adopts the title iff `op.clock > titleUpdatedAt`, or
    /// `== titleUpdatedAt` with a lexicographically larger title
    /// (deterministic tie-break, spec §4.4).
    pub fn apply_operation(&mut self, applied: AppliedTaskListOp) -> Result<bool> {
        self.clock.merge(applied.clock);
        let changed = match applied.op {
            TaskListOp::Insert { id, pos, data } => {
                self.items.apply_operation(Applied { actor: applied.actor, clock: applied.clock, op: CrdtOp::Insert { id, pos, data } })?
            }
            TaskListOp::Update { id, patch } => {
                self.items.apply_operation(Applied { actor: applied.actor, clock: applied.clock, op: CrdtOp::Update { id, patch } })?
            }
            TaskListOp::Move { id, pos } => {
                self.items.apply_operation(Applied { actor: applied.actor, clock: applied.clock, op: CrdtOp::Move { id, pos } })?
            }
            TaskListOp::Remove { id } => {
                self.items.apply_operation(Applied { actor: applied.actor, clock: applied.clock, op: CrdtOp::Remove { id } })?
            }
            TaskListOp::RenameList { title } => {
                self.items.merge_clock(applied.clock);
                self.apply_rename(&applied.actor, applied.clock, title)
            }
        };
        Ok(changed)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn get_state(&self) -> TaskListState {
        TaskListState {
            clock: self.clock.value(),
            title: self.title.clone(),
            title_updated_at: self.title_updated_at,
            entries: self.items.get_snapshot(false),
        }
    }

    pub fn get_item(&self, id: &str) -> Option<&OrderedSetEntry<TaskItemData>> {
        self.items.get(id).filter(|e| e.is_live())
    }

    pub fn export_state(&self) -> TaskListState {
        TaskListState {
            clock: self.clock.value(),
            title: self.title.clone(),
            title_updated_at: self.title_updated_at,
            entries: self.items.get_snapshot(true),
        }
    }

    pub fn import_state(&mut self, state: TaskListState) {
        self.items.import_records(state.clock, state.entries);
        self.clock = LamportClock::new();
        self.clock.merge(state.clock);
        self.title = state.title;
        self.title_updated_at = state.title_updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(s: &str) -> ActorId {
        ActorId::new(s)
    }

    #[test]
    fn insert_and_toggle_roundtrip() {
        let mut list = TaskListCrdt::new(actor("a"));
        let insert = list
            .generate_insert(InsertTaskArgs {
                id: "t1".into(),
                text: "Buy milk".into(),
                done: false,
                note: String::new(),
                after: None,
                before: None,
                position: None,
            })
            .unwrap();
        assert!(matches!(insert.op, TaskListOp::Insert { .. }));
        list.generate_toggle("t1", None).unwrap();
        assert!(list.get_item("t1").unwrap().data.done);
    }

    #[test]
    fn rename_conflict_picks_larger_actor_on_tie() {
        // Scenario S3: two renameList ops at the same clock from different
        // actors; the lexicographically larger title wins the tie.
        let mut list = TaskListCrdt::new(actor("actor-1"));
        list.apply_operation(AppliedTaskListOp {
            actor: actor("actor-1"),
            clock: 5,
            op: TaskListOp::RenameList { title: "Alpha".into() },
        })
        .unwrap();
        list.apply_operation(AppliedTaskListOp {
            actor: actor("actor-2"),
            clock: 5,
            op: TaskListOp::RenameList { title: "Beta".into() },
        })
        .unwrap();
        assert_eq!(list.title(), "Beta");
        assert_eq!(list.get_state().title_updated_at, 5);
    }

    #[test]
    fn remove_then_reinsert_revives_with_new_text() {
        // Scenario S2.
        let actor_id = actor("a");
        let mut list = TaskListCrdt::new(actor_id.clone());
        let insert = list
            .generate_insert(InsertTaskArgs {
                id: "x".into(),
                text: "first".into(),
                done: false,
                note: String::new(),
                after: None,
                before: None,
                position: None,
            })
            .unwrap();
        let pos = match insert.op {
            TaskListOp::Insert { pos, .. } => pos,
            _ => unreachable!(),
        };
        list.apply_operation(AppliedTaskListOp { actor: actor_id.clone(), clock: 2, op: TaskListOp::Remove { id: "x".into() } }).unwrap();
        list.apply_operation(AppliedTaskListOp {
            actor: actor_id,
            clock: 3,
            op: TaskListOp::Insert { id: "x".into(), pos, data: TaskItemData { text: "X".into(), done: false, note: String::new() } },
        })
        .unwrap();
        let item = list.get_item("x").unwrap();
        assert_eq!(item.data.text, "X");
        assert!(item.deleted_at.is_none());
    }
}
