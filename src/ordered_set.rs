//! Generic ordered-set CRDT (spec §3, §4.3).
//!
//! Specialisations ([`crate::task_list::TaskListCrdt`],
//! [`crate::registry::RegistryCrdt`]) wrap an [`OrderedSetCrdt<D>`] the way
//! the teacher crate's `Manager` wraps per-model CRDT tables: one generic
//! engine, thin domain-specific facades on top.

use crate::clock::{ActorId, LamportClock};
use crate::error::{Error, Result};
use crate::position::{self, Between, Position};
use once_cell::sync::OnceCell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;

/// Sealed payload contract for an [`OrderedSetCrdt`]'s record data.
/// `Patch` is the partial-update shape accepted by `generateUpdate`/`update`;
/// `apply_patch` implements the "shallow last-writer-wins per field" rule
/// and returns `true` if applying it actually changed the record.
/// `full_patch` expresses "every field present", used when an `insert` on
/// an already-live record needs to merge a freshly supplied `D` in whole.
pub trait CrdtData: Clone + PartialEq + std::fmt::Debug + Default {
    type Patch: Clone + std::fmt::Debug;

    fn apply_patch(&mut self, patch: &Self::Patch) -> bool;
    fn full_patch(&self) -> Self::Patch;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OrderedSetEntry<D> {
    pub id: String,
    pub pos: Position,
    pub data: D,
    pub created_at: u64,
    pub updated_at: u64,
    pub deleted_at: Option<u64>,
}

impl<D> OrderedSetEntry<D> {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// The op a generator emits / an applier dispatches (spec §4.3). Carries no
/// actor/clock of its own — those live on the enclosing envelope
/// ([`Applied`] / [`crate::sync_op::SyncOp`]).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum CrdtOp<D: CrdtData> {
    Insert { id: String, pos: Position, data: D },
    Update { id: String, patch: D::Patch },
    Move { id: String, pos: Position },
    Remove { id: String },
}

/// An op plus the `(actor, clock)` pair that identifies it (spec invariant 4).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Applied<D: CrdtData> {
    pub actor: ActorId,
    pub clock: u64,
    pub op: CrdtOp<D>,
}

/// Result of a local generator call: the op that was produced, alongside
/// the resulting full snapshot for convenience.
pub struct Generated<D: CrdtData> {
    pub op: Applied<D>,
    pub snapshot: Vec<OrderedSetEntry<D>>,
}

pub struct InsertArgs<D: CrdtData> {
    pub id: String,
    pub data: D,
    pub after: Option<String>,
    pub before: Option<String>,
    pub position: Option<Position>,
}

pub struct MoveArgs {
    pub id: String,
    pub after: Option<String>,
    pub before: Option<String>,
    pub position: Option<Position>,
}

pub struct OrderedSetCrdt<D: CrdtData> {
    actor: ActorId,
    clock: LamportClock,
    entries: HashMap<String, OrderedSetEntry<D>>,
    seen: HashSet<(ActorId, u64)>,
    /// `update`/`move` ops that arrived before their target's `insert`,
    /// keyed by id, replayed once that `insert` is finally applied.
    pending: HashMap<String, Vec<Applied<D>>>,
    snapshot_cache: RefCell<OnceCell<Vec<OrderedSetEntry<D>>>>,
    snapshot_cache_all: RefCell<OnceCell<Vec<OrderedSetEntry<D>>>>,
}

impl<D: CrdtData> OrderedSetCrdt<D> {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            clock: LamportClock::new(),
            entries: HashMap::new(),
            seen: HashSet::new(),
            pending: HashMap::new(),
            snapshot_cache: RefCell::new(OnceCell::new()),
            snapshot_cache_all: RefCell::new(OnceCell::new()),
        }
    }

    pub fn clock_value(&self) -> u64 {
        self.clock.value()
    }

    /// Merges an externally-observed clock value into this CRDT's clock
    /// without touching entries or the seen-set. Used by specialisations
    /// (e.g. [`crate::task_list::TaskListCrdt`]) that keep a title register
    /// clock-synchronised with the underlying ordered set.
    pub fn merge_clock(&mut self, remote: u64) {
        self.clock.merge(remote);
    }

    fn invalidate_cache(&self) {
        self.snapshot_cache.borrow_mut().take();
        self.snapshot_cache_all.borrow_mut().take();
    }

    fn resolve_position(
        &self,
        after: Option<&str>,
        before: Option<&str>,
        explicit: Option<Position>,
    ) -> Result<Position> {
        if let Some(p) = explicit {
            return Ok(p);
        }
        let left = after.and_then(|id| self.entries.get(id)).map(|e| &e.pos);
        let right = before.and_then(|id| self.entries.get(id)).map(|e| &e.pos);
        position::between(left, right, Between::new(self.actor.clone()))
    }

    pub fn generate_insert(&mut self, args: InsertArgs<D>) -> Result<Generated<D>> {
        let pos = self.resolve_position(args.after.as_deref(), args.before.as_deref(), args.position)?;
        let clock = self.clock.tick(None);
        let op = Applied {
            actor: self.actor.clone(),
            clock,
            op: CrdtOp::Insert { id: args.id, pos, data: args.data },
        };
        self.apply_operation(op.clone())?;
        Ok(Generated { op, snapshot: self.get_snapshot(false) })
    }

    pub fn generate_update(&mut self, id: &str, patch: D::Patch) -> Result<Generated<D>> {
        match self.entries.get(id) {
            Some(e) if e.is_live() => {}
            _ => return Err(Error::MissingItem(id.to_string())),
        }
        let clock = self.clock.tick(None);
        let op = Applied {
            actor: self.actor.clone(),
            clock,
            op: CrdtOp::Update { id: id.to_string(), patch },
        };
        self.apply_operation(op.clone())?;
        Ok(Generated { op, snapshot: self.get_snapshot(false) })
    }

    pub fn generate_move(&mut self, args: MoveArgs) -> Result<Generated<D>> {
        match self.entries.get(&args.id) {
            Some(e) if e.is_live() => {}
            _ => return Err(Error::MissingItem(args.id)),
        }
        let pos = self.resolve_position(args.after.as_deref(), args.before.as_deref(), args.position)?;
        let clock = self.clock.tick(None);
        let op = Applied {
            actor: self.actor.clone(),
            clock,
            op: CrdtOp::Move { id: args.id, pos },
        };
        self.apply_operation(op.clone())?;
        Ok(Generated { op, snapshot: self.get_snapshot(false) })
    }

    pub fn generate_remove(&mut self, id: &str) -> Result<Generated<D>> {
        match self.entries.get(id) {
            Some(e) if e.is_live() => {}
            _ => return Err(Error::MissingItem(id.to_string())),
        }
        let clock = self.clock.tick(None);
        let op = Applied {
            actor: self.actor.clone(),
            clock,
            op: CrdtOp::Remove { id: id.to_string() },
        };
        self.apply_operation(op.clone())?;
        Ok(Generated { op, snapshot: self.get_snapshot(false) })
    }

    /// Idempotent apply. Returns `true` if the CRDT's visible state changed.
    /// Dedupes on `(actor, clock)` (invariant 4) and merges the local clock
    /// with `op.clock` before dispatch (invariant 3).
    pub fn apply_operation(&mut self, applied: Applied<D>) -> Result<bool> {
        let key = (applied.actor.clone(), applied.clock);
        if self.seen.contains(&key) {
            return Ok(false);
        }
        self.seen.insert(key);
        self.clock.merge(applied.clock);

        let Applied { actor, clock, op } = applied;
        let changed = match op {
            CrdtOp::Insert { id, pos, data } => self.apply_insert(id, pos, data, clock),
            CrdtOp::Update { id, patch } => self.apply_update(id, patch, clock, &actor),
            CrdtOp::Move { id, pos } => self.apply_move(id, pos, clock, &actor),
            CrdtOp::Remove { id } => self.apply_remove(&id, clock),
        };
        if changed {
            self.invalidate_cache();
        }
        Ok(changed)
    }

    /// Replays `update`/`move` ops buffered for `id` while its `insert` was
    /// still missing. No-op if nothing was buffered.
    fn replay_pending(&mut self, id: &str) -> bool {
        let Some(mut queued) = self.pending.remove(id) else { return false };
        queued.sort_by_key(|applied| applied.clock);
        let mut changed = false;
        for applied in queued {
            let Applied { actor, clock, op } = applied;
            changed |= match op {
                CrdtOp::Update { id, patch } => self.apply_update(id, patch, clock, &actor),
                CrdtOp::Move { id, pos } => self.apply_move(id, pos, clock, &actor),
                CrdtOp::Insert { .. } | CrdtOp::Remove { .. } => false,
            };
        }
        changed
    }

    fn apply_insert(&mut self, id: String, pos: Position, data: D, clock: u64) -> bool {
        let changed = if let Some(entry) = self.entries.get_mut(&id) {
            let mut changed = false;
            if entry.pos != pos && clock >= entry.updated_at {
                entry.pos = pos;
                changed = true;
            }
            if let Some(deleted_at) = entry.deleted_at {
                if clock > deleted_at {
                    entry.deleted_at = None;
                    changed = true;
                }
            }
            if entry.deleted_at.is_none() && clock > entry.updated_at {
                let patch = data.full_patch();
                if entry.data.apply_patch(&patch) {
                    changed = true;
                }
                entry.updated_at = clock;
                changed = true;
            }
            changed
        } else {
            self.entries.insert(
                id.clone(),
                OrderedSetEntry {
                    id: id.clone(),
                    pos,
                    data,
                    created_at: clock,
                    updated_at: clock,
                    deleted_at: None,
                },
            );
            true
        };
        self.replay_pending(&id) || changed
    }

    fn apply_update(&mut self, id: String, patch: D::Patch, clock: u64, actor: &ActorId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            self.pending.entry(id.clone()).or_default().push(Applied {
                actor: actor.clone(),
                clock,
                op: CrdtOp::Update { id, patch },
            });
            return false;
        };
        if !entry.is_live() || clock <= entry.updated_at {
            return false;
        }
        let before = entry.data.clone();
        entry.data.apply_patch(&patch);
        entry.updated_at = clock;
        entry.data != before
    }

    fn apply_move(&mut self, id: String, pos: Position, clock: u64, actor: &ActorId) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            self.pending.entry(id.clone()).or_default().push(Applied {
                actor: actor.clone(),
                clock,
                op: CrdtOp::Move { id, pos },
            });
            return false;
        };
        if !entry.is_live() || clock <= entry.updated_at {
            return false;
        }
        entry.pos = pos;
        entry.updated_at = clock;
        true
    }

    /// Remove for an id with no local record yet materialises a tombstone
    /// placeholder (created_at = updated_at = deleted_at = clock) so a
    /// subsequently-applied insert with a lower clock cannot resurrect it
    /// (invariant 2); a higher-clock insert still revives it normally
    /// through `apply_insert`'s existing revival check.
    fn apply_remove(&mut self, id: &str, clock: u64) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            self.entries.insert(
                id.to_string(),
                OrderedSetEntry {
                    id: id.to_string(),
                    pos: Position::new(Vec::new()),
                    data: D::default(),
                    created_at: clock,
                    updated_at: clock,
                    deleted_at: Some(clock),
                },
            );
            return true;
        };
        let should_tombstone = match entry.deleted_at {
            Some(deleted_at) => clock > deleted_at,
            None => true,
        };
        if !should_tombstone {
            return false;
        }
        entry.deleted_at = Some(clock);
        if clock > entry.updated_at {
            entry.updated_at = clock;
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<&OrderedSetEntry<D>> {
        self.entries.get(id)
    }

    /// Memoized, invalidated on every state-changing apply (spec §4.3).
    pub fn get_snapshot(&self, include_deleted: bool) -> Vec<OrderedSetEntry<D>> {
        let cache = if include_deleted { &self.snapshot_cache_all } else { &self.snapshot_cache };
        cache
            .borrow_mut()
            .get_or_init(|| {
                let mut entries: Vec<_> = self
                    .entries
                    .values()
                    .filter(|e| include_deleted || e.is_live())
                    .cloned()
                    .collect();
                entries.sort_by(|a, b| position::compare(&a.pos, &b.pos));
                entries
            })
            .clone()
    }

    pub fn export_state(&self) -> (u64, Vec<OrderedSetEntry<D>>) {
        (self.clock.value(), self.get_snapshot(true))
    }

    /// Clears state and replaces it with sanitised entries (spec §4.3).
    pub fn import_records(&mut self, clock: u64, entries: Vec<OrderedSetEntry<D>>) {
        self.entries.clear();
        self.seen.clear();
        self.pending.clear();
        for entry in entries {
            self.entries.insert(entry.id.clone(), entry);
        }
        self.clock = LamportClock::new();
        self.clock.merge(clock);
        self.invalidate_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct TestData {
        label: String,
    }

    #[derive(Debug, Clone)]
    struct TestPatch {
        label: Option<String>,
    }

    impl CrdtData for TestData {
        type Patch = TestPatch;

        fn apply_patch(&mut self, patch: &Self::Patch) -> bool {
            if let Some(label) = &patch.label {
                if *label != self.label {
                    self.label = label.clone();
                    return true;
                }
            }
            false
        }

        fn full_patch(&self) -> Self::Patch {
            TestPatch { label: Some(self.label.clone()) }
        }
    }

    fn actor(s: &str) -> ActorId {
        ActorId::new(s)
    }

    #[test]
    fn insert_then_snapshot_is_sorted_and_live_only() {
        let mut crdt = OrderedSetCrdt::<TestData>::new(actor("a"));
        crdt.generate_insert(InsertArgs {
            id: "x".into(),
            data: TestData { label: "X".into() },
            after: None,
            before: None,
            position: None,
        })
        .unwrap();
        crdt.generate_insert(InsertArgs {
            id: "y".into(),
            data: TestData { label: "Y".into() },
            after: Some("x".into()),
            before: None,
            position: None,
        })
        .unwrap();
        let snap = crdt.get_snapshot(false);
        assert_eq!(snap.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["x", "y"]);
    }

    #[test]
    fn apply_is_idempotent_on_duplicate_clock() {
        let mut crdt = OrderedSetCrdt::<TestData>::new(actor("a"));
        let generated = crdt
            .generate_insert(InsertArgs {
                id: "x".into(),
                data: TestData { label: "X".into() },
                after: None,
                before: None,
                position: None,
            })
            .unwrap();
        let changed_again = crdt.apply_operation(generated.op).unwrap();
        assert!(!changed_again);
        assert_eq!(crdt.get_snapshot(false).len(), 1);
    }

    #[test]
    fn remove_then_late_insert_revives() {
        let mut crdt = OrderedSetCrdt::<TestData>::new(actor("a"));
        let actor_id = actor("a");
        crdt.apply_operation(Applied {
            actor: actor_id.clone(),
            clock: 1,
            op: CrdtOp::Insert { id: "x".into(), pos: crate::position::between(None, None, Between::new(actor_id.clone())).unwrap(), data: TestData { label: "X".into() } },
        })
        .unwrap();
        crdt.apply_operation(Applied {
            actor: actor_id.clone(),
            clock: 2,
            op: CrdtOp::Remove { id: "x".into() },
        })
        .unwrap();
        assert!(crdt.get_snapshot(false).is_empty());
        crdt.apply_operation(Applied {
            actor: actor_id.clone(),
            clock: 3,
            op: CrdtOp::Insert { id: "x".into(), pos: crdt.get("x").unwrap().pos.clone(), data: TestData { label: "revived".into() } },
        })
        .unwrap();
        let snap = crdt.get_snapshot(false);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].data.label, "revived");
        assert!(snap[0].deleted_at.is_none());
    }

    #[test]
    fn competing_inserts_for_same_id_converge_regardless_of_order() {
        let a = actor("a");
        let b = actor("b");
        let pos1 = crate::position::between(None, None, Between::new(a.clone())).unwrap();
        let pos2 = crate::position::between(Some(&pos1), None, Between::new(b.clone())).unwrap();

        let op_low =
            Applied { actor: a, clock: 1, op: CrdtOp::Insert { id: "x".into(), pos: pos1, data: TestData { label: "first".into() } } };
        let op_high =
            Applied { actor: b, clock: 2, op: CrdtOp::Insert { id: "x".into(), pos: pos2.clone(), data: TestData { label: "second".into() } } };

        let mut forward = OrderedSetCrdt::<TestData>::new(actor("r1"));
        forward.apply_operation(op_low.clone()).unwrap();
        forward.apply_operation(op_high.clone()).unwrap();

        let mut backward = OrderedSetCrdt::<TestData>::new(actor("r2"));
        backward.apply_operation(op_high).unwrap();
        backward.apply_operation(op_low).unwrap();

        assert_eq!(forward.get("x").unwrap().pos, backward.get("x").unwrap().pos);
        assert_eq!(forward.get("x").unwrap().data.label, backward.get("x").unwrap().data.label);
        assert_eq!(forward.get("x").unwrap().pos, pos2);
        assert_eq!(forward.get("x").unwrap().data.label, "second");
    }

    #[test]
    fn update_before_insert_is_buffered_and_replayed() {
        let actor_id = actor("a");
        let mut crdt = OrderedSetCrdt::<TestData>::new(actor_id.clone());
        let pos = crate::position::between(None, None, Between::new(actor_id.clone())).unwrap();

        // update(clock=2) arrives for an id this replica has never seen.
        let changed = crdt
            .apply_operation(Applied {
                actor: actor_id.clone(),
                clock: 2,
                op: CrdtOp::Update { id: "x".into(), patch: TestPatch { label: Some("late".into()) } },
            })
            .unwrap();
        assert!(!changed);
        assert!(crdt.get("x").is_none());

        // Its insert(clock=1) lands afterwards and should still pick up the
        // buffered update.
        crdt.apply_operation(Applied {
            actor: actor_id,
            clock: 1,
            op: CrdtOp::Insert { id: "x".into(), pos, data: TestData { label: "first".into() } },
        })
        .unwrap();

        assert_eq!(crdt.get("x").unwrap().data.label, "late");
    }

    #[test]
    fn remove_before_insert_blocks_a_lower_clock_insert() {
        let actor_id = actor("a");
        let mut crdt = OrderedSetCrdt::<TestData>::new(actor_id.clone());
        let pos = crate::position::between(None, None, Between::new(actor_id.clone())).unwrap();

        crdt.apply_operation(Applied { actor: actor_id.clone(), clock: 4, op: CrdtOp::Remove { id: "y".into() } }).unwrap();
        assert!(crdt.get_snapshot(true)[0].deleted_at.is_some());

        crdt.apply_operation(Applied {
            actor: actor_id.clone(),
            clock: 2,
            op: CrdtOp::Insert { id: "y".into(), pos: pos.clone(), data: TestData { label: "stale".into() } },
        })
        .unwrap();
        assert!(crdt.get_snapshot(false).is_empty(), "clock 2 <= deletedAt 4 must not resurrect");

        crdt.apply_operation(Applied {
            actor: actor_id,
            clock: 6,
            op: CrdtOp::Insert { id: "y".into(), pos, data: TestData { label: "revived".into() } },
        })
        .unwrap();
        assert_eq!(crdt.get("y").unwrap().data.label, "revived");
    }

    #[test]
    fn missing_item_errors_on_update_remove_move() {
        let mut crdt = OrderedSetCrdt::<TestData>::new(actor("a"));
        assert!(matches!(
            crdt.generate_update("ghost", TestPatch { label: Some("x".into()) }),
            Err(Error::MissingItem(_))
        ));
        assert!(matches!(crdt.generate_remove("ghost"), Err(Error::MissingItem(_))));
    }

    #[test]
    fn export_import_round_trips() {
        let mut crdt = OrderedSetCrdt::<TestData>::new(actor("a"));
        crdt.generate_insert(InsertArgs {
            id: "x".into(),
            data: TestData { label: "X".into() },
            after: None,
            before: None,
            position: None,
        })
        .unwrap();
        let (clock, entries) = crdt.export_state();

        let mut other = OrderedSetCrdt::<TestData>::new(actor("b"));
        other.import_records(clock, entries);
        assert_eq!(other.get_snapshot(true), crdt.get_snapshot(true));
    }
}
