//! Universal CRDT properties (spec §8): convergence under reordering,
//! idempotence, tombstone monotonicity, and snapshot round-trip.

use tasklist_sync_core::clock::ActorId;
use tasklist_sync_core::task_list::{AppliedTaskListOp, InsertTaskArgs, TaskItemPatch, TaskListCrdt};

fn build_ops() -> Vec<AppliedTaskListOp> {
    let mut seed = TaskListCrdt::new(ActorId::new("seed"));
    vec![
        seed.generate_insert(InsertTaskArgs { id: "a".into(), text: "A".into(), done: false, note: String::new(), after: None, before: None, position: None })
            .unwrap(),
        seed.generate_insert(InsertTaskArgs {
            id: "b".into(),
            text: "B".into(),
            done: false,
            note: String::new(),
            after: Some("a".into()),
            before: None,
            position: None,
        })
        .unwrap(),
        seed.generate_update("a", TaskItemPatch { done: Some(true), ..Default::default() }).unwrap(),
        seed.generate_remove("b").unwrap(),
    ]
}

#[test]
fn property_1_convergence_under_reordering() {
    let ops = build_ops();

    let mut forward = TaskListCrdt::new(ActorId::new("r1"));
    for op in ops.clone() {
        forward.apply_operation(op).unwrap();
    }

    let mut reversed = ops.clone();
    reversed.reverse();
    let mut backward = TaskListCrdt::new(ActorId::new("r2"));
    for op in reversed {
        backward.apply_operation(op).unwrap();
    }

    assert_eq!(forward.get_state().entries, backward.get_state().entries);
}

#[test]
fn property_2_idempotence_on_duplicate_delivery() {
    let ops = build_ops();
    let mut replica = TaskListCrdt::new(ActorId::new("r1"));
    for op in &ops {
        replica.apply_operation(op.clone()).unwrap();
    }
    let once = replica.get_state().entries;

    // Redeliver the whole batch a second time (e.g. retried push/pull).
    for op in ops {
        replica.apply_operation(op).unwrap();
    }
    assert_eq!(replica.get_state().entries, once);
}

#[test]
fn property_3_tombstone_only_revives_on_a_strictly_newer_clock() {
    let actor = ActorId::new("a");
    let mut replica = TaskListCrdt::new(actor.clone());
    let insert = replica
        .generate_insert(InsertTaskArgs { id: "x".into(), text: "first".into(), done: false, note: String::new(), after: None, before: None, position: None })
        .unwrap();
    let pos = match insert.op {
        tasklist_sync_core::task_list::TaskListOp::Insert { pos, .. } => pos,
        _ => unreachable!(),
    };

    replica
        .apply_operation(AppliedTaskListOp { actor: actor.clone(), clock: 5, op: tasklist_sync_core::task_list::TaskListOp::Remove { id: "x".into() } })
        .unwrap();

    // A stale insert (clock <= deletedAt) must not revive the tombstone.
    replica
        .apply_operation(AppliedTaskListOp {
            actor: actor.clone(),
            clock: 5,
            op: tasklist_sync_core::task_list::TaskListOp::Insert {
                id: "x".into(),
                pos: pos.clone(),
                data: tasklist_sync_core::task_list::TaskItemData { text: "stale".into(), done: false, note: String::new() },
            },
        })
        .unwrap();
    assert!(replica.get_item("x").is_none());

    // A fresher insert (clock > deletedAt) revives it.
    replica
        .apply_operation(AppliedTaskListOp {
            actor,
            clock: 6,
            op: tasklist_sync_core::task_list::TaskListOp::Insert {
                id: "x".into(),
                pos,
                data: tasklist_sync_core::task_list::TaskItemData { text: "revived".into(), done: false, note: String::new() },
            },
        })
        .unwrap();
    assert_eq!(replica.get_item("x").unwrap().data.text, "revived");
}

#[test]
fn property_6_snapshot_round_trip_preserves_observable_state() {
    let ops = build_ops();
    let mut replica = TaskListCrdt::new(ActorId::new("r1"));
    for op in ops {
        replica.apply_operation(op).unwrap();
    }
    let before = replica.get_state().entries;

    let exported = replica.export_state();
    let mut rebuilt = TaskListCrdt::new(ActorId::new("r2"));
    rebuilt.import_state(exported);

    assert_eq!(rebuilt.get_state().entries, before);
}
