//! Repository-level scenarios exercising the mutating API, remote-op
//! application, outbox durability, and dataset-reset isolation end to end
//! against [`MemoryStorage`] and [`MockTransport`].

use std::sync::Arc;
use tasklist_sync_core::clock::ActorId;
use tasklist_sync_core::position::{between, Between};
use tasklist_sync_core::repository::{CreateListArgs, InitialTaskItem, InsertTaskCall, PlacementArgs, Repository, SplitTaskArgs};
use tasklist_sync_core::storage::MemoryStorage;
use tasklist_sync_core::sync::{MockTransport, SyncConfig, SyncHost};
use tasklist_sync_core::sync_op::{Scope, SyncOp};
use tasklist_sync_core::task_list::TaskListOp;

#[tokio::test]
async fn create_insert_toggle_and_reorder_roundtrip() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage, ActorId::new("actor-1"));
    repo.initialize().await.unwrap();

    let list = repo.create_list(CreateListArgs { title: Some("Groceries".into()), ..Default::default() }).await.unwrap();
    let item = repo.insert_task(&list.id, InsertTaskCall { text: "Milk".into(), ..Default::default() }).await.unwrap();
    repo.toggle_task(&list.id, &item.id, None).await.unwrap();

    let state = repo.get_list_state(&list.id).await.unwrap().unwrap();
    assert_eq!(state.entries.len(), 1);
    assert!(state.entries[0].data.done);

    repo.rename_list(&list.id, "Shopping".into()).await.unwrap();
    let registry = repo.get_registry_snapshot().await.unwrap();
    assert_eq!(registry[0].data.title, "Shopping");
}

#[tokio::test]
async fn create_list_seeds_initial_items_in_document_order() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage, ActorId::new("actor-1"));

    let list = repo
        .create_list(CreateListArgs {
            title: Some("Groceries".into()),
            items: vec![
                InitialTaskItem { text: "Milk".into(), ..Default::default() },
                InitialTaskItem { text: "Eggs".into(), done: true, ..Default::default() },
            ],
            ..Default::default()
        })
        .await
        .unwrap();

    let state = repo.get_list_state(&list.id).await.unwrap().unwrap();
    assert_eq!(state.entries.iter().map(|e| e.data.text.as_str()).collect::<Vec<_>>(), vec!["Milk", "Eggs"]);
    assert!(state.entries[1].data.done);
}

#[tokio::test]
async fn an_empty_list_survives_a_restart() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage.clone(), ActorId::new("actor-1"));
    let list = repo.create_list(CreateListArgs { title: Some("Empty".into()), ..Default::default() }).await.unwrap();

    // A fresh repository over the same storage must rehydrate the list
    // even though it never had any items inserted into it.
    let restarted = Repository::new(storage, ActorId::new("actor-1"));
    let state = restarted.get_list_state(&list.id).await.unwrap();
    assert!(state.is_some(), "empty list snapshot must be persisted at creation time");
    assert!(state.unwrap().entries.is_empty());
}

#[tokio::test]
async fn moves_a_task_between_lists_and_persists_both() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage, ActorId::new("actor-1"));
    let list_a = repo.create_list(CreateListArgs { title: Some("A".into()), ..Default::default() }).await.unwrap();
    let list_b = repo.create_list(CreateListArgs { title: Some("B".into()), ..Default::default() }).await.unwrap();
    let item = repo.insert_task(&list_a.id, InsertTaskCall { text: "Task".into(), ..Default::default() }).await.unwrap();

    repo.move_task(&list_a.id, &list_b.id, &item.id, PlacementArgs::default()).await.unwrap();

    assert!(repo.get_task_snapshot(&list_a.id, &item.id).await.unwrap().is_none());
    let moved = repo.get_task_snapshot(&list_b.id, &item.id).await.unwrap().unwrap();
    assert_eq!(moved.data.text, "Task");
}

#[tokio::test]
async fn splits_a_task_then_merges_it_back() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage, ActorId::new("actor-1"));
    let list = repo.create_list(CreateListArgs::default()).await.unwrap();
    let item = repo.insert_task(&list.id, InsertTaskCall { text: "Buy milk and eggs".into(), ..Default::default() }).await.unwrap();

    let new_item = repo
        .split_task(&list.id, &item.id, SplitTaskArgs { before_text: "Buy milk".into(), after_text: "Buy eggs".into(), new_item_id: None })
        .await
        .unwrap();

    let state = repo.get_list_state(&list.id).await.unwrap().unwrap();
    assert_eq!(state.entries.len(), 2);
    assert_eq!(state.entries[0].data.text, "Buy milk");

    repo.merge_task(&list.id, &item.id, &new_item.id, "Buy milk and eggs".into()).await.unwrap();
    let state = repo.get_list_state(&list.id).await.unwrap().unwrap();
    assert_eq!(state.entries.len(), 1);
    assert_eq!(state.entries[0].data.text, "Buy milk and eggs");
}

#[tokio::test]
async fn applies_remote_ops_without_requeueing_them_for_sync() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage.clone(), ActorId::new("actor-1"));
    repo.initialize().await.unwrap();

    let pos = between(None, None, Between::new(ActorId::new("actor-remote"))).unwrap();
    let payload = serde_json::to_value(&TaskListOp::Insert {
        id: "i1".into(),
        pos,
        data: tasklist_sync_core::task_list::TaskItemData { text: "From peer".into(), done: false, note: String::new() },
    })
    .unwrap();

    let remote_op =
        SyncOp { scope: Scope::List, resource_id: "remote-list".into(), actor: ActorId::new("actor-remote"), clock: 1, payload, server_seq: Some(1) };

    repo.apply_remote_ops(vec![remote_op]).await.unwrap();

    let state = repo.get_list_state("remote-list").await.unwrap().unwrap();
    assert_eq!(state.entries[0].data.text, "From peer");

    let outbox = storage.load_outbox().await.unwrap();
    assert!(outbox.is_empty(), "remote ops must not be re-queued for sync");
}

#[tokio::test]
async fn outbox_durability_local_mutations_survive_without_a_sync_engine() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage.clone(), ActorId::new("actor-1"));
    repo.create_list(CreateListArgs { title: Some("Errands".into()), ..Default::default() }).await.unwrap();

    let outbox = storage.load_outbox().await.unwrap();
    assert_eq!(outbox.len(), 1, "local mutations append directly to the durable outbox when sync is not attached");
}

#[tokio::test]
async fn dataset_reset_conflict_adopts_server_snapshot_and_clears_outbox() {
    let storage = Arc::new(MemoryStorage::new());
    let repo = Repository::new(storage.clone(), ActorId::new("actor-1"));

    let transport = Arc::new(MockTransport::new());
    transport.push_response(200, serde_json::json!({"datasetGenerationKey": "gen-0", "serverSeq": 0, "ops": []})).await;
    let engine = repo.attach_sync_engine(transport.clone(), SyncConfig::new("client-1")).await.unwrap();

    engine.sync_once().await.unwrap();

    repo.create_list(CreateListArgs { title: Some("Local list".into()), ..Default::default() }).await.unwrap();
    assert_eq!(storage.load_outbox().await.unwrap().len(), 1);

    let server_snapshot = serde_json::json!({
        "schema": "net.aggregat4.tasklist.snapshot@v1",
        "exportedAt": "2024-01-01T00:00:00Z",
        "data": { "lists": [ { "listId": "server-list", "title": "Server List", "items": [
            { "id": "i1", "text": "From server", "done": false }
        ] } ] }
    })
    .to_string();
    transport.push_response(409, serde_json::json!({"datasetGenerationKey": "gen-1", "snapshot": server_snapshot})).await;

    engine.sync_once().await.unwrap();

    assert!(storage.load_outbox().await.unwrap().is_empty(), "outbox must be cleared after adopting the server's snapshot");
    let cursor = storage.load_sync_state().await.unwrap().unwrap();
    assert_eq!(cursor.dataset_generation_key, "gen-1");

    let registry = repo.get_registry_snapshot().await.unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(registry[0].id, "server-list");
    let list_state = repo.get_list_state("server-list").await.unwrap().unwrap();
    assert_eq!(list_state.entries[0].data.text, "From server");
}
