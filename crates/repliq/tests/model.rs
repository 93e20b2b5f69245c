//! Integration tests for model replication between two nodes.

mod common;

use common::*;
use repliq::prelude::*;
use repliq::{IndexPath, ModelHandle, Orientation};

fn names(rows: u32) -> StandardModel {
    let mut model = StandardModel::new(1).with_headers(["name"]);
    let data = (0..rows).map(|i| vec![Value::from(format!("item {i}"))]).collect();
    model.insert_rows(&IndexPath::root(), 0, data);
    model
}

async fn setup(model: StandardModel, config: CacheConfig) -> (Node, ModelHandle<StandardModel>, Node, ModelReplica) {
    let (host, url) = listening_node().await;
    let handle = host
        .enable_model_remoting("names", model)
        .await
        .expect("should enable model");
    let client = Node::new();
    client.connect_to_node(&url).await.expect("should connect");
    let replica = client.acquire_model("names", config);
    within(replica.wait_ready()).await;
    (host, handle, client, replica)
}

#[tokio::test]
async fn test_model_replica_becomes_ready() {
    let (_host, _handle, _client, replica) = setup(names(50), CacheConfig::default()).await;

    assert!(replica.is_ready());
    assert_eq!(replica.row_count(replica.root()), 50);
    assert_eq!(replica.column_count(replica.root()), 1);
    assert_eq!(
        replica.header_data(0, Orientation::Horizontal, Role::DISPLAY),
        Value::from("name")
    );
}

#[tokio::test]
async fn test_data_is_fetched_lazily() {
    let (_host, _handle, _client, replica) = setup(names(50), CacheConfig::default()).await;
    let mut events = replica.subscribe();

    assert_eq!(replica.fetch(10, 0, Role::DISPLAY), Value::Null);
    next_event(&mut events, |e| matches!(e, ModelEvent::DataChanged { .. })).await;

    assert_eq!(replica.fetch(10, 0, Role::DISPLAY), Value::from("item 10"));
    let index = replica.index(replica.root(), 10, 0).expect("row 10");
    assert!(replica.is_cached(index, Role::DISPLAY));
}

#[tokio::test]
async fn test_prefetched_rows_are_cached_at_ready() {
    let config = CacheConfig::default().with_prefetch(5);
    let (_host, _handle, _client, replica) = setup(names(20), config).await;

    assert_eq!(replica.fetch(4, 0, Role::DISPLAY), Value::from("item 4"));
    assert!(replica.cached_rows() >= 5);
}

#[tokio::test]
async fn test_root_cache_is_bounded() {
    let config = CacheConfig::default().with_root_cache_size(10);
    let (_host, _handle, _client, replica) = setup(names(100), config).await;

    for row in 0..40 {
        replica.fetch(row, 0, Role::DISPLAY);
    }
    eventually(|| replica.fetch(39, 0, Role::DISPLAY) == Value::from("item 39")).await;

    assert!(replica.cached_rows() <= 10);
    // Structure survives eviction.
    assert_eq!(replica.row_count(replica.root()), 100);
    assert!(replica.index(replica.root(), 0, 0).is_some());
}

#[tokio::test]
async fn test_source_edits_reach_replica() {
    let (_host, handle, _client, replica) = setup(names(5), CacheConfig::default()).await;
    replica.fetch(2, 0, Role::DISPLAY);
    eventually(|| replica.fetch(2, 0, Role::DISPLAY) == Value::from("item 2")).await;
    let tracked = replica.index(replica.root(), 2, 0).expect("row 2");
    let mut events = replica.subscribe();

    handle
        .update(|model| {
            model.remove_rows(&IndexPath::root(), 0, 1);
            model.set_item_data(&IndexPath::root().child(1, 0), Role::DISPLAY, "renamed".into())
        })
        .await
        .expect("update");

    next_event(&mut events, |e| matches!(e, ModelEvent::RowsRemoved { .. })).await;
    eventually(|| replica.data(tracked, Role::DISPLAY) == Value::from("renamed")).await;
    assert_eq!(replica.row_of(tracked.node), Some(1));
    assert_eq!(replica.row_count(replica.root()), 4);
}

#[tokio::test]
async fn test_replica_write_round_trips_through_source() {
    let (_host, _handle, _client, replica) = setup(names(3), CacheConfig::default()).await;
    replica.fetch(0, 0, Role::DISPLAY);
    eventually(|| replica.fetch(0, 0, Role::DISPLAY) == Value::from("item 0")).await;
    let index = replica.index(replica.root(), 0, 0).expect("row 0");

    replica.set_data(index, Role::DISPLAY, "edited".into()).expect("editable");

    eventually(|| replica.data(index, Role::DISPLAY) == Value::from("edited")).await;
}

#[tokio::test]
async fn test_tree_children_are_discovered() {
    let mut model = names(2);
    model.append_row(&IndexPath::root().child(1, 0), vec!["child a".into()]);
    model.append_row(&IndexPath::root().child(1, 0), vec!["child b".into()]);
    let (_host, _handle, _client, replica) = setup(model, CacheConfig::default()).await;

    replica.fetch(1, 0, Role::DISPLAY);
    eventually(|| replica.fetch(1, 0, Role::DISPLAY) == Value::from("item 1")).await;
    let parent = replica.index(replica.root(), 1, 0).expect("row 1").node;
    assert!(replica.has_children(parent));

    eventually(|| replica.row_count(parent) == 2).await;
    let child = replica.index(parent, 1, 0).expect("child row");
    assert_eq!(replica.parent(child.node), Some(parent));
    eventually(|| replica.data(child, Role::DISPLAY) == Value::from("child b")).await;
}

#[tokio::test]
async fn test_model_replica_reinitializes_after_host_returns() {
    let (host, handle, _client, replica) = setup(names(3), CacheConfig::default()).await;

    assert!(handle.disable().await.expect("disable"));
    eventually(|| !replica.is_ready()).await;

    let _handle = host
        .enable_model_remoting("names", names(7))
        .await
        .expect("re-enable");
    within(replica.wait_ready()).await;
    assert_eq!(replica.row_count(replica.root()), 7);
}

#[tokio::test]
async fn test_model_and_object_names_share_one_namespace() {
    let (host, _url) = listening_node().await;
    let _model = host.enable_model_remoting("shared", names(1)).await.expect("model");
    let object = host.enable_remoting("shared", Counter::new(0)).await;
    assert!(matches!(object, Err(RepliqError::DuplicateName(_))));
}
