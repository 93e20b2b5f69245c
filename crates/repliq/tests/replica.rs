//! Integration tests for sources and replicas over loopback TCP.

mod common;

use std::sync::Arc;

use common::*;
use repliq::prelude::*;
use repliq::{MemoryStore, PersistedStore, SourceHandle};

/// Hosts a counter and returns the host, its handle and a connected client.
async fn setup(count: i64) -> (Node, SourceHandle<Counter>, Node) {
    let (host, url) = listening_node().await;
    let handle = host
        .enable_remoting("counter", Counter::new(count))
        .await
        .expect("should enable remoting");
    let client = Node::new();
    client.connect_to_node(&url).await.expect("should connect");
    (host, handle, client)
}

async fn valid_replica(client: &Node) -> Replica {
    let replica = client.acquire("counter", Counter::api());
    assert_eq!(within(replica.wait_for_source()).await, ReplicaState::Valid);
    replica
}

#[tokio::test]
async fn test_replica_receives_snapshot() {
    let (_host, _handle, client) = setup(3).await;
    let replica = valid_replica(&client).await;

    assert!(replica.is_initialized());
    assert!(!replica.is_dynamic());
    assert_eq!(replica.property(COUNT), Value::Int(3));
    assert_eq!(replica.property_by_name("label"), Value::from("counter"));
    assert_eq!(replica.property(ID), Value::UInt(7));
}

#[tokio::test]
async fn test_replica_starts_uninitialized_with_defaults() {
    let client = Node::new();
    let replica = client.acquire("nowhere", Counter::api());

    assert_eq!(replica.state(), ReplicaState::Uninitialized);
    assert!(!replica.is_initialized());
    assert_eq!(replica.property(COUNT), Value::Int(0));
    assert_eq!(replica.property(LABEL), Value::from(""));
}

#[tokio::test]
async fn test_source_update_reaches_replica() {
    let (_host, handle, client) = setup(0).await;
    let replica = valid_replica(&client).await;
    let mut events = replica.subscribe();

    handle.update(|counter, _| counter.count = 42).await.expect("update");

    let event = next_event(&mut events, |e| matches!(e, ReplicaEvent::PropertyChanged { .. })).await;
    assert_eq!(
        event,
        ReplicaEvent::PropertyChanged {
            index: COUNT,
            value: Value::Int(42)
        }
    );
    assert_eq!(replica.property(COUNT), Value::Int(42));
}

#[tokio::test]
async fn test_source_set_property_reaches_replica() {
    let (_host, handle, client) = setup(0).await;
    let replica = valid_replica(&client).await;

    handle.set_property(LABEL, Value::from("renamed")).await.expect("set");

    eventually(|| replica.property(LABEL) == Value::from("renamed")).await;
}

#[tokio::test]
async fn test_call_returns_value() {
    let (_host, handle, client) = setup(5).await;
    let replica = valid_replica(&client).await;

    let result = within(replica.call(INCREMENT, vec![Value::Int(2)]).wait()).await;
    assert_eq!(result, Ok(Value::Int(7)));
    eventually(|| replica.property(COUNT) == Value::Int(7)).await;
    assert_eq!(handle.snapshot().await.expect("snapshot")[COUNT], Value::Int(7));
}

#[tokio::test]
async fn test_call_by_name_failure_is_remote_error() {
    let (_host, _handle, client) = setup(5).await;
    let replica = valid_replica(&client).await;

    let result = within(replica.call_by_name("divide", vec![Value::Int(0)]).wait()).await;
    assert!(matches!(result, Err(CallError::Remote(msg)) if msg.contains("division by zero")));
}

#[tokio::test]
async fn test_void_call_resolves_immediately() {
    let (_host, _handle, client) = setup(9).await;
    let replica = valid_replica(&client).await;

    let mut pending = replica.call(RESET, Vec::new());
    assert!(pending.is_ready());
    assert_eq!(pending.result(), Some(&Ok(Value::Null)));
    eventually(|| replica.property(COUNT) == Value::Int(0)).await;
}

#[tokio::test]
async fn test_call_on_unknown_method_fails() {
    let (_host, _handle, client) = setup(0).await;
    let replica = valid_replica(&client).await;

    let result = replica.call(99, Vec::new()).wait().await;
    assert_eq!(result, Err(CallError::UnknownMethod(99)));
}

#[tokio::test]
async fn test_call_before_valid_fails_fast() {
    let client = Node::new();
    let replica = client.acquire("nowhere", Counter::api());

    let result = replica.call(INCREMENT, vec![Value::Int(1)]).wait().await;
    assert_eq!(result, Err(CallError::NotValid(ReplicaState::Uninitialized)));
}

#[tokio::test]
async fn test_signal_reaches_replica() {
    let (_host, _handle, client) = setup(100).await;
    let replica = valid_replica(&client).await;
    let mut events = replica.subscribe();

    let _ = within(replica.call(INCREMENT, vec![Value::Int(5)]).wait()).await;

    let event = next_event(&mut events, |e| matches!(e, ReplicaEvent::Signal { .. })).await;
    assert_eq!(
        event,
        ReplicaEvent::Signal {
            index: OVERFLOWED,
            args: vec![Value::Int(105)]
        }
    );
}

#[tokio::test]
async fn test_emit_from_source_reaches_replica() {
    let (_host, handle, client) = setup(0).await;
    let replica = valid_replica(&client).await;
    let mut events = replica.subscribe();

    handle.emit(OVERFLOWED, vec![Value::Int(-1)]).await.expect("emit");

    let event = next_event(&mut events, |e| matches!(e, ReplicaEvent::Signal { .. })).await;
    assert_eq!(
        event,
        ReplicaEvent::Signal {
            index: OVERFLOWED,
            args: vec![Value::Int(-1)]
        }
    );
}

#[tokio::test]
async fn test_set_property_read_write() {
    let (_host, handle, client) = setup(0).await;
    let replica = valid_replica(&client).await;

    replica.set_property(LABEL, Value::from("from replica")).expect("writable");

    eventually(|| replica.property(LABEL) == Value::from("from replica")).await;
    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot[LABEL], Value::from("from replica"));
}

#[tokio::test]
async fn test_set_property_read_push_goes_through_push_method() {
    let (_host, handle, client) = setup(0).await;
    let replica = valid_replica(&client).await;

    replica.set_property(COUNT, Value::Int(11)).expect("pushable");

    eventually(|| replica.property(COUNT) == Value::Int(11)).await;
    let count = handle.update(|counter, _| counter.count).await.expect("update");
    assert_eq!(count, 11);
}

#[tokio::test]
async fn test_set_property_refuses_constant_and_wrong_type() {
    let (_host, _handle, client) = setup(0).await;
    let replica = valid_replica(&client).await;

    assert!(matches!(
        replica.set_property(ID, Value::UInt(1)),
        Err(ReplicaError::NotWritable(name)) if name == "id"
    ));
    assert!(matches!(
        replica.set_property(LABEL, Value::Int(1)),
        Err(ReplicaError::TypeMismatch { .. })
    ));
    assert_eq!(
        replica.set_property(99, Value::Null),
        Err(ReplicaError::UnknownProperty(99))
    );
}

#[tokio::test]
async fn test_signature_mismatch_is_terminal() {
    let (_host, handle, client) = setup(4).await;
    let replica = client.acquire("counter", Counter::other_api());

    assert_eq!(within(replica.wait_for_source()).await, ReplicaState::SignatureMismatch);
    assert_eq!(replica.property(0), Value::Double(0.0));
    assert_eq!(replica.set_property(0, Value::Double(1.0)), Err(ReplicaError::SignatureMismatch));
    assert_eq!(
        replica.call(0, Vec::new()).wait().await,
        Err(CallError::NotValid(ReplicaState::SignatureMismatch))
    );

    // Source changes do not revive it.
    handle.update(|counter, _| counter.count = 5).await.expect("update");
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(replica.state(), ReplicaState::SignatureMismatch);
}

#[tokio::test]
async fn test_replica_goes_suspect_when_host_stops() {
    let (host, _handle, client) = setup(1).await;
    let replica = valid_replica(&client).await;
    let mut events = replica.subscribe();

    host.shutdown().await;

    let event = next_event(&mut events, |e| matches!(e, ReplicaEvent::StateChanged { .. })).await;
    assert_eq!(
        event,
        ReplicaEvent::StateChanged {
            old: ReplicaState::Valid,
            new: ReplicaState::Suspect
        }
    );
    // The last known values stay readable.
    assert_eq!(replica.property(COUNT), Value::Int(1));
    assert_eq!(
        replica.call(INCREMENT, vec![Value::Int(1)]).wait().await,
        Err(CallError::NotValid(ReplicaState::Suspect))
    );
}

#[tokio::test]
async fn test_disable_and_reenable_revalidates_replica() {
    let (host, handle, client) = setup(1).await;
    let replica = valid_replica(&client).await;

    assert!(handle.disable_remoting().await.expect("disable"));
    eventually(|| replica.state() == ReplicaState::Suspect).await;

    let _handle = host
        .enable_remoting("counter", Counter::new(50))
        .await
        .expect("re-enable");
    eventually(|| replica.state() == ReplicaState::Valid).await;
    assert_eq!(replica.property(COUNT), Value::Int(50));
}

#[tokio::test]
async fn test_dynamic_replica_adopts_source_api() {
    let (_host, _handle, client) = setup(8).await;
    let replica = client.acquire_dynamic("counter");

    assert!(replica.is_dynamic());
    assert!(replica.api().is_none());
    assert_eq!(within(replica.wait_for_source()).await, ReplicaState::Valid);

    let api = replica.api().expect("adopted api");
    assert_eq!(api.type_name(), "Counter");
    assert_eq!(api.signature(), Counter::api().signature());
    assert_eq!(replica.property_by_name("count"), Value::Int(8));

    let result = within(replica.call_by_name("increment", vec![Value::Int(1)]).wait()).await;
    assert_eq!(result, Ok(Value::Int(9)));
}

#[tokio::test]
async fn test_released_replica_persists_values() {
    let (host, handle, _other) = setup(0).await;
    let store = Arc::new(MemoryStore::new());
    let client = Node::builder().persisted_store(store.clone()).build();
    client
        .connect_to_node(&host.local_endpoint().expect("listening").to_string())
        .await
        .expect("connect");

    let replica = valid_replica(&client).await;
    handle.update(|counter, _| counter.count = 77).await.expect("update");
    eventually(|| replica.property(COUNT) == Value::Int(77)).await;
    drop(replica);

    eventually(|| store.len() == 1).await;
    let api = Counter::api();
    let saved = store.restore(api.type_name(), api.signature()).expect("saved values");
    assert_eq!(saved[COUNT], Value::Int(77));

    // A fresh replica starts from the saved values.
    let restored = client.acquire("nowhere", Counter::api());
    assert_eq!(restored.property(COUNT), Value::Int(77));
}

#[tokio::test]
async fn test_enable_remoting_requires_listening() {
    let node = Node::new();
    let result = node.enable_remoting("counter", Counter::new(0)).await;
    assert!(matches!(result, Err(RepliqError::NotListening)));
}

#[tokio::test]
async fn test_enable_remoting_rejects_duplicate_name() {
    let (host, _url) = listening_node().await;
    let _first = host.enable_remoting("counter", Counter::new(0)).await.expect("first");
    let second = host.enable_remoting("counter", Counter::new(1)).await;
    assert!(matches!(second, Err(RepliqError::DuplicateName(name)) if name == "counter"));
}

#[tokio::test]
async fn test_two_replicas_share_one_source() {
    let (_host, handle, client) = setup(0).await;
    let first = valid_replica(&client).await;
    let second = valid_replica(&client).await;

    let a = within(first.call(INCREMENT, vec![Value::Int(1)]).wait()).await;
    let b = within(second.call(INCREMENT, vec![Value::Int(1)]).wait()).await;
    assert_eq!(a, Ok(Value::Int(1)));
    assert_eq!(b, Ok(Value::Int(2)));

    drop(first);
    handle.update(|counter, _| counter.count = 10).await.expect("update");
    eventually(|| second.property(COUNT) == Value::Int(10)).await;
}
