//! Integration tests for the registry: announcements, collisions, cleanup
//! and recovery after the host restarts.

mod common;

use std::time::Duration;

use common::*;
use repliq::prelude::*;
use repliq::{ReconnectConfig, SourceLocation};

fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        jitter: Duration::from_millis(10),
    }
}

/// A node that hosts the registry, and its URL.
async fn registry_host() -> (Node, Registry, String) {
    let (node, url) = listening_node().await;
    let registry = node.host_registry().await.expect("should host registry");
    (node, registry, url)
}

/// A listening node that uses the registry at `registry_url`.
async fn member(registry_url: &str) -> (Node, Endpoint) {
    let node = Node::builder()
        .registry_url(registry_url.parse().expect("valid url"))
        .reconnect(fast_reconnect())
        .build();
    let endpoint = node.listen("tcp://127.0.0.1:0").await.expect("should listen");
    (node, endpoint)
}

fn located_at(registry: &Registry, name: &str) -> Option<Endpoint> {
    registry.source_locations().get(name).map(|loc| loc.endpoint.clone())
}

#[tokio::test]
async fn test_registry_is_none_without_url() {
    let node = Node::new();
    assert!(node.registry().is_none());
}

#[tokio::test]
async fn test_registry_available_right_after_build() {
    let node = Node::builder()
        .registry_url("tcp://127.0.0.1:1".parse().expect("valid url"))
        .reconnect(fast_reconnect())
        .build();
    // No await between building and asking.
    assert!(node.registry().is_some());
}

#[tokio::test]
async fn test_host_registry_requires_listening() {
    let node = Node::new();
    assert!(matches!(node.host_registry().await, Err(RepliqError::NotListening)));
}

#[tokio::test]
async fn test_host_lists_its_own_sources() {
    let (host, registry, url) = registry_host().await;
    let _handle = host.enable_remoting("beta", Counter::new(0)).await.expect("enable");

    let expected: Endpoint = url.parse().expect("valid url");
    eventually(|| located_at(&registry, "beta").as_ref() == Some(&expected)).await;
    assert_eq!(registry.resolve("beta"), Some(expected));
}

#[tokio::test]
async fn test_sources_enabled_before_hosting_are_listed() {
    let (host, url) = listening_node().await;
    let _handle = host.enable_remoting("early", Counter::new(0)).await.expect("enable");
    let registry = host.host_registry().await.expect("host");

    let expected: Endpoint = url.parse().expect("valid url");
    assert_eq!(registry.resolve("early"), Some(expected));
}

#[tokio::test]
async fn test_member_source_added_then_removed() {
    let (_host, _registry, url) = registry_host().await;
    let (observer, _) = member(&url).await;
    let observed = observer.registry().expect("registry configured");
    let mut events = observed.subscribe();

    let (alpha_node, alpha_endpoint) = member(&url).await;
    let handle = alpha_node
        .enable_remoting("alpha", Counter::new(0))
        .await
        .expect("enable");

    let added = next_event(&mut events, |e| matches!(e, RegistryEvent::Added(loc) if loc.name == "alpha")).await;
    assert_eq!(added, RegistryEvent::Added(SourceLocation::new("alpha", alpha_endpoint.clone())));

    assert!(handle.disable_remoting().await.expect("disable"));

    let removed = next_event(&mut events, |e| matches!(e, RegistryEvent::Removed(loc) if loc.name == "alpha")).await;
    assert_eq!(removed, RegistryEvent::Removed(SourceLocation::new("alpha", alpha_endpoint)));
    assert!(observed.resolve("alpha").is_none());
}

#[tokio::test]
async fn test_entries_removed_when_member_disconnects() {
    let (_host, registry, url) = registry_host().await;
    let (alpha_node, alpha_endpoint) = member(&url).await;
    let _a = alpha_node.enable_remoting("a", Counter::new(0)).await.expect("enable");
    let _b = alpha_node.enable_remoting("b", Counter::new(0)).await.expect("enable");

    eventually(|| registry.source_locations().len() == 2).await;
    assert_eq!(registry.resolve("a"), Some(alpha_endpoint));

    alpha_node.shutdown().await;

    eventually(|| registry.source_locations().is_empty()).await;
}

#[tokio::test]
async fn test_name_collision_keeps_first_and_drops_loser() {
    let (_host, registry, url) = registry_host().await;
    let (first, first_endpoint) = member(&url).await;
    let (second, _second_endpoint) = member(&url).await;
    let second_registry = second.registry().expect("registry configured");

    let _first_handle = first.enable_remoting("alpha", Counter::new(1)).await.expect("enable");
    eventually(|| located_at(&registry, "alpha").as_ref() == Some(&first_endpoint)).await;
    eventually(|| second_registry.resolve("alpha").is_some()).await;

    // Hosting locally still works; the registry keeps the first entry.
    let _second_handle = second.enable_remoting("alpha", Counter::new(2)).await.expect("enable");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(located_at(&registry, "alpha"), Some(first_endpoint));
    assert_eq!(registry.source_locations().len(), 1);

    // The loser does not claim the name once the winner leaves.
    first.shutdown().await;
    eventually(|| registry.source_locations().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(located_at(&registry, "alpha").is_none());
}

#[tokio::test]
async fn test_registry_add_source_refuses_taken_name() {
    let (_host, registry, url) = registry_host().await;
    let (member_node, member_endpoint) = member(&url).await;
    let _handle = member_node.enable_remoting("taken", Counter::new(0)).await.expect("enable");
    let member_registry = member_node.registry().expect("registry configured");
    eventually(|| member_registry.resolve("taken").is_some()).await;

    let elsewhere: Endpoint = "tcp://127.0.0.1:1".parse().expect("valid url");
    let accepted = member_registry.add_source("taken", elsewhere).await.expect("node running");
    assert!(!accepted);
    assert_eq!(registry.resolve("taken"), Some(member_endpoint));
}

#[tokio::test]
async fn test_acquire_connects_through_registry() {
    let (_host, _registry, url) = registry_host().await;
    let (alpha_node, _) = member(&url).await;
    let handle = alpha_node
        .enable_remoting("alpha", Counter::new(3))
        .await
        .expect("enable");

    // The consumer never dials the source node itself.
    let consumer = Node::builder()
        .registry_url(url.parse().expect("valid url"))
        .reconnect(fast_reconnect())
        .build();
    let replica = consumer.acquire("alpha", Counter::api());

    assert_eq!(within(replica.wait_for_source()).await, ReplicaState::Valid);
    assert_eq!(replica.property(COUNT), Value::Int(3));

    handle.update(|counter, _| counter.count = 4).await.expect("update");
    eventually(|| replica.property(COUNT) == Value::Int(4)).await;
}

#[tokio::test]
async fn test_sources_reannounced_after_registry_restart() {
    let (host, registry, url) = registry_host().await;
    let (member_node, member_endpoint) = member(&url).await;
    let mut handles = Vec::new();
    for name in ["one", "two", "three"] {
        handles.push(member_node.enable_remoting(name, Counter::new(0)).await.expect("enable"));
    }
    eventually(|| registry.source_locations().len() == 3).await;

    host.shutdown().await;
    drop(host);

    // The listener is released asynchronously; retry until the port is free.
    let restarted = Node::new();
    within(async {
        while restarted.listen(&url).await.is_err() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    let registry = restarted.host_registry().await.expect("should host registry");

    eventually(|| registry.source_locations().len() == 3).await;
    for name in ["one", "two", "three"] {
        assert_eq!(registry.resolve(name), Some(member_endpoint.clone()));
    }
}

#[tokio::test]
async fn test_wait_for_resolves_once_announced() {
    let (_host, registry, url) = registry_host().await;

    let waiter = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.wait_for("late").await })
    };

    let (member_node, member_endpoint) = member(&url).await;
    let _handle = member_node.enable_remoting("late", Counter::new(0)).await.expect("enable");

    let location = within(waiter).await.expect("task").expect("announced");
    assert_eq!(location, SourceLocation::new("late", member_endpoint));
}
