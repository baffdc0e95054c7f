use super::*;
use crate::store::MemoryStore;
use crate::testing::{assert_quiet, bus, fast_config, next_event};

#[tokio::test]
async fn test_connect_emits_online() {
    let store = Arc::new(MemoryStore::new());
    let bus = Bus::new(fast_config(), store);
    let mut events = bus.subscribe();
    assert!(!bus.is_online());

    bus.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, BusEvent::Online);
    assert!(bus.is_online());
}

#[tokio::test]
async fn test_second_connect_reports_already_connected() {
    let (bus, _) = bus().await;
    let mut events = bus.subscribe();

    let err = bus.connect().await.unwrap_err();
    assert_eq!(err, BusError::AlreadyConnected);
    assert_eq!(
        next_event(&mut events).await,
        BusEvent::Error(BusError::AlreadyConnected)
    );
    assert_quiet(&mut events).await;
    assert!(bus.is_online());
}

#[tokio::test]
async fn test_connect_to_unreachable_store_fails() {
    let store = Arc::new(MemoryStore::new());
    store.set_available(false);
    let bus = Bus::new(fast_config(), store.clone());
    let mut events = bus.subscribe();

    let err = bus.connect().await.unwrap_err();
    assert!(matches!(err, BusError::Connection(_)));
    assert!(matches!(next_event(&mut events).await, BusEvent::Error(BusError::Connection(_))));
    assert!(!bus.is_online());

    // Not fatal: connecting again once the store is back works
    store.set_available(true);
    bus.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, BusEvent::Online);
}

#[tokio::test]
async fn test_store_lifecycle_is_mirrored() {
    let (bus, store) = bus().await;
    let mut events = bus.subscribe();

    store.set_available(false);
    assert_eq!(next_event(&mut events).await, BusEvent::Offline);
    assert!(!bus.is_online());

    store.set_available(true);
    assert_eq!(next_event(&mut events).await, BusEvent::Online);
    assert!(bus.is_online());
}

#[tokio::test]
async fn test_disconnect_goes_offline_once() {
    let (bus, store) = bus().await;
    let mut events = bus.subscribe();

    bus.disconnect().await;
    assert_eq!(next_event(&mut events).await, BusEvent::Offline);
    assert!(!bus.is_online());

    bus.disconnect().await;
    // Lifecycle is no longer mirrored either
    store.set_available(false);
    store.set_available(true);
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn test_federate_requires_online_bus() {
    let store = Arc::new(MemoryStore::new());
    let bus = Bus::new(fast_config(), store);
    let queue = bus.queue("offline");

    let err = bus
        .federate(&queue, "ws://127.0.0.1:1/federate")
        .await
        .err()
        .unwrap();
    assert_eq!(err, BusError::NotConnected);
}

#[tokio::test]
async fn test_factories_share_the_store() {
    let (bus, _) = bus().await;
    let writer = bus.queue("shared");
    let reader = bus.queue("shared");
    writer.push("one").await.unwrap();

    assert_eq!(reader.count().await.unwrap(), 1);
    assert_eq!(bus.channel("c", "l", "r").name(), "c");
    assert_eq!(bus.pubsub("p").name(), "p");
    assert_eq!(bus.persistify("o", ["f"]).fields(), ["f".to_string()]);
}

#[tokio::test]
async fn test_bus_ids_are_unique() {
    let (a, store) = bus().await;
    let b = crate::testing::shared_bus(&store).await;
    assert_ne!(a.id(), b.id());
}
