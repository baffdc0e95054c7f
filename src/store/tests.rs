use super::*;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_list_push_assigns_monotonic_ids() {
    let store = MemoryStore::new();

    let a = store.list_push("log", "log:id", b"a".to_vec()).await.unwrap();
    let b = store.list_push("log", "log:id", b"b".to_vec()).await.unwrap();
    let c = store.list_push("log", "log:id", b"c".to_vec()).await.unwrap();

    assert_eq!((a, b, c), (1, 2, 3));
    assert_eq!(store.list_len("log").await.unwrap(), 3);
}

#[tokio::test]
async fn test_ids_not_reused_after_list_deleted() {
    let store = MemoryStore::new();

    store.list_push("log", "log:id", b"a".to_vec()).await.unwrap();
    store.list_push("log", "log:id", b"b".to_vec()).await.unwrap();
    store.key_delete("log").await.unwrap();

    let id = store.list_push("log", "log:id", b"c".to_vec()).await.unwrap();
    assert_eq!(id, 3);
}

#[tokio::test]
async fn test_list_pop_returns_oldest_with_id() {
    let store = MemoryStore::new();
    store.list_push("log", "log:id", b"first".to_vec()).await.unwrap();
    store.list_push("log", "log:id", b"second".to_vec()).await.unwrap();

    let popped = store.list_pop("log").await.unwrap();
    assert_eq!(popped, Some((1, b"first".to_vec())));
    assert_eq!(store.list_len("log").await.unwrap(), 1);
    assert_eq!(store.list_pop("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_concurrent_pops_never_share_an_item() {
    let store = Arc::new(MemoryStore::new());
    for i in 0..200u32 {
        store
            .list_push("log", "log:id", i.to_be_bytes().to_vec())
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some((id, _)) = store.list_pop("log").await.unwrap() {
                ids.push(id);
            }
            ids
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (1..=200).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_peek_range_and_remove() {
    let store = MemoryStore::new();
    for word in ["a", "b", "c", "d"] {
        store
            .list_push("log", "log:id", word.as_bytes().to_vec())
            .await
            .unwrap();
    }

    let range = store.list_peek_range("log", 1, 2).await.unwrap();
    assert_eq!(range, vec![(2, b"b".to_vec()), (3, b"c".to_vec())]);

    assert!(store.list_remove("log", 2).await.unwrap());
    assert!(!store.list_remove("log", 2).await.unwrap());
    assert_eq!(store.list_get("log", 3).await.unwrap(), Some(b"c".to_vec()));

    assert_eq!(store.list_remove_through("log", 3).await.unwrap(), 2);
    assert_eq!(store.list_peek_range("log", 0, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_hash_cas() {
    let store = MemoryStore::new();

    assert!(store
        .hash_cas("state", "cursor", None, Some(b"1".to_vec()))
        .await
        .unwrap());
    // Stale expectation is rejected
    assert!(!store
        .hash_cas("state", "cursor", None, Some(b"2".to_vec()))
        .await
        .unwrap());
    assert!(store
        .hash_cas("state", "cursor", Some(b"1"), Some(b"2".to_vec()))
        .await
        .unwrap());
    assert!(store
        .hash_cas("state", "cursor", Some(b"2"), None)
        .await
        .unwrap());
    assert_eq!(store.hash_get("state", "cursor").await.unwrap(), None);
}

#[tokio::test]
async fn test_wrong_type_is_an_error() {
    let store = MemoryStore::new();
    store.hash_set("key", "f", b"v".to_vec()).await.unwrap();

    assert!(store.list_pop("key").await.is_err());
    assert!(store.counter_incr("key", 1).await.is_err());
}

#[tokio::test]
async fn test_expire_and_persist() {
    let store = MemoryStore::new();
    store.counter_incr("a", 1).await.unwrap();
    store.counter_incr("b", 1).await.unwrap();

    store.key_expire("a", Duration::from_millis(50)).await.unwrap();
    store.key_expire("b", Duration::from_millis(50)).await.unwrap();
    assert!(store.key_persist("b").await.unwrap());

    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(!store.key_exists("a").await.unwrap());
    assert!(store.key_exists("b").await.unwrap());
    // Expired counter restarts from scratch
    assert_eq!(store.counter_incr("a", 1).await.unwrap(), 1);
}

#[tokio::test]
async fn test_publish_reaches_live_subscribers_only() {
    let store = MemoryStore::new();
    assert_eq!(store.publish("topic", b"early".to_vec()).await.unwrap(), 0);

    let mut sub = store.subscribe("topic").await.unwrap();
    assert_eq!(store.publish("topic", b"hello".to_vec()).await.unwrap(), 1);

    let received = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .unwrap();
    assert_eq!(received, Some(b"hello".to_vec()));
}

#[tokio::test]
async fn test_abandoned_channels_are_pruned() {
    let store = MemoryStore::new();
    let first = store.subscribe("short").await.unwrap();
    let second = store.subscribe("short").await.unwrap();
    let _kept = store.subscribe("kept").await.unwrap();
    assert_eq!(store.channel_count(), 2);

    drop(first);
    assert_eq!(store.publish("short", b"one".to_vec()).await.unwrap(), 1);
    assert_eq!(store.channel_count(), 2);

    drop(second);
    assert_eq!(store.publish("short", b"two".to_vec()).await.unwrap(), 0);
    assert_eq!(store.channel_count(), 1);
    assert_eq!(store.publish("kept", b"three".to_vec()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_outage_ends_subscriptions_and_fails_operations() {
    let store = MemoryStore::new();
    let mut lifecycle = store.lifecycle();
    let mut sub = store.subscribe("topic").await.unwrap();

    store.set_available(false);

    assert_eq!(lifecycle.recv().await.unwrap(), StoreEvent::Offline);
    let ended = tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .unwrap();
    assert_eq!(ended, None);
    assert!(store.ping().await.is_err());
    assert!(store.publish("topic", b"x".to_vec()).await.is_err());

    store.set_available(true);
    assert_eq!(lifecycle.recv().await.unwrap(), StoreEvent::Online);
    assert!(store.ping().await.is_ok());
}

#[tokio::test]
async fn test_hash_delete_and_get_all() {
    let store = MemoryStore::new();
    store.hash_set("meta", "a", b"1".to_vec()).await.unwrap();
    store.hash_set("meta", "b", b"2".to_vec()).await.unwrap();

    assert!(store.hash_delete("meta", "a").await.unwrap());
    assert!(!store.hash_delete("meta", "a").await.unwrap());

    let all = store.hash_get_all("meta").await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all.get("b"), Some(&b"2".to_vec()));
}
