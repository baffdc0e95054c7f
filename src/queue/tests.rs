use super::keys::{InFlight, QueueKeys};
use super::*;
use crate::bus::Bus;
use crate::store::{ListItem, MemoryStore, Store, StoreEvent};
use crate::testing::{assert_quiet, bus, fast_config, next_event, shared_bus, wait_for};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use tokio::sync::broadcast;

async fn next_message(events: &mut broadcast::Receiver<QueueEvent>) -> (String, Option<u64>) {
    match wait_for(events, |e| matches!(e, QueueEvent::Message { .. })).await {
        QueueEvent::Message { payload, id } => (payload.as_str().unwrap_or_default().to_string(), id),
        _ => unreachable!(),
    }
}

async fn wait_stopped(events: &mut broadcast::Receiver<QueueEvent>) {
    wait_for(events, |e| *e == QueueEvent::Consuming(false)).await;
}

#[tokio::test]
async fn test_attach_reports_existence() {
    let (bus, _) = bus().await;
    let first = bus.queue("jobs");
    let mut events = first.subscribe();

    first.attach(AttachOptions::default()).await.unwrap();
    assert_eq!(next_event(&mut events).await, QueueEvent::Attaching);
    assert_eq!(next_event(&mut events).await, QueueEvent::Attached { existed: false });
    assert!(first.is_attached());

    let second = bus.queue("jobs");
    let mut events = second.subscribe();
    second.attach(AttachOptions::default()).await.unwrap();
    assert_eq!(next_event(&mut events).await, QueueEvent::Attaching);
    assert_eq!(next_event(&mut events).await, QueueEvent::Attached { existed: true });
}

#[tokio::test]
async fn test_push_ids_are_sequential() {
    let (bus, _) = bus().await;
    let queue = bus.queue("ids");
    queue.attach(AttachOptions::default()).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(queue.push(format!("m{}", i)).await.unwrap());
    }
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(queue.pushed(), 4);
    assert_eq!(queue.count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_consume_in_batches_with_max() {
    let (bus, _) = bus().await;
    let queue = bus.queue("batches");
    queue.attach(AttachOptions::default()).await.unwrap();
    for i in 1..=5 {
        queue.push(i.to_string()).await.unwrap();
    }

    let mut events = queue.subscribe();
    let mut received = Vec::new();

    queue.consume(ConsumeOptions::default().max(2)).await.unwrap();
    received.push(next_message(&mut events).await);
    received.push(next_message(&mut events).await);
    wait_stopped(&mut events).await;

    queue.consume(ConsumeOptions::default().max(1)).await.unwrap();
    received.push(next_message(&mut events).await);
    wait_stopped(&mut events).await;

    queue.consume(ConsumeOptions::default()).await.unwrap();
    received.push(next_message(&mut events).await);
    received.push(next_message(&mut events).await);
    queue.stop().await.unwrap();

    let payloads: Vec<&str> = received.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(payloads, vec!["1", "2", "3", "4", "5"]);
    assert!(received.iter().all(|(_, id)| id.is_none()));
    assert_eq!(queue.consumed(), 5);
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_consumer_wakes_on_push() {
    let (bus, _) = bus().await;
    let queue = bus.queue("wake");
    queue.attach(AttachOptions::default()).await.unwrap();
    let mut events = queue.subscribe();

    queue.consume(ConsumeOptions::default()).await.unwrap();
    assert_eq!(next_event(&mut events).await, QueueEvent::Consuming(true));

    queue.push("late").await.unwrap();
    assert_eq!(next_message(&mut events).await, ("late".to_string(), None));
    assert!(queue.is_consuming());

    queue.stop().await.unwrap();
    wait_stopped(&mut events).await;
    assert!(!queue.is_consuming());
}

#[tokio::test]
async fn test_second_consume_is_rejected() {
    let (bus, _) = bus().await;
    let queue = bus.queue("busy");
    queue.consume(ConsumeOptions::default()).await.unwrap();

    let err = queue.consume(ConsumeOptions::default()).await.unwrap_err();
    assert!(matches!(err, BusError::Consume(_)));
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn test_reliable_redelivers_unacked_message_first() {
    let (bus, store) = bus().await;
    let first = bus.queue("reliable");
    first.attach(AttachOptions::default()).await.unwrap();
    first.push("a").await.unwrap();
    first.push("b").await.unwrap();

    let mut events = first.subscribe();
    first.consume(ConsumeOptions::default().reliable()).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("a".to_string(), Some(1)));
    // Crash without acking
    first.stop().await.unwrap();

    let other_process = shared_bus(&store).await;
    let second = other_process.queue("reliable");
    let mut events = second.subscribe();
    second.consume(ConsumeOptions::default().reliable()).await.unwrap();

    assert_eq!(next_message(&mut events).await, ("a".to_string(), Some(1)));
    second.ack(1).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("b".to_string(), Some(2)));
    second.ack(2).await.unwrap();

    second.stop().await.unwrap();
    assert_eq!(second.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reliable_redelivery_survives_failed_owner_release() {
    let (bus, store) = bus().await;
    let queue = bus.queue("release-outage");
    queue.push("a").await.unwrap();
    queue.push("b").await.unwrap();

    let mut events = queue.subscribe();
    queue.consume(ConsumeOptions::default().reliable()).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("a".to_string(), Some(1)));

    // The session cannot unregister itself while the store is down
    store.set_available(false);
    queue.stop().await.unwrap();
    wait_stopped(&mut events).await;
    store.set_available(true);

    queue.consume(ConsumeOptions::default().reliable()).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("a".to_string(), Some(1)));
    queue.ack(1).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("b".to_string(), Some(2)));
    queue.ack(2).await.unwrap();
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn test_reliable_redelivers_claim_of_silent_owner() {
    let (bus, store) = bus().await;
    let queue = bus.queue("abandoned");
    queue.push("lost").await.unwrap();
    queue.push("next").await.unwrap();

    // Claim held by a process that died without unregistering
    let keys = QueueKeys::new("abandoned");
    let claim = serde_json::to_vec(&InFlight {
        owner: "dead-process".to_string(),
        remove: true,
    })
    .unwrap();
    store.hash_set(&keys.inflight, "1", claim).await.unwrap();
    let lease = Utc::now() + chrono::Duration::milliseconds(300);
    store
        .hash_set(&keys.owners, "dead-process", lease.to_rfc3339().into_bytes())
        .await
        .unwrap();

    let mut events = queue.subscribe();
    queue.consume(ConsumeOptions::default().reliable()).await.unwrap();
    // Its lease is still running, so the claim is respected at first
    assert_eq!(next_message(&mut events).await, ("next".to_string(), Some(2)));
    queue.ack(2).await.unwrap();

    // The lease is never renewed, so the claim goes stale and is redelivered
    assert_eq!(next_message(&mut events).await, ("lost".to_string(), Some(1)));
    queue.ack(1).await.unwrap();
    queue.stop().await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_live_session_keeps_its_claim() {
    let (bus, store) = bus().await;
    let first = bus.queue("held");
    first.push("mine").await.unwrap();

    let mut events = first.subscribe();
    first.consume(ConsumeOptions::default().reliable()).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("mine".to_string(), Some(1)));

    // Well past one lease term, renewals keep the claim alive
    tokio::time::sleep(Duration::from_millis(400)).await;
    let other_process = shared_bus(&store).await;
    let second = other_process.queue("held");
    let mut other_events = second.subscribe();
    second.consume(ConsumeOptions::default().reliable()).await.unwrap();
    assert_quiet(&mut other_events).await;

    first.ack(1).await.unwrap();
    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_reliable_waits_for_ack_before_next() {
    let (bus, _) = bus().await;
    let queue = bus.queue("one-at-a-time");
    queue.push("x").await.unwrap();
    queue.push("y").await.unwrap();

    let mut events = queue.subscribe();
    queue.consume(ConsumeOptions::default().reliable()).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("x".to_string(), Some(1)));
    assert_quiet(&mut events).await;

    queue.ack(1).await.unwrap();
    assert_eq!(next_message(&mut events).await, ("y".to_string(), Some(2)));
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn test_reliable_last_skips_acknowledged() {
    let (bus, _) = bus().await;
    let queue = bus.queue("resume");
    for payload in ["one", "two", "three"] {
        queue.push(payload).await.unwrap();
    }

    let mut events = queue.subscribe();
    queue
        .consume(ConsumeOptions::default().reliable().last(2))
        .await
        .unwrap();

    assert_eq!(next_message(&mut events).await, ("three".to_string(), Some(3)));
    assert_eq!(queue.count().await.unwrap(), 1);
    queue.ack(3).await.unwrap();
    queue.stop().await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_duplicate_ack_is_accepted() {
    let (bus, _) = bus().await;
    let queue = bus.queue("dup-ack");
    queue.push("only").await.unwrap();

    let mut events = queue.subscribe();
    queue.consume(ConsumeOptions::default().reliable()).await.unwrap();
    let (_, id) = next_message(&mut events).await;
    let id = id.unwrap();

    queue.ack(id).await.unwrap();
    queue.ack(id).await.unwrap();
    queue.stop().await.unwrap();
}

#[tokio::test]
async fn test_ack_of_undelivered_id_fails() {
    let (bus, _) = bus().await;
    let queue = bus.queue("no-such");

    let err = queue.ack(42).await.unwrap_err();
    assert!(matches!(err, BusError::Consume(_)));
}

#[tokio::test]
async fn test_keep_leaves_messages_for_other_consumers() {
    let (bus, _) = bus().await;
    let queue = bus.queue("keep");
    queue.push("p").await.unwrap();
    queue.push("q").await.unwrap();

    let mut events = queue.subscribe();
    queue.consume(ConsumeOptions::default().keep().max(2)).await.unwrap();
    assert_eq!(next_message(&mut events).await.0, "p");
    assert_eq!(next_message(&mut events).await.0, "q");
    wait_stopped(&mut events).await;
    assert_eq!(queue.count().await.unwrap(), 2);

    let again = bus.queue("keep");
    let mut events = again.subscribe();
    again.consume(ConsumeOptions::default().keep().max(1)).await.unwrap();
    assert_eq!(next_message(&mut events).await.0, "p");
}

#[tokio::test]
async fn test_count_flush_and_exists() {
    let (bus, _) = bus().await;
    let queue = bus.queue("flushable");
    assert!(!queue.exists().await.unwrap());

    queue.attach(AttachOptions::default()).await.unwrap();
    assert!(queue.exists().await.unwrap());
    queue.push("1").await.unwrap();
    queue.push("2").await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 2);

    queue.flush().await.unwrap();
    assert_eq!(queue.count().await.unwrap(), 0);
    // Ids keep growing after a flush
    assert_eq!(queue.push("3").await.unwrap(), 3);
}

#[tokio::test]
async fn test_metadata() {
    let (bus, _) = bus().await;
    let queue = bus.queue("meta");

    queue.metadata_set("owner", "billing").await.unwrap();
    queue
        .metadata_set_many(HashMap::from([
            ("region".to_string(), "eu".to_string()),
            ("tier".to_string(), "gold".to_string()),
        ]))
        .await
        .unwrap();

    assert_eq!(queue.metadata_get("owner").await.unwrap().as_deref(), Some("billing"));
    assert_eq!(queue.metadata_get("missing").await.unwrap(), None);
    let all = queue.metadata_all().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all["tier"], "gold");
}

#[tokio::test]
async fn test_final_detach_expires_queue() {
    let (bus, _) = bus().await;
    let queue = bus.queue("short-lived");
    queue
        .attach(AttachOptions::default().ttl(Duration::from_millis(100)))
        .await
        .unwrap();
    queue.push("gone soon").await.unwrap();

    let mut events = queue.subscribe();
    queue.detach().await.unwrap();
    assert_eq!(next_event(&mut events).await, QueueEvent::Detaching);
    assert_eq!(next_event(&mut events).await, QueueEvent::Detached);
    assert!(queue.exists().await.unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!queue.exists().await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_writes_during_pending_expiry_expire_with_queue() {
    let (bus, _) = bus().await;
    let queue = bus.queue("late-writes");
    queue
        .attach(AttachOptions::default().ttl(Duration::from_millis(150)))
        .await
        .unwrap();
    queue.detach().await.unwrap();

    queue.push("after detach").await.unwrap();
    queue.metadata_set("k", "v").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!queue.exists().await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 0);
    assert_eq!(queue.metadata_get("k").await.unwrap(), None);
}

/// Store where another process attaches just as the final detach arms the expiry
struct AttachDuringDetach {
    inner: MemoryStore,
    refs: String,
    raced: AtomicBool,
}

#[async_trait]
impl Store for AttachDuringDetach {
    async fn ping(&self) -> anyhow::Result<()> {
        self.inner.ping().await
    }

    async fn list_push(&self, key: &str, counter: &str, value: Vec<u8>) -> anyhow::Result<u64> {
        self.inner.list_push(key, counter, value).await
    }

    async fn list_pop(&self, key: &str) -> anyhow::Result<Option<ListItem>> {
        self.inner.list_pop(key).await
    }

    async fn list_peek_range(
        &self,
        key: &str,
        after: u64,
        limit: usize,
    ) -> anyhow::Result<Vec<ListItem>> {
        self.inner.list_peek_range(key, after, limit).await
    }

    async fn list_get(&self, key: &str, id: u64) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.list_get(key, id).await
    }

    async fn list_remove(&self, key: &str, id: u64) -> anyhow::Result<bool> {
        self.inner.list_remove(key, id).await
    }

    async fn list_remove_through(&self, key: &str, id: u64) -> anyhow::Result<usize> {
        self.inner.list_remove_through(key, id).await
    }

    async fn list_len(&self, key: &str) -> anyhow::Result<usize> {
        self.inner.list_len(key).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.inner.hash_get(key, field).await
    }

    async fn hash_get_all(&self, key: &str) -> anyhow::Result<HashMap<String, Vec<u8>>> {
        self.inner.hash_get_all(key).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.inner.hash_set(key, field, value).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> anyhow::Result<bool> {
        self.inner.hash_delete(key, field).await
    }

    async fn hash_cas(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[u8]>,
        value: Option<Vec<u8>>,
    ) -> anyhow::Result<bool> {
        self.inner.hash_cas(key, field, expected, value).await
    }

    async fn counter_incr(&self, key: &str, by: i64) -> anyhow::Result<i64> {
        self.inner.counter_incr(key, by).await
    }

    async fn key_expire(&self, key: &str, ttl: Duration) -> anyhow::Result<bool> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.inner.counter_incr(&self.refs, 1).await?;
        }
        self.inner.key_expire(key, ttl).await
    }

    async fn key_persist(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.key_persist(key).await
    }

    async fn key_exists(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.key_exists(key).await
    }

    async fn key_delete(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.key_delete(key).await
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> anyhow::Result<usize> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> anyhow::Result<BoxStream<'static, Vec<u8>>> {
        self.inner.subscribe(channel).await
    }

    fn lifecycle(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.lifecycle()
    }
}

#[tokio::test]
async fn test_attach_racing_final_detach_keeps_queue() {
    let store = Arc::new(AttachDuringDetach {
        inner: MemoryStore::new(),
        refs: QueueKeys::new("contended").refs,
        raced: AtomicBool::new(false),
    });
    let bus = Bus::new(fast_config(), store);
    bus.connect().await.unwrap();

    let queue = bus.queue("contended");
    queue
        .attach(AttachOptions::default().ttl(Duration::from_millis(100)))
        .await
        .unwrap();
    queue.push("survives").await.unwrap();
    queue.detach().await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(queue.exists().await.unwrap());
    assert_eq!(queue.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_reattach_cancels_expiry() {
    let (bus, _) = bus().await;
    let ttl = AttachOptions::default().ttl(Duration::from_millis(100));
    let first = bus.queue("revived");
    first.attach(ttl.clone()).await.unwrap();
    first.push("kept").await.unwrap();
    first.detach().await.unwrap();

    let second = bus.queue("revived");
    second.attach(ttl).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(second.exists().await.unwrap());
    assert_eq!(second.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_detach_with_other_attachment_keeps_queue() {
    let (bus, _) = bus().await;
    let ttl = AttachOptions::default().ttl(Duration::from_millis(50));
    let a = bus.queue("shared");
    let b = bus.queue("shared");
    a.attach(ttl.clone()).await.unwrap();
    b.attach(ttl).await.unwrap();

    a.detach().await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(b.exists().await.unwrap());
}

#[tokio::test]
async fn test_detach_stops_consume_session() {
    let (bus, _) = bus().await;
    let queue = bus.queue("detach-stop");
    queue.attach(AttachOptions::default()).await.unwrap();
    let mut events = queue.subscribe();
    queue.consume(ConsumeOptions::default()).await.unwrap();

    queue.detach().await.unwrap();
    wait_stopped(&mut events).await;
    assert!(!queue.is_consuming());
    assert!(!queue.is_attached());
}

#[tokio::test]
async fn test_find_resolves_local_queues() {
    let (bus, _) = bus().await;
    let queue = bus.queue("findable");
    assert_eq!(queue.find().await.unwrap(), None);

    queue
        .attach(AttachOptions::default().discoverable())
        .await
        .unwrap();
    assert_eq!(queue.find().await.unwrap(), Some(Location::Local));
    assert_eq!(bus.registry().lookup("findable"), Some(Location::Local));
}

#[tokio::test]
async fn test_is_discoverable_reflects_attach_flag() {
    let (bus, store) = bus().await;
    let plain = bus.queue("plain");
    plain.attach(AttachOptions::default()).await.unwrap();
    let visible = bus.queue("visible");
    visible
        .attach(AttachOptions::default().discoverable())
        .await
        .unwrap();

    assert!(!is_discoverable(&*store, "plain").await.unwrap());
    assert!(is_discoverable(&*store, "visible").await.unwrap());
    assert!(!is_discoverable(&*store, "missing").await.unwrap());
}

#[tokio::test]
async fn test_store_outage_fails_operations() {
    let (bus, store) = bus().await;
    let queue = bus.queue("outage");
    store.set_available(false);

    assert!(matches!(queue.push("x").await, Err(BusError::Store(_))));
    assert!(matches!(
        queue.attach(AttachOptions::default()).await,
        Err(BusError::Attach(_))
    ));
    assert!(!queue.is_attached());
}
