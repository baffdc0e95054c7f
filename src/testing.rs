use crate::bus::Bus;
use crate::config::BusConfig;
use crate::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub(crate) fn fast_config() -> BusConfig {
    let mut config = BusConfig::default();
    config.queue.poll_interval_ms = 25;
    config
}

/// A connected bus on its own store
pub(crate) async fn bus() -> (Bus, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let bus = shared_bus(&store).await;
    (bus, store)
}

/// A connected bus on an existing store, like a second process
pub(crate) async fn shared_bus(store: &Arc<MemoryStore>) -> Bus {
    let bus = Bus::new(fast_config(), Arc::clone(store) as Arc<dyn crate::store::Store>);
    bus.connect().await.unwrap();
    bus
}

pub(crate) async fn next_event<E: Clone>(events: &mut broadcast::Receiver<E>) -> E {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until `matches` accepts one
pub(crate) async fn wait_for<E, F>(events: &mut broadcast::Receiver<E>, mut matches: F) -> E
where
    E: Clone,
    F: FnMut(&E) -> bool,
{
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Assert nothing arrives for a short while
pub(crate) async fn assert_quiet<E: Clone + std::fmt::Debug>(events: &mut broadcast::Receiver<E>) {
    if let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(150), events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}
