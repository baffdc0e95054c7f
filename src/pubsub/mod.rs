// Named publish/subscribe channels with automatic resubscribe.


use crate::bus::Core;
use crate::error::BusError;
use crate::events::Emitter;
use crate::federation::protocol::{to_reply, EntityKind, OpenArgs, PubSubCall};
use crate::federation::{Federate, RemoteHandle};
use crate::payload::Payload;
use crate::store::{Store, StoreEvent};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum PubSubEvent {
    Subscribed,
    Unsubscribed,
    Message(Payload),
    Error(BusError),
}

pub(crate) struct PubSubShared {
    name: String,
    events: Emitter<PubSubEvent>,
    subscribed: AtomicBool,
}

impl PubSubShared {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            events: Emitter::new(capacity),
            subscribed: AtomicBool::new(false),
        }
    }

    fn emit(&self, event: PubSubEvent) {
        match &event {
            PubSubEvent::Subscribed => self.subscribed.store(true, Ordering::SeqCst),
            PubSubEvent::Unsubscribed => self.subscribed.store(false, Ordering::SeqCst),
            _ => {}
        }
        self.events.emit(event);
    }
}

struct Forwarder {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub(crate) struct LocalPubSub {
    core: Arc<Core>,
    shared: Arc<PubSubShared>,
    channel: String,
    forwarder: Mutex<Option<Forwarder>>,
}

impl LocalPubSub {
    pub(crate) fn new(core: Arc<Core>, name: &str) -> Self {
        let shared = Arc::new(PubSubShared::new(name, core.config.events.capacity));
        Self {
            core,
            shared,
            channel: format!("fedbus:ps:{}", name),
            forwarder: Mutex::new(None),
        }
    }

    async fn subscribe(&self) -> Result<(), BusError> {
        let mut slot = self.forwarder.lock().await;
        if slot.as_ref().map_or(false, |f| !f.join.is_finished()) {
            return Ok(());
        }

        let lifecycle = self.core.store.lifecycle();
        let stream = self
            .core
            .store
            .subscribe(&self.channel)
            .await
            .map_err(BusError::store)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = ForwardTask {
            store: Arc::clone(&self.core.store),
            shared: Arc::clone(&self.shared),
            channel: self.channel.clone(),
            retry: self.core.config.queue.poll_interval(),
            lifecycle,
            stop_rx,
        };
        info!(pubsub = %self.shared.name, "Subscribed");
        self.shared.emit(PubSubEvent::Subscribed);
        *slot = Some(Forwarder {
            stop_tx,
            join: tokio::spawn(task.run(stream)),
        });
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), BusError> {
        let Some(forwarder) = self.forwarder.lock().await.take() else {
            return Ok(());
        };
        let _ = forwarder.stop_tx.send(true);
        if let Err(e) = forwarder.join.await {
            warn!(pubsub = %self.shared.name, error = %e, "Forwarder task failed");
        }
        info!(pubsub = %self.shared.name, "Unsubscribed");
        self.shared.emit(PubSubEvent::Unsubscribed);
        Ok(())
    }

    async fn publish(&self, payload: Payload) -> Result<usize, BusError> {
        self.core
            .store
            .publish(&self.channel, payload.into_bytes())
            .await
            .map_err(BusError::store)
    }
}

struct ForwardTask {
    store: Arc<dyn Store>,
    shared: Arc<PubSubShared>,
    channel: String,
    retry: Duration,
    lifecycle: broadcast::Receiver<StoreEvent>,
    stop_rx: watch::Receiver<bool>,
}

impl ForwardTask {
    async fn run(mut self, mut stream: BoxStream<'static, Vec<u8>>) {
        loop {
            let item = tokio::select! {
                _ = self.stop_rx.changed() => return,
                item = stream.next() => item,
            };
            match item {
                Some(raw) => self.shared.emit(PubSubEvent::Message(Payload::from(raw))),
                None => {
                    warn!(pubsub = %self.shared.name, "Subscription lost, waiting for store");
                    match self.resubscribe().await {
                        Some(restored) => stream = restored,
                        None => return,
                    }
                }
            }
        }
    }

    /// Wait for the store to come back and subscribe again. None means stop.
    async fn resubscribe(&mut self) -> Option<BoxStream<'static, Vec<u8>>> {
        loop {
            let retry = tokio::time::sleep(self.retry);
            let attempt = tokio::select! {
                _ = self.stop_rx.changed() => return None,
                event = self.lifecycle.recv() => match event {
                    Ok(StoreEvent::Online) => true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => false,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = retry => self.store.ping().await.is_ok(),
            };
            if !attempt {
                continue;
            }

            match self.store.subscribe(&self.channel).await {
                Ok(stream) => {
                    debug!(pubsub = %self.shared.name, "Resubscribed");
                    return Some(stream);
                }
                Err(e) => {
                    warn!(pubsub = %self.shared.name, error = %e, "Resubscribe failed");
                    self.shared.emit(PubSubEvent::Error(BusError::store(e)));
                }
            }
        }
    }
}

#[derive(Clone)]
enum PubSubDriver {
    Local(Arc<LocalPubSub>),
    Remote(RemoteHandle),
}

/// Handle to a named pub/sub channel.
///
/// Delivery is live only: messages published while nobody is subscribed,
/// or while the store is unreachable, are not kept.
#[derive(Clone)]
pub struct PubSub {
    shared: Arc<PubSubShared>,
    driver: PubSubDriver,
}

impl PubSub {
    pub(crate) fn local(engine: Arc<LocalPubSub>) -> Self {
        Self {
            shared: Arc::clone(&engine.shared),
            driver: PubSubDriver::Local(engine),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> broadcast::Receiver<PubSubEvent> {
        self.shared.events.subscribe()
    }

    pub async fn subscribe(&self) -> Result<(), BusError> {
        match &self.driver {
            PubSubDriver::Local(pubsub) => pubsub.subscribe().await,
            PubSubDriver::Remote(remote) => remote.call(PubSubCall::Subscribe).await,
        }
    }

    pub async fn unsubscribe(&self) -> Result<(), BusError> {
        match &self.driver {
            PubSubDriver::Local(pubsub) => pubsub.unsubscribe().await,
            PubSubDriver::Remote(remote) => remote.call(PubSubCall::Unsubscribe).await,
        }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub async fn publish(&self, payload: impl Into<Payload>) -> Result<usize, BusError> {
        let payload = payload.into();
        match &self.driver {
            PubSubDriver::Local(pubsub) => pubsub.publish(payload).await,
            PubSubDriver::Remote(remote) => remote.call(PubSubCall::Publish(payload)).await,
        }
    }

    pub(crate) async fn execute(&self, call: PubSubCall) -> Result<Value, BusError> {
        match call {
            PubSubCall::Subscribe => to_reply(self.subscribe().await?),
            PubSubCall::Unsubscribe => to_reply(self.unsubscribe().await?),
            PubSubCall::Publish(payload) => to_reply(self.publish(payload).await?),
        }
    }

    pub(crate) async fn teardown(&self) {
        if let Err(e) = self.unsubscribe().await {
            debug!(pubsub = %self.name(), error = %e, "Unsubscribe on teardown failed");
        }
    }
}

impl Federate for PubSub {
    const KIND: EntityKind = EntityKind::Pubsub;

    fn entity_name(&self) -> String {
        self.shared.name.clone()
    }

    fn open_args(&self) -> OpenArgs {
        OpenArgs::default()
    }

    fn remote(&self, handle: RemoteHandle) -> Self {
        Self {
            shared: Arc::new(PubSubShared::new(
                &self.shared.name,
                self.shared.events.capacity(),
            )),
            driver: PubSubDriver::Remote(handle),
        }
    }

    fn relay(&self, event: Value) -> Result<(), BusError> {
        let event: PubSubEvent = serde_json::from_value(event).map_err(BusError::protocol)?;
        self.shared.emit(event);
        Ok(())
    }
}
