// Durable FIFO queues with attach accounting and reliable consumption.

mod engine;
mod keys;
mod session;

#[cfg(test)]
mod tests;

pub(crate) use engine::{is_discoverable, LocalQueue};

use crate::error::BusError;
use crate::events::Emitter;
use crate::federation::protocol::{to_reply, EntityKind, OpenArgs, QueueCall};
use crate::federation::{Federate, RemoteHandle};
use crate::payload::Payload;
use crate::registry::Location;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Options for `Queue::attach`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachOptions {
    /// Expiry armed once the last attachment detaches. `None` uses the bus
    /// default, zero never expires.
    #[serde(default)]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub discoverable: bool,
}

impl AttachOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn discoverable(mut self) -> Self {
        self.discoverable = true;
        self
    }
}

/// Options for `Queue::consume`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeOptions {
    /// Stop after this many deliveries
    #[serde(default)]
    pub max: Option<u64>,
    /// Remove messages from the log once consumed (or acked, when reliable)
    #[serde(default = "default_remove")]
    pub remove: bool,
    #[serde(default)]
    pub reliable: bool,
    /// Treat every id up to and including this one as already acknowledged
    #[serde(default)]
    pub last: Option<u64>,
}

fn default_remove() -> bool {
    true
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            max: None,
            remove: default_remove(),
            reliable: false,
            last: None,
        }
    }
}

impl ConsumeOptions {
    pub fn max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    pub fn keep(mut self) -> Self {
        self.remove = false;
        self
    }

    pub fn last(mut self, last: u64) -> Self {
        self.last = Some(last);
        self
    }
}

/// Observable queue events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum QueueEvent {
    Attaching,
    Attached { existed: bool },
    Detaching,
    Detached,
    /// `id` is only set for reliable deliveries
    Message { payload: Payload, id: Option<u64> },
    Consuming(bool),
    Error(BusError),
}

/// State every handle of one queue observes, local or proxied
pub(crate) struct QueueShared {
    name: String,
    events: Emitter<QueueEvent>,
    attached: AtomicBool,
    consuming: AtomicBool,
    pushed: AtomicU64,
    consumed: AtomicU64,
}

impl QueueShared {
    pub(crate) fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            events: Emitter::new(capacity),
            attached: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
            pushed: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn emit(&self, event: QueueEvent) {
        match &event {
            QueueEvent::Attached { .. } => self.attached.store(true, Ordering::SeqCst),
            QueueEvent::Detached => self.attached.store(false, Ordering::SeqCst),
            QueueEvent::Consuming(active) => self.consuming.store(*active, Ordering::SeqCst),
            QueueEvent::Message { .. } => {
                self.consumed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        debug!(queue = %self.name, event = ?event, "Queue event");
        self.events.emit(event);
    }
}

#[derive(Clone)]
enum QueueDriver {
    Local(Arc<LocalQueue>),
    Remote(RemoteHandle),
}

/// Handle to a named queue.
///
/// Cheap to clone; clones share events and state. A handle returned by a
/// federation link forwards every operation to the owning remote bus.
#[derive(Clone)]
pub struct Queue {
    shared: Arc<QueueShared>,
    driver: QueueDriver,
}

impl Queue {
    pub(crate) fn local(engine: Arc<LocalQueue>) -> Self {
        Self {
            shared: engine.shared(),
            driver: QueueDriver::Local(engine),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Observe events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_attached(&self) -> bool {
        self.shared.attached.load(Ordering::SeqCst)
    }

    pub fn is_consuming(&self) -> bool {
        self.shared.consuming.load(Ordering::SeqCst)
    }

    /// Messages pushed through this handle
    pub fn pushed(&self) -> u64 {
        self.shared.pushed.load(Ordering::SeqCst)
    }

    /// Messages delivered to this handle
    pub fn consumed(&self) -> u64 {
        self.shared.consumed.load(Ordering::SeqCst)
    }

    pub fn is_federated(&self) -> bool {
        matches!(self.driver, QueueDriver::Remote(_))
    }

    pub async fn attach(&self, options: AttachOptions) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.attach(options).await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Attach(options)).await,
        }
    }

    pub async fn detach(&self) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.detach().await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Detach).await,
        }
    }

    /// Append a message. Returns its id.
    pub async fn push(&self, payload: impl Into<Payload>) -> Result<u64, BusError> {
        let payload = payload.into();
        let id = match &self.driver {
            QueueDriver::Local(queue) => queue.push(payload).await?,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Push(payload)).await?,
        };
        self.shared.pushed.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    /// Start a consume session. Messages arrive as `QueueEvent::Message`.
    pub async fn consume(&self, options: ConsumeOptions) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.consume(options).await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Consume(options)).await,
        }
    }

    /// Acknowledge a reliable delivery
    pub async fn ack(&self, id: u64) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.ack(id).await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Ack(id)).await,
        }
    }

    /// Stop the consume session, if any
    pub async fn stop(&self) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => {
                queue.stop().await;
                Ok(())
            }
            QueueDriver::Remote(remote) => remote.call(QueueCall::Stop).await,
        }
    }

    /// Messages currently in the log
    pub async fn count(&self) -> Result<usize, BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.count().await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Count).await,
        }
    }

    /// Drop every message in the log
    pub async fn flush(&self) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.flush().await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Flush).await,
        }
    }

    pub async fn exists(&self) -> Result<bool, BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.exists().await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Exists).await,
        }
    }

    /// Resolve where this queue lives: locally, on a federated bus, or nowhere
    pub async fn find(&self) -> Result<Option<Location>, BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.find().await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::Find).await,
        }
    }

    pub async fn metadata_get(&self, key: &str) -> Result<Option<String>, BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.metadata_get(key).await,
            QueueDriver::Remote(remote) => {
                remote.call(QueueCall::MetadataGet(key.to_string())).await
            }
        }
    }

    pub async fn metadata_set(&self, key: &str, value: &str) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.metadata_set(key, value).await,
            QueueDriver::Remote(remote) => {
                remote
                    .call(QueueCall::MetadataSet {
                        key: key.to_string(),
                        value: value.to_string(),
                    })
                    .await
            }
        }
    }

    pub async fn metadata_set_many(&self, values: HashMap<String, String>) -> Result<(), BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.metadata_set_many(values).await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::MetadataSetMany(values)).await,
        }
    }

    pub async fn metadata_all(&self) -> Result<HashMap<String, String>, BusError> {
        match &self.driver {
            QueueDriver::Local(queue) => queue.metadata_all().await,
            QueueDriver::Remote(remote) => remote.call(QueueCall::MetadataAll).await,
        }
    }

    /// Run a call received over a federation link against this handle
    pub(crate) async fn execute(&self, call: QueueCall) -> Result<Value, BusError> {
        match call {
            QueueCall::Attach(options) => to_reply(self.attach(options).await?),
            QueueCall::Detach => to_reply(self.detach().await?),
            QueueCall::Push(payload) => to_reply(self.push(payload).await?),
            QueueCall::Consume(options) => to_reply(self.consume(options).await?),
            QueueCall::Ack(id) => to_reply(self.ack(id).await?),
            QueueCall::Stop => to_reply(self.stop().await?),
            QueueCall::Count => to_reply(self.count().await?),
            QueueCall::Flush => to_reply(self.flush().await?),
            QueueCall::Exists => to_reply(self.exists().await?),
            QueueCall::Find => to_reply(self.find().await?),
            QueueCall::MetadataGet(key) => to_reply(self.metadata_get(&key).await?),
            QueueCall::MetadataSet { key, value } => {
                to_reply(self.metadata_set(&key, &value).await?)
            }
            QueueCall::MetadataSetMany(values) => to_reply(self.metadata_set_many(values).await?),
            QueueCall::MetadataAll => to_reply(self.metadata_all().await?),
        }
    }

    /// Release whatever a hosted link left behind
    pub(crate) async fn teardown(&self) {
        if self.is_attached() {
            if let Err(e) = self.detach().await {
                debug!(queue = %self.name(), error = %e, "Detach on teardown failed");
            }
        } else {
            let _ = self.stop().await;
        }
    }
}

impl Federate for Queue {
    const KIND: EntityKind = EntityKind::Queue;

    fn entity_name(&self) -> String {
        self.shared.name.clone()
    }

    fn open_args(&self) -> OpenArgs {
        OpenArgs::default()
    }

    fn remote(&self, handle: RemoteHandle) -> Self {
        Self {
            shared: Arc::new(QueueShared::new(
                &self.shared.name,
                self.shared.events.capacity(),
            )),
            driver: QueueDriver::Remote(handle),
        }
    }

    fn relay(&self, event: Value) -> Result<(), BusError> {
        let event: QueueEvent = serde_json::from_value(event).map_err(BusError::protocol)?;
        self.shared.emit(event);
        Ok(())
    }
}
