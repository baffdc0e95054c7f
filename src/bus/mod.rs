// Bus: store connection, entity factories and federation entry points.

#[cfg(test)]
mod tests;

use crate::auth::SecretVerifier;
use crate::channel::{Channel, LocalChannel};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::events::Emitter;
use crate::federation::{create_federation_router, Federate, FederationLink, FederationPool, FederationState};
use crate::persisted::Persisted;
use crate::pubsub::{LocalPubSub, PubSub};
use crate::queue::{LocalQueue, Queue};
use crate::registry::LocationRegistry;
use crate::store::{Store, StoreEvent};
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything an entity engine needs from its bus
pub(crate) struct Core {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) registry: Arc<LocationRegistry>,
    pub(crate) federation: FederationPool,
    pub(crate) config: BusConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Online,
    Offline,
    Error(BusError),
    /// First authorized tunnel to this url
    Federating(String),
}

struct BusInner {
    id: String,
    core: Arc<Core>,
    events: Emitter<BusEvent>,
    online: Arc<AtomicBool>,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point of a message bus.
///
/// Cheap to clone. Entities created from a bus share its store connection,
/// its discovery registry and its pool of federation tunnels.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(config: BusConfig, store: Arc<dyn Store>) -> Self {
        let events = Emitter::new(config.events.capacity);
        let registry = Arc::new(LocationRegistry::new());
        let federation = FederationPool::new(
            config.federation.clone(),
            Arc::clone(&registry),
            events.clone(),
        );
        Self {
            inner: Arc::new(BusInner {
                id: Uuid::new_v4().to_string(),
                core: Arc::new(Core {
                    store,
                    registry,
                    federation,
                    config,
                }),
                events,
                online: Arc::new(AtomicBool::new(false)),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.core.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.inner.core.registry
    }

    pub fn federation(&self) -> &FederationPool {
        &self.inner.core.federation
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.inner.core.store
    }

    /// Bring the bus online: check the store, start mirroring its lifecycle
    /// and open tunnels to the configured federation urls.
    pub async fn connect(&self) -> Result<(), BusError> {
        if self.is_online() {
            let err = BusError::AlreadyConnected;
            self.inner.events.emit(BusEvent::Error(err.clone()));
            return Err(err);
        }

        let core = &self.inner.core;
        if let Err(e) = core.store.ping().await {
            let err = BusError::Connection(format!("{:#}", e));
            error!(bus = %self.inner.id, error = %err, "Store unreachable");
            self.inner.events.emit(BusEvent::Error(err.clone()));
            return Err(err);
        }

        self.inner.online.store(true, Ordering::SeqCst);
        info!(bus = %self.inner.id, "Bus online");
        self.inner.events.emit(BusEvent::Online);

        let mirror = tokio::spawn(mirror_lifecycle(
            self.inner.id.clone(),
            core.store.lifecycle(),
            self.inner.events.clone(),
            Arc::clone(&self.inner.online),
        ));
        if let Some(previous) = self.inner.lifecycle.lock().await.replace(mirror) {
            previous.abort();
        }

        for url in &core.config.federation.urls {
            core.federation.warm(url);
        }
        Ok(())
    }

    /// Close every tunnel and go offline
    pub async fn disconnect(&self) {
        if let Some(mirror) = self.inner.lifecycle.lock().await.take() {
            mirror.abort();
        }
        self.inner.core.federation.shutdown();
        if self.inner.online.swap(false, Ordering::SeqCst) {
            info!(bus = %self.inner.id, "Bus offline");
            self.inner.events.emit(BusEvent::Offline);
        }
    }

    pub fn queue(&self, name: &str) -> Queue {
        Queue::local(Arc::new(LocalQueue::new(Arc::clone(&self.inner.core), name)))
    }

    /// Channel `name` seen from the `local` tag, talking to the `remote` tag
    pub fn channel(&self, name: &str, local: &str, remote: &str) -> Channel {
        Channel::local(Arc::new(LocalChannel::new(
            Arc::clone(&self.inner.core),
            name,
            local,
            remote,
        )))
    }

    pub fn pubsub(&self, name: &str) -> PubSub {
        PubSub::local(Arc::new(LocalPubSub::new(Arc::clone(&self.inner.core), name)))
    }

    pub fn persistify<I>(&self, name: &str, fields: I) -> Persisted
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Persisted::local(
            Arc::clone(&self.inner.core),
            name,
            fields.into_iter().map(Into::into).collect(),
        )
    }

    /// Open a federation link for `entity` on the bus at `url`.
    ///
    /// The link's handle becomes usable once `FederationLink::ready` resolves.
    pub async fn federate<E: Federate>(
        &self,
        entity: &E,
        url: &str,
    ) -> Result<FederationLink<E>, BusError> {
        if !self.is_online() {
            return Err(BusError::NotConnected);
        }
        self.inner.core.federation.link(entity, url).await
    }

    /// Router accepting federation tunnels into this bus
    pub fn federation_router(&self, verifier: SecretVerifier) -> Router {
        let state = Arc::new(FederationState {
            bus: self.clone(),
            verifier,
        });
        create_federation_router(state, &self.inner.core.config.federation.path)
    }
}

async fn mirror_lifecycle(
    bus: String,
    mut lifecycle: broadcast::Receiver<StoreEvent>,
    events: Emitter<BusEvent>,
    online: Arc<AtomicBool>,
) {
    loop {
        match lifecycle.recv().await {
            Ok(StoreEvent::Online) => {
                if !online.swap(true, Ordering::SeqCst) {
                    info!(bus = %bus, "Store reconnected");
                    events.emit(BusEvent::Online);
                }
            }
            Ok(StoreEvent::Offline) => {
                if online.swap(false, Ordering::SeqCst) {
                    warn!(bus = %bus, "Store connection lost");
                    events.emit(BusEvent::Offline);
                }
            }
            Ok(StoreEvent::Error(reason)) => {
                warn!(bus = %bus, error = %reason, "Store error");
                events.emit(BusEvent::Error(BusError::Connection(reason)));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(bus = %bus, skipped = skipped, "Store lifecycle lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
