use super::protocol::{
    encode_call, EntityKind, OpenArgs, RemoteCall, Replay, RpcRequest, METHOD_CLOSE, METHOD_OPEN,
};
use super::tunnel::{Command, LinkSignal, TunnelHandle};
use crate::error::BusError;
use crate::events::Emitter;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// An entity that can be hosted by a remote bus and driven through a proxy
pub trait Federate: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn entity_name(&self) -> String;

    /// Construction arguments the remote bus needs to build the real entity
    fn open_args(&self) -> OpenArgs;

    /// A handle of the same type whose operations go through `handle`
    fn remote(&self, handle: RemoteHandle) -> Self;

    /// Re-emit an event relayed from the remote entity
    fn relay(&self, event: Value) -> Result<(), BusError>;
}

/// Addressing of one federated entity on one tunnel
#[derive(Clone)]
pub struct RemoteHandle {
    tunnel: TunnelHandle,
    link_id: u64,
    kind: EntityKind,
    name: String,
}

impl RemoteHandle {
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn url(&self) -> &str {
        self.tunnel.url()
    }

    pub(crate) async fn call<C, T>(&self, call: C) -> Result<T, BusError>
    where
        C: RemoteCall,
        T: DeserializeOwned,
    {
        let replay = call.replay();
        let (method, args) = encode_call(&call)?;
        let value = self.invoke(method, args, replay).await?;
        serde_json::from_value(value).map_err(BusError::protocol)
    }

    async fn invoke(&self, method: String, args: Value, replay: Replay) -> Result<Value, BusError> {
        let request = RpcRequest {
            correlation_id: self.tunnel.next_id(),
            link_id: self.link_id,
            entity_type: self.kind,
            entity_name: self.name.clone(),
            method,
            args,
        };
        debug!(
            url = %self.tunnel.url(),
            link_id = self.link_id,
            correlation_id = request.correlation_id,
            method = %request.method,
            "Remote call"
        );
        self.tunnel.call(request, replay).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Pending,
    Ready,
    Unauthorized,
    Failed(BusError),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Ready,
    Unauthorized,
    Close,
    Error(BusError),
}

/// A local proxy bound to an entity hosted by a remote bus.
///
/// The proxy returned by `ready()` has the same type as the local entity it
/// was created from; its operations run on the remote bus and the remote
/// entity's events are re-emitted on it.
pub struct FederationLink<E: Federate> {
    remote: RemoteHandle,
    proxy: E,
    state_tx: Arc<watch::Sender<LinkState>>,
    events: Emitter<LinkEvent>,
    pump: JoinHandle<()>,
}

impl<E: Federate> FederationLink<E> {
    pub(crate) fn open(tunnel: TunnelHandle, entity: &E, capacity: usize) -> Result<Self, BusError> {
        let link_id = tunnel.next_id();
        let remote = RemoteHandle {
            tunnel: tunnel.clone(),
            link_id,
            kind: E::KIND,
            name: entity.entity_name(),
        };
        let proxy = entity.remote(remote.clone());
        let open = RpcRequest {
            correlation_id: link_id,
            link_id,
            entity_type: E::KIND,
            entity_name: remote.name.clone(),
            method: METHOD_OPEN.to_string(),
            args: serde_json::to_value(entity.open_args()).map_err(BusError::protocol)?,
        };

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        tunnel.send(Command::Attach {
            link_id,
            open,
            signals: signals_tx,
        })?;

        let (state_tx, _) = watch::channel(LinkState::Pending);
        let state_tx = Arc::new(state_tx);
        let events = Emitter::new(capacity);
        let pump = tokio::spawn(pump(
            signals_rx,
            proxy.clone(),
            Arc::clone(&state_tx),
            events.clone(),
            remote.clone(),
        ));

        Ok(Self {
            remote,
            proxy,
            state_tx,
            events,
            pump,
        })
    }

    pub fn id(&self) -> u64 {
        self.remote.link_id
    }

    pub fn url(&self) -> &str {
        self.remote.url()
    }

    pub fn state(&self) -> LinkState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Wait until the remote bus accepted the link, then return the proxy
    pub async fn ready(&self) -> Result<E, BusError> {
        let mut state = self.state_tx.subscribe();
        loop {
            let outcome = match &*state.borrow_and_update() {
                LinkState::Pending => None,
                LinkState::Ready => Some(Ok(self.proxy.clone())),
                LinkState::Unauthorized => Some(Err(BusError::Unauthorized)),
                LinkState::Failed(e) => Some(Err(e.clone())),
                LinkState::Closed => Some(Err(BusError::Transport(
                    "federation link closed".to_string(),
                ))),
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            if state.changed().await.is_err() {
                return Err(BusError::Transport("federation link closed".to_string()));
            }
        }
    }

    /// Tear the remote entity down, then close locally
    pub async fn close(&self) -> Result<(), BusError> {
        if self.state() == LinkState::Closed {
            return Ok(());
        }
        let remote = match tokio::time::timeout(
            CLOSE_TIMEOUT,
            self.remote.invoke(METHOD_CLOSE.to_string(), Value::Null, Replay::None),
        )
        .await
        {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(BusError::Timeout("closing federation link".to_string())),
        };
        if let Err(e) = &remote {
            warn!(url = %self.url(), link_id = self.id(), error = %e, "Remote close failed");
        }

        let _ = self.remote.tunnel.send(Command::Detach {
            link_id: self.remote.link_id,
        });
        self.state_tx.send_replace(LinkState::Closed);
        self.pump.abort();
        info!(url = %self.url(), link_id = self.id(), "Federation link closed");
        self.events.emit(LinkEvent::Close);
        remote
    }
}

impl<E: Federate> Drop for FederationLink<E> {
    fn drop(&mut self) {
        if *self.state_tx.borrow() != LinkState::Closed {
            let _ = self.remote.tunnel.send(Command::Detach {
                link_id: self.remote.link_id,
            });
        }
        self.pump.abort();
    }
}

/// Turn tunnel signals into link state, link events and relayed entity events
async fn pump<E: Federate>(
    mut signals: mpsc::UnboundedReceiver<LinkSignal>,
    proxy: E,
    state: Arc<watch::Sender<LinkState>>,
    events: Emitter<LinkEvent>,
    remote: RemoteHandle,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            LinkSignal::Authorized => {
                info!(url = %remote.url(), link_id = remote.link_id, entity = %remote.name, "Federation link ready");
                state.send_replace(LinkState::Ready);
                events.emit(LinkEvent::Ready);
            }
            LinkSignal::Unauthorized => {
                warn!(url = %remote.url(), link_id = remote.link_id, "Federation link unauthorized");
                state.send_replace(LinkState::Unauthorized);
                events.emit(LinkEvent::Unauthorized);
            }
            LinkSignal::Event(event) => {
                if let Err(e) = proxy.relay(event) {
                    warn!(link_id = remote.link_id, error = %e, "Failed to relay remote event");
                    events.emit(LinkEvent::Error(e));
                }
            }
            LinkSignal::Error(e) => {
                if *state.borrow() == LinkState::Pending {
                    state.send_replace(LinkState::Failed(e.clone()));
                }
                events.emit(LinkEvent::Error(e));
            }
            LinkSignal::Closed => {
                state.send_replace(LinkState::Closed);
                events.emit(LinkEvent::Close);
                break;
            }
        }
    }
}
