// Bidirectional two-endpoint channels.

mod endpoint;


use crate::bus::Core;
use crate::error::BusError;
use crate::events::Emitter;
use crate::federation::protocol::{to_reply, ChannelCall, EntityKind, OpenArgs};
use crate::federation::{Federate, RemoteHandle};
use crate::payload::Payload;
use endpoint::{presence_key, ChannelFrame, Control, EndpointContext, EndpointHandle, EndpointKeys};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Options for `Channel::connect` and `Channel::listen`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Keep received messages until acked and replay them on reconnect
    #[serde(default)]
    pub reliable: bool,
}

impl ChannelOptions {
    pub fn reliable() -> Self {
        Self { reliable: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// This endpoint is connected
    Connect,
    /// The peer endpoint is connected
    RemoteConnect,
    /// `id` is set when the receiving endpoint is reliable; pass it to `ack`
    Message { payload: Payload, id: Option<u64> },
    /// The peer ended the conversation
    End,
    Disconnect,
    Error(BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Ended = 3,
    Disconnected = 4,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Ended,
            4 => Self::Disconnected,
            _ => Self::Idle,
        }
    }
}

pub(crate) struct ChannelShared {
    name: String,
    local: String,
    remote: String,
    events: Emitter<ChannelEvent>,
    state: AtomicU8,
    /// Peer endpoint id RemoteConnect already fired for
    remote_seen: Mutex<Option<String>>,
}

impl ChannelShared {
    fn new(name: &str, local: &str, remote: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            local: local.to_string(),
            remote: remote.to_string(),
            events: Emitter::new(capacity),
            state: AtomicU8::new(ChannelState::Idle as u8),
            remote_seen: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        match &event {
            ChannelEvent::Connect => self.set_state(ChannelState::Connected),
            ChannelEvent::End => self.set_state(ChannelState::Ended),
            ChannelEvent::Disconnect => self.set_state(ChannelState::Disconnected),
            _ => {}
        }
        debug!(channel = %self.name, event = ?event, "Channel event");
        self.events.emit(event);
    }

    fn reset_remote(&self) {
        *self.remote_seen.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Fire RemoteConnect once per peer connection
    pub(crate) fn remote_connected(&self, endpoint: &str) {
        {
            let mut seen = self.remote_seen.lock().unwrap_or_else(PoisonError::into_inner);
            if seen.as_deref() == Some(endpoint) {
                return;
            }
            *seen = Some(endpoint.to_string());
        }
        self.emit(ChannelEvent::RemoteConnect);
    }
}

/// An open endpoint: which side we are and the task receiving for it
struct Endpoint {
    own: EndpointKeys,
    peer: EndpointKeys,
    endpoint_id: String,
    receiver: Option<EndpointHandle>,
}

pub(crate) struct LocalChannel {
    core: Arc<Core>,
    shared: Arc<ChannelShared>,
    endpoint: tokio::sync::Mutex<Option<Endpoint>>,
}

impl LocalChannel {
    pub(crate) fn new(core: Arc<Core>, name: &str, local: &str, remote: &str) -> Self {
        let shared = Arc::new(ChannelShared::new(
            name,
            local,
            remote,
            core.config.events.capacity,
        ));
        Self {
            core,
            shared,
            endpoint: tokio::sync::Mutex::new(None),
        }
    }

    async fn open(&self, own_tag: &str, peer_tag: &str, options: ChannelOptions) -> Result<(), BusError> {
        let mut slot = self.endpoint.lock().await;
        if self.shared.state() == ChannelState::Connected {
            return Err(BusError::AlreadyConnected);
        }
        if let Some(receiver) = slot.as_mut().and_then(|e| e.receiver.take()) {
            receiver.stop().await;
        }

        self.shared.set_state(ChannelState::Connecting);
        let name = self.shared.name().to_string();
        let own = EndpointKeys::new(&name, own_tag);
        let peer = EndpointKeys::new(&name, peer_tag);
        let endpoint_id = uuid::Uuid::new_v4().to_string();
        let store = Arc::clone(&self.core.store);
        let presence = presence_key(&name);

        let registered = async {
            let control = store.subscribe(&own.ctl).await?;
            store
                .hash_set(&presence, own_tag, endpoint_id.as_bytes().to_vec())
                .await?;
            anyhow::Ok(control)
        }
        .await;
        let control = match registered {
            Ok(control) => control,
            Err(e) => {
                self.shared.set_state(ChannelState::Disconnected);
                return Err(BusError::channel(e));
            }
        };

        self.shared.reset_remote();
        info!(channel = %name, tag = %own_tag, reliable = options.reliable, "Channel connected");
        self.shared.emit(ChannelEvent::Connect);

        let receiver = EndpointHandle::spawn(
            EndpointContext {
                store: Arc::clone(&store),
                shared: Arc::clone(&self.shared),
                own: own.clone(),
                endpoint_id: endpoint_id.clone(),
                reliable: options.reliable,
                poll_interval: self.core.config.queue.poll_interval(),
            },
            control,
        );

        match store.hash_get(&presence, peer_tag).await {
            Ok(Some(peer_id)) => {
                self.shared
                    .remote_connected(&String::from_utf8_lossy(&peer_id));
                self.notify(&peer, &Control::Hello {
                    endpoint: endpoint_id.clone(),
                })
                .await;
            }
            Ok(None) => {}
            Err(e) => warn!(channel = %name, error = %e, "Failed to look up peer presence"),
        }

        *slot = Some(Endpoint {
            own,
            peer,
            endpoint_id,
            receiver: Some(receiver),
        });
        Ok(())
    }

    async fn notify(&self, peer: &EndpointKeys, control: &Control) {
        let encoded = match serde_json::to_vec(control) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(channel = %self.shared.name(), error = %e, "Failed to encode control message");
                return;
            }
        };
        if let Err(e) = self.core.store.publish(&peer.ctl, encoded).await {
            warn!(channel = %self.shared.name(), error = %e, "Failed to notify peer");
        }
    }

    async fn deliver(&self, peer: &EndpointKeys, frame: &ChannelFrame) -> Result<u64, BusError> {
        let encoded = serde_json::to_vec(frame).map_err(BusError::protocol)?;
        let seq = self
            .core
            .store
            .list_push(&peer.inbox, &peer.seq, encoded)
            .await
            .map_err(BusError::channel)?;
        self.notify(peer, &Control::Pushed).await;
        Ok(seq)
    }

    async fn peer(&self) -> Result<EndpointKeys, BusError> {
        if self.shared.state() != ChannelState::Connected {
            return Err(BusError::NotConnected);
        }
        self.endpoint
            .lock()
            .await
            .as_ref()
            .map(|e| e.peer.clone())
            .ok_or(BusError::NotConnected)
    }

    async fn send(&self, payload: Payload) -> Result<u64, BusError> {
        let peer = self.peer().await?;
        self.deliver(&peer, &ChannelFrame::Message(payload)).await
    }

    async fn ack(&self, seq: u64) -> Result<(), BusError> {
        let inbox = self
            .endpoint
            .lock()
            .await
            .as_ref()
            .map(|e| e.own.inbox.clone())
            .ok_or(BusError::NotConnected)?;
        self.core
            .store
            .list_remove_through(&inbox, seq)
            .await
            .map_err(BusError::channel)?;
        Ok(())
    }

    /// Stop receiving and withdraw presence. Returns false when nothing was open.
    async fn close(&self) -> Result<bool, BusError> {
        let mut slot = self.endpoint.lock().await;
        let Some(endpoint) = slot.as_mut() else {
            return Ok(false);
        };
        let Some(receiver) = endpoint.receiver.take() else {
            return Ok(false);
        };
        receiver.stop().await;
        self.core
            .store
            .hash_cas(
                &presence_key(self.shared.name()),
                &endpoint.own.tag,
                Some(endpoint.endpoint_id.as_bytes()),
                None,
            )
            .await
            .map_err(BusError::channel)?;
        Ok(true)
    }

    async fn end(&self) -> Result<(), BusError> {
        let peer = self.peer().await?;
        self.deliver(&peer, &ChannelFrame::End).await?;
        self.close().await?;
        self.shared.set_state(ChannelState::Ended);
        info!(channel = %self.shared.name(), "Channel ended");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let was_open = self.close().await?;
        let state = self.shared.state();
        if !was_open && state != ChannelState::Ended {
            return Ok(());
        }
        info!(channel = %self.shared.name(), "Channel disconnected");
        self.shared.emit(ChannelEvent::Disconnect);
        Ok(())
    }
}

#[derive(Clone)]
enum ChannelDriver {
    Local(Arc<LocalChannel>),
    Remote(RemoteHandle),
}

/// Handle to one side of a named channel.
///
/// Two parties use the same channel name with swapped tags: one calls
/// `connect`, the other `listen`. Each side sends to the other's inbox.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    driver: ChannelDriver,
}

impl Channel {
    pub(crate) fn local(engine: Arc<LocalChannel>) -> Self {
        Self {
            shared: Arc::clone(&engine.shared),
            driver: ChannelDriver::Local(engine),
        }
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn local_tag(&self) -> &str {
        &self.shared.local
    }

    pub fn remote_tag(&self) -> &str {
        &self.shared.remote
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    /// Open the local-tag side
    pub async fn connect(&self, options: ChannelOptions) -> Result<(), BusError> {
        match &self.driver {
            ChannelDriver::Local(channel) => {
                channel
                    .open(&self.shared.local, &self.shared.remote, options)
                    .await
            }
            ChannelDriver::Remote(remote) => remote.call(ChannelCall::Connect(options)).await,
        }
    }

    /// Open the remote-tag side, i.e. `connect` with the tags swapped
    pub async fn listen(&self, options: ChannelOptions) -> Result<(), BusError> {
        match &self.driver {
            ChannelDriver::Local(channel) => {
                channel
                    .open(&self.shared.remote, &self.shared.local, options)
                    .await
            }
            ChannelDriver::Remote(remote) => remote.call(ChannelCall::Listen(options)).await,
        }
    }

    /// Send a message to the peer. Returns its sequence number in the peer inbox.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<u64, BusError> {
        let payload = payload.into();
        match &self.driver {
            ChannelDriver::Local(channel) => channel.send(payload).await,
            ChannelDriver::Remote(remote) => remote.call(ChannelCall::Send(payload)).await,
        }
    }

    /// Acknowledge every received message up to `id`
    pub async fn ack(&self, id: u64) -> Result<(), BusError> {
        match &self.driver {
            ChannelDriver::Local(channel) => channel.ack(id).await,
            ChannelDriver::Remote(remote) => remote.call(ChannelCall::Ack(id)).await,
        }
    }

    /// Tell the peer we are done. Only the peer observes `End`.
    pub async fn end(&self) -> Result<(), BusError> {
        match &self.driver {
            ChannelDriver::Local(channel) => channel.end().await,
            ChannelDriver::Remote(remote) => remote.call(ChannelCall::End).await,
        }
    }

    /// Stop receiving. Unacked reliable messages stay in the inbox.
    pub async fn disconnect(&self) -> Result<(), BusError> {
        match &self.driver {
            ChannelDriver::Local(channel) => channel.disconnect().await,
            ChannelDriver::Remote(remote) => remote.call(ChannelCall::Disconnect).await,
        }
    }

    pub(crate) async fn execute(&self, call: ChannelCall) -> Result<Value, BusError> {
        match call {
            ChannelCall::Connect(options) => to_reply(self.connect(options).await?),
            ChannelCall::Listen(options) => to_reply(self.listen(options).await?),
            ChannelCall::Send(payload) => to_reply(self.send(payload).await?),
            ChannelCall::Ack(id) => to_reply(self.ack(id).await?),
            ChannelCall::End => to_reply(self.end().await?),
            ChannelCall::Disconnect => to_reply(self.disconnect().await?),
        }
    }

    pub(crate) async fn teardown(&self) {
        if let Err(e) = self.disconnect().await {
            debug!(channel = %self.name(), error = %e, "Disconnect on teardown failed");
        }
    }
}

impl Federate for Channel {
    const KIND: EntityKind = EntityKind::Channel;

    fn entity_name(&self) -> String {
        self.shared.name.clone()
    }

    fn open_args(&self) -> OpenArgs {
        OpenArgs {
            local: Some(self.shared.local.clone()),
            remote: Some(self.shared.remote.clone()),
            fields: Vec::new(),
        }
    }

    fn remote(&self, handle: RemoteHandle) -> Self {
        Self {
            shared: Arc::new(ChannelShared::new(
                &self.shared.name,
                &self.shared.local,
                &self.shared.remote,
                self.shared.events.capacity(),
            )),
            driver: ChannelDriver::Remote(handle),
        }
    }

    fn relay(&self, event: Value) -> Result<(), BusError> {
        let event: ChannelEvent = serde_json::from_value(event).map_err(BusError::protocol)?;
        self.shared.emit(event);
        Ok(())
    }
}
