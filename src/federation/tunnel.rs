//! One pooled WebSocket tunnel to a remote bus.
//!
//! The tunnel is a background task that owns the socket. Links and calls
//! reach it through a command channel; frames are routed back by
//! correlation id (calls) or link id (opens and events). When the socket
//! drops while anything is still using the tunnel, the task reconnects with
//! backoff, re-opens every link, replays each link's session-establishing
//! calls and resends calls that never got an answer. A 401 on the handshake
//! is terminal: every link and call is rejected with `Unauthorized`.

use super::protocol::{retired_by, Replay, ResponseKind, RpcRequest, RpcResponse};
use crate::bus::BusEvent;
use crate::config::FederationConfig;
use crate::error::BusError;
use crate::events::Emitter;
use crate::registry::{Announcement, LocationRegistry};
use dashmap::DashSet;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Tunnel → link notifications
#[derive(Debug)]
pub(crate) enum LinkSignal {
    /// The remote bus accepted the link's open
    Authorized,
    Unauthorized,
    Event(Value),
    Error(BusError),
    /// The tunnel is gone for good
    Closed,
}

pub(crate) enum Command {
    Attach {
        link_id: u64,
        open: RpcRequest,
        signals: mpsc::UnboundedSender<LinkSignal>,
    },
    Call {
        request: RpcRequest,
        replay: Replay,
        reply: oneshot::Sender<Result<Value, BusError>>,
    },
    Detach {
        link_id: u64,
    },
    /// Drop the socket without a close handshake
    Terminate,
    Shutdown,
}

/// Shared view of a running tunnel
#[derive(Clone)]
pub(crate) struct TunnelHandle {
    url: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    load: Arc<AtomicUsize>,
    authorized: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl TunnelHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    /// Links currently attached
    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    /// Next tunnel-local sequence number, shared by link and correlation ids
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn send(&self, command: Command) -> Result<(), BusError> {
        self.commands
            .send(command)
            .map_err(|_| BusError::Transport("federation tunnel closed".to_string()))
    }

    pub async fn call(&self, request: RpcRequest, replay: Replay) -> Result<Value, BusError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Call {
            request,
            replay,
            reply,
        })?;
        response
            .await
            .map_err(|_| BusError::Transport("federation tunnel closed".to_string()))?
    }
}

/// What a tunnel needs from its pool
pub(crate) struct TunnelContext {
    pub url: String,
    pub config: FederationConfig,
    pub registry: Arc<LocationRegistry>,
    pub federating: Arc<DashSet<String>>,
    pub events: Emitter<BusEvent>,
}

pub(crate) fn spawn(context: TunnelContext, keep_alive: bool) -> TunnelHandle {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let handle = TunnelHandle {
        url: Arc::from(context.url.as_str()),
        commands,
        load: Arc::new(AtomicUsize::new(0)),
        authorized: Arc::new(AtomicBool::new(false)),
        next_id: Arc::new(AtomicU64::new(1)),
    };
    let tunnel = Tunnel {
        context,
        commands_rx,
        links: BTreeMap::new(),
        pending: BTreeMap::new(),
        socket: None,
        attempts: 0,
        keep_alive,
        used: false,
        connected_once: false,
        load: Arc::clone(&handle.load),
        authorized: Arc::clone(&handle.authorized),
        next_id: Arc::clone(&handle.next_id),
    };
    tokio::spawn(tunnel.run());
    handle
}

/// `http(s)://` urls are accepted and mapped to `ws(s)://`
pub(crate) fn ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else {
        url.to_string()
    }
}

/// Delay before reconnect attempt `attempt` (1-based), with jitter
pub(crate) fn backoff(config: &FederationConfig, attempt: u32) -> Duration {
    let base = config.reconnect_delay();
    let max = config.max_reconnect_delay();
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp).min(max);
    let jitter_ms = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

struct LinkEntry {
    open: RpcRequest,
    signals: mpsc::UnboundedSender<LinkSignal>,
    /// Session-establishing calls replayed after a reconnect, in order
    log: Vec<RpcRequest>,
    announced: bool,
}

impl LinkEntry {
    fn signal(&self, signal: LinkSignal) {
        let _ = self.signals.send(signal);
    }
}

struct PendingCall {
    request: RpcRequest,
    /// None for replayed calls nobody is waiting on
    reply: Option<oneshot::Sender<Result<Value, BusError>>>,
}

enum ConnectFailure {
    Unauthorized,
    Retry(String),
    Fatal(String),
}

enum Step {
    Command(Option<Command>),
    Frame(Option<Result<Message, WsError>>),
}

struct Tunnel {
    context: TunnelContext,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    links: BTreeMap<u64, LinkEntry>,
    pending: BTreeMap<u64, PendingCall>,
    socket: Option<WsStream>,
    attempts: u32,
    keep_alive: bool,
    /// Set once anything attached or called; a fresh tunnel waits for its first user
    used: bool,
    connected_once: bool,
    load: Arc<AtomicUsize>,
    authorized: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl Tunnel {
    async fn run(mut self) {
        let url = self.context.url.clone();
        debug!(url = %url, "Federation tunnel started");

        loop {
            if self.socket.is_none() {
                if (self.used || self.connected_once) && self.is_idle() {
                    debug!(url = %url, "Federation tunnel idle, exiting");
                    break;
                }
                if self.attempts > 0 {
                    let delay = backoff(&self.context.config, self.attempts);
                    if !self.sleep_buffering(delay).await {
                        break;
                    }
                }
                let connected = self.open_socket().await;
                match connected {
                    Ok(socket) => {
                        self.socket = Some(socket);
                        self.on_connected().await;
                    }
                    Err(ConnectFailure::Unauthorized) => {
                        self.reject_unauthorized().await;
                        return;
                    }
                    Err(ConnectFailure::Retry(reason)) => {
                        self.attempts = self.attempts.saturating_add(1);
                        warn!(url = %url, attempt = self.attempts, error = %reason, "Federation connect failed");
                    }
                    Err(ConnectFailure::Fatal(reason)) => {
                        error!(url = %url, error = %reason, "Federation tunnel cannot connect");
                        self.finish(BusError::Transport(reason));
                        return;
                    }
                }
                continue;
            }

            let step = match self.socket.as_mut() {
                Some(socket) => tokio::select! {
                    command = self.commands_rx.recv() => Step::Command(command),
                    frame = socket.next() => Step::Frame(frame),
                },
                None => continue,
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(command)) => {
                    if !self.handle_command(command).await {
                        return;
                    }
                }
                Step::Frame(Some(Ok(Message::Text(text)))) => self.handle_frame(&text),
                Step::Frame(Some(Ok(Message::Close(_)))) | Step::Frame(None) => {
                    self.lost("closed by remote bus");
                }
                Step::Frame(Some(Ok(_))) => {}
                Step::Frame(Some(Err(e))) => self.lost(&e.to_string()),
            }
        }

        self.finish(BusError::Transport("federation tunnel closed".to_string()));
    }

    fn is_idle(&self) -> bool {
        self.links.is_empty() && self.pending.is_empty() && !self.keep_alive
    }

    async fn open_socket(&self) -> Result<WsStream, ConnectFailure> {
        let target = ws_url(&self.context.url);
        let mut request = target
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectFailure::Fatal(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.context.config.secret))
            .map_err(|e| ConnectFailure::Fatal(format!("invalid secret: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match connect_async(request).await {
            Ok((socket, _)) => Ok(socket),
            Err(WsError::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(ConnectFailure::Unauthorized)
            }
            Err(WsError::Url(e)) => Err(ConnectFailure::Fatal(e.to_string())),
            Err(e) => Err(ConnectFailure::Retry(e.to_string())),
        }
    }

    /// Re-open links, replay their logs and resend unanswered calls
    async fn on_connected(&mut self) {
        let url = self.context.url.clone();
        self.attempts = 0;
        self.authorized.store(true, Ordering::SeqCst);
        if self.context.federating.insert(url.clone()) {
            info!(url = %url, "Federating");
            self.context.events.emit(BusEvent::Federating(url.clone()));
        } else {
            info!(url = %url, reconnect = self.connected_once, "Federation tunnel authorized");
        }
        self.connected_once = true;

        let mut outbound: Vec<RpcRequest> = self.links.values().map(|l| l.open.clone()).collect();
        let mut replayed = HashSet::new();
        for link in self.links.values_mut() {
            for entry in link.log.iter_mut() {
                if self.pending.contains_key(&entry.correlation_id) {
                    continue;
                }
                entry.correlation_id = self.next_id.fetch_add(1, Ordering::SeqCst);
                replayed.insert(entry.correlation_id);
                self.pending.insert(
                    entry.correlation_id,
                    PendingCall {
                        request: entry.clone(),
                        reply: None,
                    },
                );
                outbound.push(entry.clone());
            }
        }
        outbound.extend(
            self.pending
                .iter()
                .filter(|(id, _)| !replayed.contains(*id))
                .map(|(_, call)| call.request.clone()),
        );

        if !replayed.is_empty() {
            debug!(url = %url, replayed = replayed.len(), "Replaying link sessions");
        }
        for request in outbound {
            if !self.transmit(&request).await {
                return;
            }
        }
    }

    /// Write one request. False when there is no socket or the write failed.
    async fn transmit(&mut self, request: &RpcRequest) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        let text = match serde_json::to_string(request) {
            Ok(text) => text,
            Err(e) => {
                error!(url = %self.context.url, error = %e, "Failed to encode request");
                return true;
            }
        };
        if let Err(e) = socket.send(Message::Text(text)).await {
            self.lost(&e.to_string());
            return false;
        }
        true
    }

    fn lost(&mut self, reason: &str) {
        if self.socket.take().is_some() {
            warn!(url = %self.context.url, reason = %reason, "Federation tunnel lost");
        }
        self.authorized.store(false, Ordering::SeqCst);
        self.attempts = 1;
    }

    /// False means the task should exit
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Attach {
                link_id,
                open,
                signals,
            } => {
                self.used = true;
                self.links.insert(
                    link_id,
                    LinkEntry {
                        open: open.clone(),
                        signals,
                        log: Vec::new(),
                        announced: false,
                    },
                );
                self.load.store(self.links.len(), Ordering::SeqCst);
                debug!(url = %self.context.url, link_id = link_id, entity = %open.entity_name, "Link attached");
                if self.socket.is_some() {
                    self.transmit(&open).await;
                }
            }
            Command::Call {
                request,
                replay,
                reply,
            } => {
                self.used = true;
                if let Some(link) = self.links.get_mut(&request.link_id) {
                    match replay {
                        Replay::Record => link.log.push(request.clone()),
                        Replay::Forget(methods) => link
                            .log
                            .retain(|entry| !methods.contains(&entry.method.as_str())),
                        Replay::None => {}
                    }
                }
                let id = request.correlation_id;
                self.pending.insert(
                    id,
                    PendingCall {
                        request: request.clone(),
                        reply: Some(reply),
                    },
                );
                if self.socket.is_some() {
                    self.transmit(&request).await;
                }
            }
            Command::Detach { link_id } => {
                if self.links.remove(&link_id).is_some() {
                    debug!(url = %self.context.url, link_id = link_id, "Link detached");
                }
                // Unanswered calls of a detached link are abandoned
                self.pending.retain(|_, call| call.request.link_id != link_id);
                self.load.store(self.links.len(), Ordering::SeqCst);
            }
            Command::Terminate => {
                if self.socket.take().is_some() {
                    warn!(url = %self.context.url, "Federation socket terminated");
                }
                self.authorized.store(false, Ordering::SeqCst);
                self.attempts = 1;
            }
            Command::Shutdown => {
                if let Some(mut socket) = self.socket.take() {
                    let _ = socket.close(None).await;
                }
                info!(url = %self.context.url, "Federation tunnel shut down");
                self.finish(BusError::Transport("federation tunnel shut down".to_string()));
                return false;
            }
        }
        true
    }

    /// Sleep before a reconnect while still accepting commands
    async fn sleep_buffering(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            let command = tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands_rx.recv() => command,
            };
            match command {
                None => return false,
                Some(command) => {
                    if !self.handle_command(command).await {
                        return false;
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let response: RpcResponse = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %self.context.url, error = %e, "Undecodable federation frame");
                return;
            }
        };
        let id = response.correlation_id;

        match response.kind {
            ResponseKind::Result => {
                if let Some(call) = self.pending.remove(&id) {
                    if let Some(reply) = call.reply {
                        let _ = reply.send(Ok(response.payload));
                    }
                } else if let Some(link) = self.links.get_mut(&id) {
                    if !link.announced {
                        link.announced = true;
                        link.signal(LinkSignal::Authorized);
                    }
                } else {
                    debug!(url = %self.context.url, correlation_id = id, "Unmatched result");
                }
            }
            ResponseKind::Error => {
                let err = response.into_error();
                if let Some(call) = self.pending.remove(&id) {
                    debug!(url = %self.context.url, link_id = call.request.link_id, error = %err, "Remote call failed");
                    if let Some(link) = self.links.get_mut(&call.request.link_id) {
                        link.log.retain(|entry| entry.correlation_id != id);
                        if call.reply.is_none() {
                            link.signal(LinkSignal::Error(err.clone()));
                        }
                    }
                    if let Some(reply) = call.reply {
                        let _ = reply.send(Err(err));
                    }
                } else if let Some(link) = self.links.get(&id) {
                    warn!(url = %self.context.url, link_id = id, error = %err, "Remote bus refused link");
                    link.signal(LinkSignal::Error(err));
                }
            }
            ResponseKind::Event => {
                if let Some(link) = self.links.get_mut(&id) {
                    let retired = retired_by(link.open.entity_type, &response.payload);
                    if !retired.is_empty() {
                        link.log
                            .retain(|entry| !retired.contains(&entry.method.as_str()));
                    }
                    link.signal(LinkSignal::Event(response.payload));
                }
            }
            ResponseKind::Announce => {
                match serde_json::from_value::<Announcement>(response.payload) {
                    Ok(announcement) => self.context.registry.apply(&self.context.url, &announcement),
                    Err(e) => warn!(url = %self.context.url, error = %e, "Bad announcement"),
                }
            }
        }
    }

    /// Terminal state after a rejected handshake
    async fn reject_unauthorized(mut self) {
        warn!(url = %self.context.url, links = self.links.len(), "Federation handshake unauthorized");
        self.authorized.store(false, Ordering::SeqCst);
        for link in self.links.values() {
            link.signal(LinkSignal::Unauthorized);
        }
        for (_, call) in std::mem::take(&mut self.pending) {
            if let Some(reply) = call.reply {
                let _ = reply.send(Err(BusError::Unauthorized));
            }
        }

        while let Some(command) = self.commands_rx.recv().await {
            match command {
                Command::Attach { signals, .. } => {
                    let _ = signals.send(LinkSignal::Unauthorized);
                }
                Command::Call { reply, .. } => {
                    let _ = reply.send(Err(BusError::Unauthorized));
                }
                Command::Detach { link_id } => {
                    self.links.remove(&link_id);
                    self.load.store(self.links.len(), Ordering::SeqCst);
                }
                Command::Terminate => {}
                Command::Shutdown => break,
            }
        }
        self.finish(BusError::Unauthorized);
    }

    /// Fail what is left and tell every link the tunnel is gone
    fn finish(&mut self, reason: BusError) {
        self.authorized.store(false, Ordering::SeqCst);
        self.commands_rx.close();
        for (_, call) in std::mem::take(&mut self.pending) {
            if let Some(reply) = call.reply {
                let _ = reply.send(Err(reason.clone()));
            }
        }
        for (_, link) in std::mem::take(&mut self.links) {
            link.signal(LinkSignal::Closed);
        }
        self.load.store(0, Ordering::SeqCst);
    }
}
