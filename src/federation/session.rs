use super::hosted::{HostedEntity, LinkWorker, WorkerRequest};
use super::protocol::{EntityKind, OpenArgs, RpcRequest, RpcResponse, METHOD_CLOSE, METHOD_OPEN};
use crate::bus::Bus;
use crate::error::BusError;
use crate::queue::is_discoverable;
use crate::registry::{Announcement, DISCOVERY_CHANNEL};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

enum Step {
    Inbound(Option<Result<Message, axum::Error>>),
    Outbound(Option<RpcResponse>),
    Announce(Option<Vec<u8>>),
}

/// Server side of one federation socket.
///
/// Requests are routed to one worker per link so calls on a link run in
/// order while links never block each other. Every response, event and
/// announcement leaves through a single outbound queue.
pub(crate) struct FederationSession {
    bus: Bus,
    links: HashMap<u64, mpsc::UnboundedSender<WorkerRequest>>,
    outbound_tx: mpsc::UnboundedSender<RpcResponse>,
    outbound_rx: mpsc::UnboundedReceiver<RpcResponse>,
}

impl FederationSession {
    pub fn new(bus: Bus) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            bus,
            links: HashMap::new(),
            outbound_tx,
            outbound_rx,
        }
    }

    pub async fn handle(mut self, mut socket: WebSocket) {
        info!(bus = %self.bus.id(), "Federation session opened");

        let mut announcements = match self.bus.store().subscribe(DISCOVERY_CHANNEL).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Discovery announcements unavailable for this session");
                None
            }
        };

        loop {
            let step = tokio::select! {
                message = socket.recv() => Step::Inbound(message),
                response = self.outbound_rx.recv() => Step::Outbound(response),
                raw = next_announcement(&mut announcements) => Step::Announce(raw),
            };

            match step {
                Step::Inbound(Some(Ok(Message::Text(text)))) => self.dispatch(&text).await,
                Step::Inbound(Some(Ok(Message::Ping(data)))) => {
                    if let Err(e) = socket.send(Message::Pong(data)).await {
                        error!(error = %e, "Failed to send pong");
                        break;
                    }
                }
                Step::Inbound(Some(Ok(Message::Close(_)))) | Step::Inbound(None) => {
                    info!("Federation client disconnected");
                    break;
                }
                Step::Inbound(Some(Ok(_))) => {}
                Step::Inbound(Some(Err(e))) => {
                    warn!(error = %e, "Federation socket error");
                    break;
                }
                Step::Outbound(Some(response)) => {
                    if let Err(e) = send_response(&mut socket, &response).await {
                        warn!(error = %e, "Failed to write federation frame");
                        break;
                    }
                }
                Step::Outbound(None) => break,
                Step::Announce(Some(raw)) => match serde_json::from_slice::<Announcement>(&raw) {
                    Ok(announcement) => {
                        let frame = RpcResponse::announce(&announcement);
                        if let Err(e) = send_response(&mut socket, &frame).await {
                            warn!(error = %e, "Failed to forward announcement");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Undecodable announcement"),
                },
                Step::Announce(None) => {
                    debug!("Discovery subscription ended");
                    announcements = None;
                }
            }
        }

        // Dropping the senders tears every hosted entity down
        let links = self.links.len();
        self.links.clear();
        info!(links = links, "Federation session closed");
    }

    async fn dispatch(&mut self, text: &str) {
        let request: RpcRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Undecodable federation request");
                return;
            }
        };
        debug!(
            link_id = request.link_id,
            correlation_id = request.correlation_id,
            entity = %request.entity_name,
            method = %request.method,
            "Federation request"
        );

        if request.entity_type == EntityKind::Discovery {
            let reply = match is_discoverable(&**self.bus.store(), &request.entity_name).await {
                Ok(found) => RpcResponse::result(request.correlation_id, Value::Bool(found)),
                Err(e) => RpcResponse::error(request.correlation_id, &BusError::store(e)),
            };
            self.reply(reply);
            return;
        }

        match request.method.as_str() {
            METHOD_OPEN => self.open(request),
            METHOD_CLOSE => match self.links.remove(&request.link_id) {
                Some(worker) => {
                    let close = WorkerRequest::Close {
                        correlation_id: request.correlation_id,
                    };
                    if worker.send(close).is_err() {
                        self.reply(RpcResponse::result(request.correlation_id, Value::Null));
                    }
                }
                None => self.reply(RpcResponse::result(request.correlation_id, Value::Null)),
            },
            _ => {
                let call = WorkerRequest::Call {
                    correlation_id: request.correlation_id,
                    method: request.method,
                    args: request.args,
                };
                let delivered = self
                    .links
                    .get(&request.link_id)
                    .map_or(false, |worker| worker.send(call).is_ok());
                if !delivered {
                    let err = BusError::Protocol(format!("unknown link {}", request.link_id));
                    self.reply(RpcResponse::error(request.correlation_id, &err));
                }
            }
        }
    }

    fn open(&mut self, request: RpcRequest) {
        let link_id = request.link_id;
        if self.links.contains_key(&link_id) {
            self.reply(RpcResponse::result(link_id, Value::Null));
            return;
        }

        let args: OpenArgs = if request.args.is_null() {
            OpenArgs::default()
        } else {
            match serde_json::from_value(request.args) {
                Ok(args) => args,
                Err(e) => {
                    self.reply(RpcResponse::error(link_id, &BusError::protocol(e)));
                    return;
                }
            }
        };

        match HostedEntity::open(&self.bus, request.entity_type, &request.entity_name, args) {
            Ok(entity) => {
                self.reply(RpcResponse::result(link_id, Value::Null));
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = LinkWorker::new(link_id, entity, self.outbound_tx.clone());
                tokio::spawn(worker.run(rx));
                self.links.insert(link_id, tx);
                info!(
                    link_id = link_id,
                    entity_type = %request.entity_type,
                    entity = %request.entity_name,
                    "Hosting federated entity"
                );
            }
            Err(e) => {
                warn!(link_id = link_id, error = %e, "Refused federation link");
                self.reply(RpcResponse::error(link_id, &e));
            }
        }
    }

    fn reply(&self, response: RpcResponse) {
        let _ = self.outbound_tx.send(response);
    }
}

async fn next_announcement(stream: &mut Option<BoxStream<'static, Vec<u8>>>) -> Option<Vec<u8>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

async fn send_response(socket: &mut WebSocket, response: &RpcResponse) -> anyhow::Result<()> {
    let json = serde_json::to_string(response)?;
    socket.send(Message::Text(json)).await?;
    Ok(())
}
