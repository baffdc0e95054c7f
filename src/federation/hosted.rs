use super::protocol::{decode_call, EntityKind, OpenArgs, RpcResponse};
use crate::bus::Bus;
use crate::channel::Channel;
use crate::error::BusError;
use crate::persisted::Persisted;
use crate::pubsub::PubSub;
use crate::queue::Queue;
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

const DEFAULT_LOCAL_TAG: &str = "local";
const DEFAULT_REMOTE_TAG: &str = "remote";

/// The real entity behind one federation link
pub(crate) enum HostedEntity {
    Queue(Queue),
    Channel(Channel),
    PubSub(PubSub),
    Persisted(Persisted),
}

impl HostedEntity {
    pub fn open(bus: &Bus, kind: EntityKind, name: &str, args: OpenArgs) -> Result<Self, BusError> {
        match kind {
            EntityKind::Queue => Ok(Self::Queue(bus.queue(name))),
            EntityKind::Channel => {
                let local = args.local.as_deref().unwrap_or(DEFAULT_LOCAL_TAG);
                let remote = args.remote.as_deref().unwrap_or(DEFAULT_REMOTE_TAG);
                Ok(Self::Channel(bus.channel(name, local, remote)))
            }
            EntityKind::Pubsub => Ok(Self::PubSub(bus.pubsub(name))),
            EntityKind::Persisted => Ok(Self::Persisted(bus.persistify(name, args.fields))),
            EntityKind::Discovery => Err(BusError::Protocol(
                "discovery is not an entity".to_string(),
            )),
        }
    }

    /// Every event the entity emits from now on, as wire payloads
    fn events(&self) -> BoxStream<'static, Value> {
        match self {
            Self::Queue(queue) => relay(queue.subscribe()),
            Self::Channel(channel) => relay(channel.subscribe()),
            Self::PubSub(pubsub) => relay(pubsub.events()),
            Self::Persisted(_) => stream::pending().boxed(),
        }
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value, BusError> {
        match self {
            Self::Queue(queue) => queue.execute(decode_call(method, args)?).await,
            Self::Channel(channel) => channel.execute(decode_call(method, args)?).await,
            Self::PubSub(pubsub) => pubsub.execute(decode_call(method, args)?).await,
            Self::Persisted(persisted) => persisted.execute(decode_call(method, args)?).await,
        }
    }

    async fn teardown(&self) {
        match self {
            Self::Queue(queue) => queue.teardown().await,
            Self::Channel(channel) => channel.teardown().await,
            Self::PubSub(pubsub) => pubsub.teardown().await,
            Self::Persisted(_) => {}
        }
    }
}

fn relay<E>(events: broadcast::Receiver<E>) -> BoxStream<'static, Value>
where
    E: Serialize + Clone + Send + 'static,
{
    BroadcastStream::new(events)
        .filter_map(|item| async move {
            match item {
                Ok(event) => serde_json::to_value(&event).ok(),
                Err(e) => {
                    warn!(error = %e, "Hosted entity events lagged");
                    None
                }
            }
        })
        .boxed()
}

/// Work item for a link worker
pub(crate) enum WorkerRequest {
    Call {
        correlation_id: u64,
        method: String,
        args: Value,
    },
    Close {
        correlation_id: u64,
    },
}

enum Next {
    Request(Option<WorkerRequest>),
    Event(Option<Value>),
}

/// Runs one link's calls in order and relays its entity's events.
///
/// Events emitted while a call runs are sent before the call's result.
/// When the request channel closes (socket gone) the entity is torn down.
pub(crate) struct LinkWorker {
    link_id: u64,
    entity: HostedEntity,
    outbound: mpsc::UnboundedSender<RpcResponse>,
}

impl LinkWorker {
    pub fn new(link_id: u64, entity: HostedEntity, outbound: mpsc::UnboundedSender<RpcResponse>) -> Self {
        Self {
            link_id,
            entity,
            outbound,
        }
    }

    pub async fn run(self, mut requests: mpsc::UnboundedReceiver<WorkerRequest>) {
        let mut events = self.entity.events();
        loop {
            let next = tokio::select! {
                request = requests.recv() => Next::Request(request),
                event = events.next() => Next::Event(event),
            };

            match next {
                Next::Event(Some(event)) => self.send(RpcResponse::event(self.link_id, event)),
                Next::Event(None) => events = stream::pending().boxed(),
                Next::Request(Some(WorkerRequest::Call {
                    correlation_id,
                    method,
                    args,
                })) => {
                    let result = self.entity.invoke(&method, args).await;
                    self.flush(&mut events);
                    match result {
                        Ok(payload) => self.send(RpcResponse::result(correlation_id, payload)),
                        Err(e) => {
                            debug!(link_id = self.link_id, method = %method, error = %e, "Hosted call failed");
                            self.send(RpcResponse::error(correlation_id, &e));
                        }
                    }
                }
                Next::Request(Some(WorkerRequest::Close { correlation_id })) => {
                    self.entity.teardown().await;
                    self.flush(&mut events);
                    self.send(RpcResponse::result(correlation_id, Value::Null));
                    debug!(link_id = self.link_id, "Hosted link closed");
                    return;
                }
                Next::Request(None) => {
                    self.entity.teardown().await;
                    debug!(link_id = self.link_id, "Hosted link dropped with its socket");
                    return;
                }
            }
        }
    }

    fn flush(&self, events: &mut BoxStream<'static, Value>) {
        while let Some(Some(event)) = events.next().now_or_never() {
            self.send(RpcResponse::event(self.link_id, event));
        }
    }

    fn send(&self, response: RpcResponse) {
        let _ = self.outbound.send(response);
    }
}
