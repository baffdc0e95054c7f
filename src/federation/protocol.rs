use crate::channel::ChannelOptions;
use crate::error::BusError;
use crate::payload::Payload;
use crate::queue::{AttachOptions, ConsumeOptions};
use crate::registry::Announcement;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const METHOD_OPEN: &str = "open";
pub const METHOD_CLOSE: &str = "close";
pub const METHOD_FIND: &str = "find";

/// Entity type tag carried by every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Queue,
    Channel,
    Pubsub,
    Persisted,
    /// Pseudo-entity answering `find` for discovery
    Discovery,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            EntityKind::Queue => "queue",
            EntityKind::Channel => "channel",
            EntityKind::Pubsub => "pubsub",
            EntityKind::Persisted => "persisted",
            EntityKind::Discovery => "discovery",
        };
        write!(f, "{}", tag)
    }
}

/// Client → Server: one operation on one federated entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub correlation_id: u64,
    pub link_id: u64,
    pub entity_type: EntityKind,
    pub entity_name: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// Server → Client frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// One-shot reply to the request with the same correlation id
    Result,
    /// Relayed entity event; correlation id is the link id
    Event,
    /// Failed request; payload is a serialized `BusError`
    Error,
    /// Discovery announcement from the remote bus's store
    Announce,
}

/// Server → Client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub correlation_id: u64,
    pub kind: ResponseKind,
    #[serde(default)]
    pub payload: Value,
}

impl RpcResponse {
    pub fn result(correlation_id: u64, payload: Value) -> Self {
        Self {
            correlation_id,
            kind: ResponseKind::Result,
            payload,
        }
    }

    pub fn event(link_id: u64, payload: Value) -> Self {
        Self {
            correlation_id: link_id,
            kind: ResponseKind::Event,
            payload,
        }
    }

    pub fn error(correlation_id: u64, error: &BusError) -> Self {
        Self {
            correlation_id,
            kind: ResponseKind::Error,
            payload: serde_json::to_value(error).unwrap_or(Value::Null),
        }
    }

    pub fn announce(announcement: &Announcement) -> Self {
        Self {
            correlation_id: 0,
            kind: ResponseKind::Announce,
            payload: serde_json::to_value(announcement).unwrap_or(Value::Null),
        }
    }

    /// Error payload back into a `BusError`
    pub fn into_error(self) -> BusError {
        serde_json::from_value(self.payload)
            .unwrap_or_else(|e| BusError::Protocol(format!("undecodable error frame: {}", e)))
    }
}

/// Arguments of the `open` request that registers a link on the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum QueueCall {
    Attach(AttachOptions),
    Detach,
    Push(Payload),
    Consume(ConsumeOptions),
    Ack(u64),
    Stop,
    Count,
    Flush,
    Exists,
    Find,
    MetadataGet(String),
    MetadataSet { key: String, value: String },
    MetadataSetMany(HashMap<String, String>),
    MetadataAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum ChannelCall {
    Connect(ChannelOptions),
    Listen(ChannelOptions),
    Send(Payload),
    Ack(u64),
    End,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum PubSubCall {
    Subscribe,
    Unsubscribe,
    Publish(Payload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum PersistedCall {
    Save(Map<String, Value>),
    Load,
}

/// Reply to `PersistedCall::Load`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadReply {
    pub existed: bool,
    pub key: String,
    pub values: Map<String, Value>,
}

/// What a tunnel does with a call when the socket is re-established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Session-establishing: replay after reconnect
    Record,
    /// Teardown: drop earlier recorded calls with these methods
    Forget(&'static [&'static str]),
    None,
}

/// A call that can travel over a tunnel
pub trait RemoteCall: Serialize + Send {
    fn replay(&self) -> Replay;
}

impl RemoteCall for QueueCall {
    fn replay(&self) -> Replay {
        match self {
            QueueCall::Attach(_) | QueueCall::Consume(_) => Replay::Record,
            QueueCall::Stop => Replay::Forget(&["consume"]),
            QueueCall::Detach => Replay::Forget(&["attach", "consume"]),
            _ => Replay::None,
        }
    }
}

impl RemoteCall for ChannelCall {
    fn replay(&self) -> Replay {
        match self {
            ChannelCall::Connect(_) | ChannelCall::Listen(_) => Replay::Record,
            ChannelCall::End | ChannelCall::Disconnect => Replay::Forget(&["connect", "listen"]),
            _ => Replay::None,
        }
    }
}

impl RemoteCall for PubSubCall {
    fn replay(&self) -> Replay {
        match self {
            PubSubCall::Subscribe => Replay::Record,
            PubSubCall::Unsubscribe => Replay::Forget(&["subscribe"]),
            PubSubCall::Publish(_) => Replay::None,
        }
    }
}

impl RemoteCall for PersistedCall {
    fn replay(&self) -> Replay {
        Replay::None
    }
}

/// Recorded methods a relayed event retires. A session that already ended
/// on the remote bus is not re-established after a reconnect.
pub fn retired_by(kind: EntityKind, event: &Value) -> &'static [&'static str] {
    let tag = event.get("event").and_then(Value::as_str);
    match (kind, tag) {
        (EntityKind::Queue, Some("consuming")) if event.get("data") == Some(&Value::Bool(false)) => {
            &["consume"]
        }
        (EntityKind::Channel, Some("end" | "disconnect")) => &["connect", "listen"],
        (EntityKind::Pubsub, Some("unsubscribed")) => &["subscribe"],
        _ => &[],
    }
}

/// Split a call into its wire `(method, args)` pair
pub fn encode_call<C: Serialize>(call: &C) -> Result<(String, Value), BusError> {
    let value = serde_json::to_value(call).map_err(BusError::protocol)?;
    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| BusError::Protocol("call has no method".to_string()))?
        .to_string();
    let args = value.get("args").cloned().unwrap_or(Value::Null);
    Ok((method, args))
}

/// Rebuild a call from its wire `(method, args)` pair
pub fn decode_call<C: DeserializeOwned>(method: &str, args: Value) -> Result<C, BusError> {
    let mut frame = Map::new();
    frame.insert("method".to_string(), Value::String(method.to_string()));
    if !args.is_null() {
        frame.insert("args".to_string(), args);
    }
    serde_json::from_value(Value::Object(frame)).map_err(BusError::protocol)
}

/// Serialize an operation's return value as a result payload
pub(crate) fn to_reply<T: Serialize>(value: T) -> Result<Value, BusError> {
    serde_json::to_value(value).map_err(BusError::protocol)
}
