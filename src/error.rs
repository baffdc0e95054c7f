use serde::{Deserialize, Serialize};
use std::fmt;

/// Errors surfaced by bus handles.
///
/// Serializable so a remote bus can hand the exact failure back over a
/// federation tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BusError {
    /// Store unreachable. Not fatal, connect may be retried.
    Connection(String),
    /// `connect()` called on a bus that is already online
    AlreadyConnected,
    /// Operation needs an online bus or a connected channel endpoint
    NotConnected,
    /// Store rejected an attach/detach
    Attach(String),
    /// Store rejected a consume/ack
    Consume(String),
    /// Channel rendezvous or send failure
    Channel(String),
    /// Direct store query/mutation failure (count, flush, metadata, save, load)
    Store(String),
    /// Federation secret mismatch. Terminal for the link.
    Unauthorized,
    /// Caller-level request timeout
    Timeout(String),
    /// Federation socket failure
    Transport(String),
    /// Malformed frame or arguments
    Protocol(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Connection(reason) => write!(f, "connection error: {}", reason),
            BusError::AlreadyConnected => write!(f, "already connected"),
            BusError::NotConnected => write!(f, "not connected"),
            BusError::Attach(reason) => write!(f, "attach failed: {}", reason),
            BusError::Consume(reason) => write!(f, "consume failed: {}", reason),
            BusError::Channel(reason) => write!(f, "channel error: {}", reason),
            BusError::Store(reason) => write!(f, "store error: {}", reason),
            BusError::Unauthorized => write!(f, "unauthorized"),
            BusError::Timeout(what) => write!(f, "timeout: {}", what),
            BusError::Transport(reason) => write!(f, "transport error: {}", reason),
            BusError::Protocol(reason) => write!(f, "protocol error: {}", reason),
        }
    }
}

impl std::error::Error for BusError {}

impl BusError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        BusError::Store(format!("{:#}", err))
    }

    pub(crate) fn attach(err: anyhow::Error) -> Self {
        BusError::Attach(format!("{:#}", err))
    }

    pub(crate) fn consume(err: anyhow::Error) -> Self {
        BusError::Consume(format!("{:#}", err))
    }

    pub(crate) fn channel(err: anyhow::Error) -> Self {
        BusError::Channel(format!("{:#}", err))
    }

    pub(crate) fn protocol(err: serde_json::Error) -> Self {
        BusError::Protocol(err.to_string())
    }
}
