use serde::{Deserialize, Serialize};

/// Store keys of one queue
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    /// Hash `{ttl, discoverable, expires_at}`; its existence is the queue's existence
    pub info: String,
    /// Attach reference count
    pub refs: String,
    /// Message id counter
    pub ids: String,
    /// Sequenced message log
    pub log: String,
    /// Hash holding the `acked` cursor
    pub state: String,
    /// Hash `message id → InFlight`
    pub inflight: String,
    /// Hash of live reliable session owners
    pub owners: String,
    pub meta: String,
    /// Pub/sub channel notified on every push
    pub pushed: String,
}

impl QueueKeys {
    pub fn new(name: &str) -> Self {
        let prefix = format!("fedbus:q:{}", name);
        Self {
            info: format!("{}:info", prefix),
            refs: format!("{}:refs", prefix),
            ids: format!("{}:id", prefix),
            log: format!("{}:log", prefix),
            state: format!("{}:state", prefix),
            inflight: format!("{}:inflight", prefix),
            owners: format!("{}:owners", prefix),
            meta: format!("{}:meta", prefix),
            pushed: format!("{}:pushed", prefix),
        }
    }

    /// Every stored key, i.e. everything the ttl applies to
    pub fn stored(&self) -> [&str; 8] {
        [
            &self.info,
            &self.refs,
            &self.ids,
            &self.log,
            &self.state,
            &self.inflight,
            &self.owners,
            &self.meta,
        ]
    }
}

pub(crate) const ACKED_FIELD: &str = "acked";
pub(crate) const TTL_FIELD: &str = "ttl";
/// Epoch millis at which a pending expiry fires; absent while attached
pub(crate) const EXPIRES_FIELD: &str = "expires_at";
pub(crate) const DISCOVERABLE_FIELD: &str = "discoverable";

/// A delivered, unacknowledged message claimed by a reliable session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct InFlight {
    pub owner: String,
    pub remove: bool,
}

pub(crate) fn encode_number(n: u64) -> Vec<u8> {
    n.to_string().into_bytes()
}

pub(crate) fn decode_number(raw: &[u8]) -> Option<u64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}
