// Message bus core
pub mod bus;
pub mod error;
pub mod events;
pub mod payload;

// Configuration
pub mod config;

// Store adapter boundary
pub mod store;

// Entities
pub mod channel;
pub mod persisted;
pub mod pubsub;
pub mod queue;

// Discovery
pub mod registry;

// Federation tunnels, proxies and server
pub mod auth;
pub mod federation;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{Bus, BusEvent};
pub use channel::{Channel, ChannelEvent, ChannelOptions, ChannelState};
pub use config::{load_config, BusConfig};
pub use error::BusError;
pub use federation::{Federate, FederationLink, LinkEvent, LinkState};
pub use payload::Payload;
pub use persisted::Persisted;
pub use pubsub::{PubSub, PubSubEvent};
pub use queue::{AttachOptions, ConsumeOptions, Queue, QueueEvent};
pub use registry::Location;
pub use store::{MemoryStore, Store, StoreEvent};
