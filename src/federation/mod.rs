// Federation: pooled, authenticated WebSocket tunnels between buses and the
// proxies that drive remote entities through them.

mod hosted;
mod link;
mod pool;
pub mod protocol;
mod server;
mod session;
mod tunnel;

#[cfg(test)]
mod tests;

pub use link::{Federate, FederationLink, LinkEvent, LinkState, RemoteHandle};
pub use pool::FederationPool;
pub use server::{create_federation_router, federation_handler, FederationState};
