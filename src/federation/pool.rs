use super::link::{Federate, FederationLink};
use super::protocol::{EntityKind, Replay, RpcRequest, METHOD_FIND};
use super::tunnel::{self, Command, TunnelContext, TunnelHandle};
use crate::bus::BusEvent;
use crate::config::FederationConfig;
use crate::error::BusError;
use crate::events::Emitter;
use crate::registry::LocationRegistry;
use dashmap::{DashMap, DashSet};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

struct PoolInner {
    config: FederationConfig,
    registry: Arc<LocationRegistry>,
    events: Emitter<BusEvent>,
    tunnels: DashMap<String, Vec<TunnelHandle>>,
    /// Urls that have had at least one authorized tunnel
    federating: Arc<DashSet<String>>,
}

/// Per-bus pool of federation tunnels, keyed by remote url.
///
/// Each url gets up to `pool_size` tunnels. A new link opens a fresh tunnel
/// while the pool for its url has room, then shares the least loaded one.
#[derive(Clone)]
pub struct FederationPool {
    inner: Arc<PoolInner>,
}

impl FederationPool {
    pub(crate) fn new(
        config: FederationConfig,
        registry: Arc<LocationRegistry>,
        events: Emitter<BusEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry,
                events,
                tunnels: DashMap::new(),
                federating: Arc::new(DashSet::new()),
            }),
        }
    }

    fn spawn_tunnel(&self, url: &str, keep_alive: bool) -> TunnelHandle {
        debug!(url = %url, keep_alive = keep_alive, "Opening federation tunnel");
        tunnel::spawn(
            TunnelContext {
                url: url.to_string(),
                config: self.inner.config.clone(),
                registry: Arc::clone(&self.inner.registry),
                federating: Arc::clone(&self.inner.federating),
                events: self.inner.events.clone(),
            },
            keep_alive,
        )
    }

    pub(crate) fn acquire(&self, url: &str) -> TunnelHandle {
        let mut tunnels = self.inner.tunnels.entry(url.to_string()).or_default();
        tunnels.retain(TunnelHandle::is_alive);

        if tunnels.len() < self.inner.config.pool_size.max(1) {
            let handle = self.spawn_tunnel(url, false);
            tunnels.push(handle.clone());
            return handle;
        }
        match tunnels.iter().min_by_key(|t| t.load()) {
            Some(handle) => handle.clone(),
            None => {
                let handle = self.spawn_tunnel(url, false);
                tunnels.push(handle.clone());
                handle
            }
        }
    }

    /// Keep one tunnel to `url` open even without links
    pub fn warm(&self, url: &str) {
        let mut tunnels = self.inner.tunnels.entry(url.to_string()).or_default();
        tunnels.retain(TunnelHandle::is_alive);
        if tunnels.is_empty() {
            info!(url = %url, "Warming federation tunnel");
            tunnels.push(self.spawn_tunnel(url, true));
        }
    }

    pub(crate) async fn link<E: Federate>(
        &self,
        entity: &E,
        url: &str,
    ) -> Result<FederationLink<E>, BusError> {
        let capacity = self.inner.events.capacity();
        match FederationLink::open(self.acquire(url), entity, capacity) {
            Ok(link) => Ok(link),
            // The tunnel exited between acquire and attach
            Err(BusError::Transport(_)) => FederationLink::open(self.acquire(url), entity, capacity),
            Err(e) => Err(e),
        }
    }

    /// Ask every authorized remote bus whether it owns `name`.
    ///
    /// Returns the url of the first bus that does, and records it in the
    /// registry. Buses that do not answer within the discovery timeout are
    /// skipped.
    pub async fn discover(&self, name: &str) -> Option<String> {
        let timeout = self.inner.config.discovery_timeout();
        let candidates: Vec<TunnelHandle> = self
            .inner
            .tunnels
            .iter()
            .filter_map(|entry| entry.value().iter().find(|t| t.is_authorized()).cloned())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let mut asks: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|tunnel| async move {
                let request = RpcRequest {
                    correlation_id: tunnel.next_id(),
                    link_id: 0,
                    entity_type: EntityKind::Discovery,
                    entity_name: name.to_string(),
                    method: METHOD_FIND.to_string(),
                    args: Value::Null,
                };
                let found = matches!(
                    tokio::time::timeout(timeout, tunnel.call(request, Replay::None)).await,
                    Ok(Ok(Value::Bool(true)))
                );
                (tunnel.url().to_string(), found)
            })
            .collect();

        while let Some((url, found)) = asks.next().await {
            if found {
                debug!(name = %name, url = %url, "Discovered remote owner");
                self.inner.registry.record_remote(name, &url, true, None);
                return Some(url);
            }
        }
        None
    }

    /// Drop the live sockets to `url` without a close handshake. Tunnels
    /// with links reconnect on their own.
    pub fn terminate_sockets(&self, url: &str) -> usize {
        let Some(tunnels) = self.inner.tunnels.get(url) else {
            return 0;
        };
        tunnels
            .iter()
            .filter(|t| t.send(Command::Terminate).is_ok())
            .count()
    }

    /// Live tunnels to `url`
    pub fn connections(&self, url: &str) -> usize {
        self.inner
            .tunnels
            .get(url)
            .map_or(0, |tunnels| tunnels.iter().filter(|t| t.is_alive()).count())
    }

    /// Authorized tunnels to `url`
    pub fn authorized(&self, url: &str) -> usize {
        self.inner
            .tunnels
            .get(url)
            .map_or(0, |tunnels| tunnels.iter().filter(|t| t.is_authorized()).count())
    }

    pub fn is_federating(&self, url: &str) -> bool {
        self.inner.federating.contains(url)
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.inner.tunnels.iter().map(|e| e.key().clone()).collect();
        urls.sort();
        urls
    }

    /// Close every tunnel; links see `Close`
    pub fn shutdown(&self) {
        let urls = self.urls();
        for url in urls {
            if let Some((_, tunnels)) = self.inner.tunnels.remove(&url) {
                for tunnel in tunnels {
                    let _ = tunnel.send(Command::Shutdown);
                }
                debug!(url = %url, "Federation tunnels shut down");
            }
        }
        self.inner.federating.clear();
    }
}
