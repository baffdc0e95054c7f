use super::keys::{
    decode_number, encode_number, QueueKeys, DISCOVERABLE_FIELD, EXPIRES_FIELD, TTL_FIELD,
};
use super::session::{self, Orphans, SessionContext, SessionHandle};
use super::{AttachOptions, ConsumeOptions, QueueEvent, QueueShared};
use crate::bus::Core;
use crate::error::BusError;
use crate::payload::Payload;
use crate::registry::{Announcement, Location, DISCOVERY_CHANNEL};
use crate::store::Store;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Two-phase attach lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachState {
    Idle,
    Attaching,
    Attached,
    Detaching,
    Detached,
}

struct Attachment {
    state: AttachState,
    ttl: Duration,
    discoverable: bool,
}

/// Queue engine operating directly against the store
pub(crate) struct LocalQueue {
    core: Arc<Core>,
    keys: QueueKeys,
    shared: Arc<QueueShared>,
    attachment: Mutex<Attachment>,
    session: Mutex<Option<SessionHandle>>,
    orphans: Orphans,
}

impl LocalQueue {
    pub(crate) fn new(core: Arc<Core>, name: &str) -> Self {
        let shared = Arc::new(QueueShared::new(name, core.config.events.capacity));
        let ttl = core.config.queue.default_ttl();
        Self {
            core,
            keys: QueueKeys::new(name),
            shared,
            attachment: Mutex::new(Attachment {
                state: AttachState::Idle,
                ttl,
                discoverable: false,
            }),
            session: Mutex::new(None),
            orphans: Orphans::default(),
        }
    }

    pub(crate) fn shared(&self) -> Arc<QueueShared> {
        Arc::clone(&self.shared)
    }

    fn name(&self) -> &str {
        self.shared.name()
    }

    pub(crate) async fn attach(&self, options: AttachOptions) -> Result<(), BusError> {
        let ttl = options
            .ttl
            .unwrap_or_else(|| self.core.config.queue.default_ttl());
        {
            let mut attachment = self.attachment.lock().await;
            if matches!(
                attachment.state,
                AttachState::Attaching | AttachState::Attached
            ) {
                return Ok(());
            }
            attachment.state = AttachState::Attaching;
        }
        self.shared.emit(QueueEvent::Attaching);

        match self.attach_in_store(ttl, options.discoverable).await {
            Ok(existed) => {
                {
                    let mut attachment = self.attachment.lock().await;
                    attachment.state = AttachState::Attached;
                    attachment.ttl = ttl;
                    attachment.discoverable = options.discoverable;
                }
                info!(queue = %self.name(), existed = existed, "Queue attached");
                self.shared.emit(QueueEvent::Attached { existed });
                Ok(())
            }
            Err(e) => {
                self.attachment.lock().await.state = AttachState::Idle;
                Err(BusError::attach(e))
            }
        }
    }

    async fn attach_in_store(&self, ttl: Duration, discoverable: bool) -> Result<bool> {
        let store = &self.core.store;
        let existed = store
            .key_exists(&self.keys.info)
            .await
            .context("checking queue existence")?;

        store
            .hash_set(&self.keys.info, TTL_FIELD, encode_number(ttl.as_millis() as u64))
            .await?;
        store
            .hash_set(
                &self.keys.info,
                DISCOVERABLE_FIELD,
                if discoverable { b"1".to_vec() } else { b"0".to_vec() },
            )
            .await?;
        store
            .counter_incr(&self.keys.refs, 1)
            .await
            .context("incrementing attach count")?;

        self.cancel_expiry().await?;

        if discoverable {
            self.core.registry.register_local(self.name());
            self.announce(Announcement::present(self.name())).await;
        }
        Ok(existed)
    }

    pub(crate) async fn detach(&self) -> Result<(), BusError> {
        let (ttl, discoverable) = {
            let mut attachment = self.attachment.lock().await;
            if attachment.state != AttachState::Attached {
                return Ok(());
            }
            attachment.state = AttachState::Detaching;
            (attachment.ttl, attachment.discoverable)
        };
        self.shared.emit(QueueEvent::Detaching);

        self.stop().await;

        match self.detach_in_store(ttl, discoverable).await {
            Ok(()) => {
                self.attachment.lock().await.state = AttachState::Detached;
                info!(queue = %self.name(), "Queue detached");
                self.shared.emit(QueueEvent::Detached);
                Ok(())
            }
            Err(e) => {
                self.attachment.lock().await.state = AttachState::Attached;
                Err(BusError::attach(e))
            }
        }
    }

    async fn detach_in_store(&self, ttl: Duration, discoverable: bool) -> Result<()> {
        let store = &self.core.store;
        let refs = store
            .counter_incr(&self.keys.refs, -1)
            .await
            .context("decrementing attach count")?;
        if refs > 0 {
            return Ok(());
        }

        if !ttl.is_zero() {
            debug!(queue = %self.name(), ttl_ms = ttl.as_millis() as u64, "Arming queue expiry");
            let deadline = Utc::now().timestamp_millis() as u64 + ttl.as_millis() as u64;
            store
                .hash_set(&self.keys.info, EXPIRES_FIELD, encode_number(deadline))
                .await?;
            for key in self.keys.stored() {
                store.key_expire(key, ttl).await?;
            }

            // Another process may have attached between the decrement and the expiry
            if store.counter_incr(&self.keys.refs, 0).await? > 0 {
                debug!(queue = %self.name(), "Queue re-attached while detaching");
                self.cancel_expiry().await?;
            }
        }
        if discoverable {
            self.core.registry.release_local(self.name(), ttl);
            self.announce(Announcement::absent(self.name(), ttl)).await;
        }
        Ok(())
    }

    /// Cancel any expiry armed by an earlier final detach
    async fn cancel_expiry(&self) -> Result<()> {
        let store = &self.core.store;
        store.hash_delete(&self.keys.info, EXPIRES_FIELD).await?;
        for key in self.keys.stored() {
            store.key_persist(key).await?;
        }
        Ok(())
    }

    /// Put keys created while an expiry is pending under the same deadline
    async fn follow_expiry(&self, keys: &[&str]) -> Result<()> {
        let store = &self.core.store;
        let deadline = store.hash_get(&self.keys.info, EXPIRES_FIELD).await?;
        let Some(deadline) = deadline.as_deref().and_then(decode_number) else {
            return Ok(());
        };

        let remaining = (deadline as i64 - Utc::now().timestamp_millis()).max(1);
        for key in keys {
            store
                .key_expire(key, Duration::from_millis(remaining as u64))
                .await?;
        }
        if store.hash_get(&self.keys.info, EXPIRES_FIELD).await?.is_none() {
            for key in keys {
                store.key_persist(key).await?;
            }
        }
        Ok(())
    }

    async fn announce(&self, announcement: Announcement) {
        let encoded = match serde_json::to_vec(&announcement) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(queue = %self.name(), error = %e, "Failed to encode announcement");
                return;
            }
        };
        if let Err(e) = self.core.store.publish(DISCOVERY_CHANNEL, encoded).await {
            warn!(queue = %self.name(), error = %e, "Failed to publish announcement");
        }
    }

    pub(crate) async fn push(&self, payload: Payload) -> Result<u64, BusError> {
        let store = &self.core.store;
        let id = store
            .list_push(&self.keys.log, &self.keys.ids, payload.into_bytes())
            .await
            .map_err(BusError::store)?;
        self.follow_expiry(&[self.keys.log.as_str(), self.keys.ids.as_str()])
            .await
            .map_err(BusError::store)?;

        if let Err(e) = store.publish(&self.keys.pushed, encode_number(id)).await {
            warn!(queue = %self.name(), id = id, error = %e, "Push notification failed");
        }
        debug!(queue = %self.name(), id = id, "Message pushed");
        Ok(id)
    }

    pub(crate) async fn consume(&self, options: ConsumeOptions) -> Result<(), BusError> {
        let mut slot = self.session.lock().await;
        if let Some(previous) = slot.take() {
            if previous.is_active() {
                *slot = Some(previous);
                return Err(BusError::Consume("already consuming".to_string()));
            }
            previous.stop().await;
        }

        let context = SessionContext {
            store: Arc::clone(&self.core.store),
            keys: self.keys.clone(),
            shared: Arc::clone(&self.shared),
            poll_interval: self.core.config.queue.poll_interval(),
            orphans: Arc::clone(&self.orphans),
        };
        let handle = session::start(context, options)
            .await
            .map_err(BusError::consume)?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop the running session and wait for it to settle
    pub(crate) async fn stop(&self) {
        let handle = self.session.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub(crate) async fn ack(&self, id: u64) -> Result<(), BusError> {
        let settled = session::settle(&*self.core.store, &self.keys, id)
            .await
            .map_err(BusError::consume)?;
        if !settled {
            return Err(BusError::Consume(format!(
                "message {} is not in flight",
                id
            )));
        }

        if let Some(handle) = self.session.lock().await.as_ref() {
            handle.acked(id);
        }
        Ok(())
    }

    pub(crate) async fn count(&self) -> Result<usize, BusError> {
        self.core
            .store
            .list_len(&self.keys.log)
            .await
            .map_err(BusError::store)
    }

    pub(crate) async fn flush(&self) -> Result<(), BusError> {
        let store = &self.core.store;
        store
            .key_delete(&self.keys.log)
            .await
            .map_err(BusError::store)?;
        store
            .key_delete(&self.keys.inflight)
            .await
            .map_err(BusError::store)?;
        Ok(())
    }

    pub(crate) async fn exists(&self) -> Result<bool, BusError> {
        self.core
            .store
            .key_exists(&self.keys.info)
            .await
            .map_err(BusError::store)
    }

    pub(crate) async fn find(&self) -> Result<Option<Location>, BusError> {
        if let Some(location) = self.core.registry.lookup(self.name()) {
            return Ok(Some(location));
        }
        if self.exists().await? {
            return Ok(Some(Location::Local));
        }
        Ok(self
            .core
            .federation
            .discover(self.name())
            .await
            .map(Location::Remote))
    }

    pub(crate) async fn metadata_get(&self, key: &str) -> Result<Option<String>, BusError> {
        let raw = self
            .core
            .store
            .hash_get(&self.keys.meta, key)
            .await
            .map_err(BusError::store)?;
        Ok(raw.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub(crate) async fn metadata_set(&self, key: &str, value: &str) -> Result<(), BusError> {
        self.core
            .store
            .hash_set(&self.keys.meta, key, value.as_bytes().to_vec())
            .await
            .map_err(BusError::store)?;
        self.follow_expiry(&[self.keys.meta.as_str()])
            .await
            .map_err(BusError::store)
    }

    pub(crate) async fn metadata_set_many(
        &self,
        values: HashMap<String, String>,
    ) -> Result<(), BusError> {
        for (key, value) in values {
            self.metadata_set(&key, &value).await?;
        }
        Ok(())
    }

    pub(crate) async fn metadata_all(&self) -> Result<HashMap<String, String>, BusError> {
        let raw = self
            .core
            .store
            .hash_get_all(&self.keys.meta)
            .await
            .map_err(BusError::store)?;
        Ok(raw
            .into_iter()
            .map(|(key, value)| (key, String::from_utf8_lossy(&value).into_owned()))
            .collect())
    }
}

/// Whether `name` exists in this store and was attached as discoverable
pub(crate) async fn is_discoverable(store: &dyn Store, name: &str) -> Result<bool> {
    let keys = QueueKeys::new(name);
    let flag = store.hash_get(&keys.info, DISCOVERABLE_FIELD).await?;
    Ok(flag.as_deref() == Some(b"1".as_slice()))
}
