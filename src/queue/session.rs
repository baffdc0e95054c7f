//! Consume sessions.
//!
//! A session is one background task delivering messages from a queue log.
//! Non-reliable sessions pop (or walk a private cursor) and never keep state
//! in the store. Reliable sessions claim each delivery in the queue's
//! in-flight hash with a compare-and-set, deliver it, and wait for the ack
//! before claiming the next one. Reliable sessions renew an owner lease of
//! `STALE_TICKS` poll intervals every poll interval. A claim whose owner is
//! gone or whose lease ran out is stale and gets redelivered first by the
//! next reliable session.

use super::keys::{decode_number, encode_number, InFlight, QueueKeys, ACKED_FIELD};
use super::{ConsumeOptions, QueueEvent, QueueShared};
use crate::error::BusError;
use crate::payload::Payload;
use crate::store::{ListItem, Store};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PEEK_BATCH: usize = 32;

/// Missed renewals after which an owner lease runs out
const STALE_TICKS: u32 = 5;

/// Owners whose release failed, deleted by the next session that starts
pub(crate) type Orphans = Arc<Mutex<Vec<String>>>;

pub(crate) struct SessionContext {
    pub store: Arc<dyn Store>,
    pub keys: QueueKeys,
    pub shared: Arc<QueueShared>,
    pub poll_interval: Duration,
    pub orphans: Orphans,
}

impl SessionContext {
    /// Owner lease value: the instant it runs out
    fn lease(&self) -> Vec<u8> {
        let term = chrono::Duration::from_std(self.poll_interval * STALE_TICKS)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        (Utc::now() + term).to_rfc3339().into_bytes()
    }
}

/// Owners whose lease has not run out
fn live_owners(owners: HashMap<String, Vec<u8>>) -> HashSet<String> {
    let now = Utc::now();
    owners
        .into_iter()
        .filter(|(_, lease)| {
            std::str::from_utf8(lease)
                .ok()
                .and_then(|lease| DateTime::parse_from_rfc3339(lease).ok())
                .map_or(true, |until| until.with_timezone(&Utc) > now)
        })
        .map(|(owner, _)| owner)
        .collect()
}

/// Delete owners left registered by sessions that could not release them
async fn release_orphans(store: &dyn Store, keys: &QueueKeys, orphans: &Orphans) -> Result<()> {
    let pending = std::mem::take(&mut *orphans.lock().unwrap_or_else(PoisonError::into_inner));
    for (index, owner) in pending.iter().enumerate() {
        if let Err(e) = store.hash_delete(&keys.owners, owner).await {
            orphans
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(pending[index..].iter().cloned());
            return Err(e).context("releasing orphaned session owners");
        }
        debug!(owner = %owner, "Released orphaned session owner");
    }
    Ok(())
}

/// Owner-side handle of a running session
pub(crate) struct SessionHandle {
    active: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    ack_tx: mpsc::UnboundedSender<u64>,
    join: JoinHandle<()>,
}

impl SessionHandle {
    /// False once the session has emitted `Consuming(false)`
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.join.is_finished()
    }

    /// Release a session waiting on this id
    pub fn acked(&self, id: u64) {
        let _ = self.ack_tx.send(id);
    }

    /// Signal the session and wait until it has settled
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "Consume session task failed");
        }
    }
}

/// Start a session: subscribe to push notifications, apply `last`, emit
/// `Consuming(true)` and spawn the delivery loop.
pub(crate) async fn start(context: SessionContext, options: ConsumeOptions) -> Result<SessionHandle> {
    let owner = Uuid::new_v4().to_string();
    let store = &context.store;
    let keys = &context.keys;

    let notify = store
        .subscribe(&keys.pushed)
        .await
        .context("subscribing to push notifications")?;

    if options.reliable {
        release_orphans(&**store, keys, &context.orphans).await?;
        store
            .hash_set(&keys.owners, &owner, context.lease())
            .await
            .context("registering session owner")?;
    }

    if let Some(last) = options.last {
        resume_after(&**store, keys, &options, last).await?;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicBool::new(true));

    context.shared.emit(QueueEvent::Consuming(true));

    let session = ConsumeSession {
        cursor: options.last.unwrap_or(0),
        context,
        options,
        owner,
        delivered: 0,
        last_renewal: Instant::now(),
        notify: Some(notify),
        stop_rx,
        ack_rx,
        active: Arc::clone(&active),
    };
    let join = tokio::spawn(session.run());

    Ok(SessionHandle {
        active,
        stop_tx,
        ack_tx,
        join,
    })
}

/// Treat every id up to `last` as acknowledged
async fn resume_after(
    store: &dyn Store,
    keys: &QueueKeys,
    options: &ConsumeOptions,
    last: u64,
) -> Result<()> {
    if options.reliable {
        advance_cursor(store, keys, last).await?;

        let owners = live_owners(store.hash_get_all(&keys.owners).await?);
        for (field, raw) in store.hash_get_all(&keys.inflight).await? {
            let Some(id) = decode_number(field.as_bytes()) else {
                continue;
            };
            if id > last {
                continue;
            }
            let record: InFlight = match serde_json::from_slice(&raw) {
                Ok(record) => record,
                Err(_) => continue,
            };
            if !owners.contains(&record.owner) {
                store
                    .hash_cas(&keys.inflight, &field, Some(&raw), None)
                    .await?;
            }
        }
    }

    if options.remove {
        let removed = store.list_remove_through(&keys.log, last).await?;
        debug!(removed = removed, last = last, "Discarded messages before resume point");
    }
    Ok(())
}

/// Settle an ack. Returns false when `id` was never delivered.
pub(crate) async fn settle(store: &dyn Store, keys: &QueueKeys, id: u64) -> Result<bool> {
    let field = id.to_string();
    if let Some(raw) = store.hash_get(&keys.inflight, &field).await? {
        let record: InFlight =
            serde_json::from_slice(&raw).context("decoding in-flight record")?;
        if store
            .hash_cas(&keys.inflight, &field, Some(&raw), None)
            .await?
        {
            advance_cursor(store, keys, id).await?;
            if record.remove {
                store.list_remove(&keys.log, id).await?;
            }
        }
        return Ok(true);
    }

    // Duplicate ack of something already settled
    Ok(id <= read_cursor(store, keys).await?)
}

async fn read_cursor(store: &dyn Store, keys: &QueueKeys) -> Result<u64> {
    let raw = store.hash_get(&keys.state, ACKED_FIELD).await?;
    Ok(raw.as_deref().and_then(decode_number).unwrap_or(0))
}

/// Compare-and-advance the acknowledged cursor to at least `id`
async fn advance_cursor(store: &dyn Store, keys: &QueueKeys, id: u64) -> Result<()> {
    loop {
        let raw = store.hash_get(&keys.state, ACKED_FIELD).await?;
        let current = raw.as_deref().and_then(decode_number).unwrap_or(0);
        if current >= id {
            return Ok(());
        }
        if store
            .hash_cas(&keys.state, ACKED_FIELD, raw.as_deref(), Some(encode_number(id)))
            .await?
        {
            return Ok(());
        }
    }
}

enum Wake {
    Stop,
    Notified,
    NotifyEnded,
    Timeout,
}

struct ConsumeSession {
    context: SessionContext,
    options: ConsumeOptions,
    owner: String,
    /// Last id seen by a non-removing, non-reliable session
    cursor: u64,
    delivered: u64,
    last_renewal: Instant,
    notify: Option<BoxStream<'static, Vec<u8>>>,
    stop_rx: watch::Receiver<bool>,
    ack_rx: mpsc::UnboundedReceiver<u64>,
    active: Arc<AtomicBool>,
}

impl ConsumeSession {
    async fn run(mut self) {
        info!(
            queue = %self.context.shared.name(),
            reliable = self.options.reliable,
            max = ?self.options.max,
            "Consume session started"
        );

        loop {
            if self.max_reached() || *self.stop_rx.borrow() {
                break;
            }
            self.renew_lease().await;

            match self.next().await {
                Ok(Some((id, bytes))) => {
                    self.delivered += 1;
                    let reliable = self.options.reliable;
                    self.context.shared.emit(QueueEvent::Message {
                        payload: Payload::from(bytes),
                        id: reliable.then_some(id),
                    });
                    if reliable && !self.await_ack(id).await {
                        break;
                    }
                }
                Ok(None) => {
                    if !self.await_push().await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(queue = %self.context.shared.name(), error = %e, "Consume failed");
                    self.context
                        .shared
                        .emit(QueueEvent::Error(BusError::consume(e)));
                    if !self.await_push().await {
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Renew the owner lease at most once per poll interval
    async fn renew_lease(&mut self) {
        if !self.options.reliable || self.last_renewal.elapsed() < self.context.poll_interval {
            return;
        }
        self.last_renewal = Instant::now();
        if let Err(e) = self
            .context
            .store
            .hash_set(&self.context.keys.owners, &self.owner, self.context.lease())
            .await
        {
            debug!(queue = %self.context.shared.name(), error = %e, "Owner lease renewal failed");
        }
    }

    fn max_reached(&self) -> bool {
        self.options.max.map_or(false, |max| self.delivered >= max)
    }

    async fn next(&mut self) -> Result<Option<ListItem>> {
        let store = &*self.context.store;
        let keys = &self.context.keys;

        if self.options.reliable {
            return self.next_reliable().await;
        }
        if self.options.remove {
            return store.list_pop(&keys.log).await;
        }

        let next = store
            .list_peek_range(&keys.log, self.cursor, 1)
            .await?
            .into_iter()
            .next();
        if let Some((id, _)) = &next {
            self.cursor = *id;
        }
        Ok(next)
    }

    async fn next_reliable(&mut self) -> Result<Option<ListItem>> {
        let store = &*self.context.store;
        let keys = &self.context.keys;
        let claim = serde_json::to_vec(&InFlight {
            owner: self.owner.clone(),
            remove: self.options.remove,
        })?;

        // Stale claims from sessions that are gone come first
        let inflight = store.hash_get_all(&keys.inflight).await?;
        if !inflight.is_empty() {
            let owners = live_owners(store.hash_get_all(&keys.owners).await?);
            let mut stale: Vec<(u64, &String, &Vec<u8>)> = inflight
                .iter()
                .filter_map(|(field, raw)| {
                    let id = decode_number(field.as_bytes())?;
                    let record: InFlight = serde_json::from_slice(raw).ok()?;
                    (record.owner != self.owner && !owners.contains(&record.owner))
                        .then_some((id, field, raw))
                })
                .collect();
            stale.sort_by_key(|(id, _, _)| *id);

            for (id, field, raw) in stale {
                if !store
                    .hash_cas(&keys.inflight, field, Some(raw), Some(claim.clone()))
                    .await?
                {
                    continue;
                }
                match store.list_get(&keys.log, id).await? {
                    Some(payload) => {
                        debug!(queue = %self.context.shared.name(), id = id, "Redelivering unacknowledged message");
                        return Ok(Some((id, payload)));
                    }
                    None => {
                        store
                            .hash_cas(&keys.inflight, field, Some(&claim), None)
                            .await?;
                    }
                }
            }
        }

        let mut after = read_cursor(store, keys).await?;
        loop {
            let batch = store.list_peek_range(&keys.log, after, PEEK_BATCH).await?;
            if batch.is_empty() {
                return Ok(None);
            }
            for (id, payload) in batch {
                after = id;
                let field = id.to_string();
                if inflight.contains_key(&field) {
                    continue;
                }
                if store
                    .hash_cas(&keys.inflight, &field, None, Some(claim.clone()))
                    .await?
                {
                    return Ok(Some((id, payload)));
                }
            }
        }
    }

    /// Wait until `id` is settled. False means stop.
    async fn await_ack(&mut self, id: u64) -> bool {
        loop {
            let poll = tokio::time::sleep(self.context.poll_interval);
            let acked = tokio::select! {
                _ = self.stop_rx.changed() => return false,
                acked = self.ack_rx.recv() => acked,
                _ = poll => None,
            };

            match acked {
                Some(acked) if acked == id => return true,
                Some(_) => continue,
                None => {
                    if self.ack_rx.is_closed() {
                        return false;
                    }
                    self.renew_lease().await;
                    // Settled through another handle, or claimed by someone else
                    if self.claim_released(id).await {
                        return true;
                    }
                }
            }
        }
    }

    async fn claim_released(&mut self, id: u64) -> bool {
        let keys = &self.context.keys;
        match self
            .context
            .store
            .hash_get(&keys.inflight, &id.to_string())
            .await
        {
            Ok(None) => true,
            Ok(Some(raw)) => serde_json::from_slice::<InFlight>(&raw)
                .map_or(false, |record| record.owner != self.owner),
            Err(_) => false,
        }
    }

    /// Wait for a push notification or the poll interval. False means stop.
    async fn await_push(&mut self) -> bool {
        let poll = tokio::time::sleep(self.context.poll_interval);
        let wake = match self.notify.as_mut() {
            Some(notify) => tokio::select! {
                _ = self.stop_rx.changed() => Wake::Stop,
                item = notify.next() => match item {
                    Some(_) => Wake::Notified,
                    None => Wake::NotifyEnded,
                },
                _ = poll => Wake::Timeout,
            },
            None => tokio::select! {
                _ = self.stop_rx.changed() => Wake::Stop,
                _ = poll => Wake::Timeout,
            },
        };

        match wake {
            Wake::Stop => false,
            Wake::Notified => true,
            Wake::NotifyEnded => {
                debug!(queue = %self.context.shared.name(), "Push notifications ended");
                self.notify = None;
                true
            }
            Wake::Timeout => {
                if self.notify.is_none() {
                    self.notify = self
                        .context
                        .store
                        .subscribe(&self.context.keys.pushed)
                        .await
                        .ok();
                }
                true
            }
        }
    }

    async fn finish(self) {
        if self.options.reliable {
            if let Err(e) = self
                .context
                .store
                .hash_delete(&self.context.keys.owners, &self.owner)
                .await
            {
                warn!(queue = %self.context.shared.name(), error = %e, "Failed to release session owner");
                self.context
                    .orphans
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(self.owner.clone());
            }
        }
        self.active.store(false, Ordering::SeqCst);
        info!(
            queue = %self.context.shared.name(),
            delivered = self.delivered,
            "Consume session ended"
        );
        self.context.shared.emit(QueueEvent::Consuming(false));
    }
}
