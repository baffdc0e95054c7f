//! In-process store adapter.
//!
//! All keyed state lives behind a single lock so multi-key primitives
//! (`list_push` touches a counter and a list) stay atomic. Expiry is lazy:
//! an expired key is evicted the next time anything looks at it.
//! Several buses sharing one `Arc<MemoryStore>` behave like several processes
//! sharing one store server.

use super::{ListItem, Store, StoreEvent};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

enum Value {
    Counter(i64),
    Hash(HashMap<String, Vec<u8>>),
    List(VecDeque<ListItem>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Counter(_) => "counter",
            Value::Hash(_) => "hash",
            Value::List(_) => "list",
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

/// Keyed state guarded by one lock, with lazy eviction on access
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).map_or(false, |e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<ListItem>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(other) => bail!("WRONGTYPE key '{}' holds a {}", key, other.value.type_name()),
        }
    }

    fn list_or_create(&mut self, key: &str) -> Result<&mut VecDeque<ListItem>> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
        }
        self.list(key)?
            .ok_or_else(|| anyhow!("list '{}' vanished", key))
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, Vec<u8>>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(Some(hash)),
            Some(other) => bail!("WRONGTYPE key '{}' holds a {}", key, other.value.type_name()),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> Result<&mut HashMap<String, Vec<u8>>> {
        if self.live(key).is_none() {
            self.entries
                .insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        self.hash(key)?
            .ok_or_else(|| anyhow!("hash '{}' vanished", key))
    }

    fn incr(&mut self, key: &str, by: i64) -> Result<i64> {
        match self.live(key) {
            None => {
                self.entries
                    .insert(key.to_string(), Entry::new(Value::Counter(by)));
                Ok(by)
            }
            Some(Entry {
                value: Value::Counter(n),
                ..
            }) => {
                *n += by;
                Ok(*n)
            }
            Some(other) => bail!("WRONGTYPE key '{}' holds a {}", key, other.value.type_name()),
        }
    }
}

/// In-memory implementation of [`Store`]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
    lifecycle_tx: broadcast::Sender<StoreEvent>,
    available: AtomicBool,
    channel_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(1024)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(16);
        Self {
            keyspace: Mutex::new(Keyspace {
                entries: HashMap::new(),
            }),
            channels: DashMap::new(),
            lifecycle_tx,
            available: AtomicBool::new(true),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Simulate the store going down or coming back.
    ///
    /// Going down fails every operation, ends every live subscription and
    /// emits `Offline`. Coming back emits `Online`. Keyed data is retained.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was == available {
            return;
        }
        if available {
            info!("Memory store back online");
            let _ = self.lifecycle_tx.send(StoreEvent::Online);
        } else {
            warn!(subscriptions = self.channels.len(), "Memory store going offline");
            self.channels.clear();
            let _ = self.lifecycle_tx.send(StoreEvent::Offline);
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Pub/sub channels currently holding a sender
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of keys currently held, expired ones excluded
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        match self.keyspace.lock() {
            Ok(keys) => keys.entries.values().filter(|e| !e.is_expired(now)).count(),
            Err(_) => 0,
        }
    }

    fn keys(&self) -> Result<MutexGuard<'_, Keyspace>> {
        if !self.is_available() {
            bail!("store unavailable");
        }
        self.keyspace
            .lock()
            .map_err(|_| anyhow!("store keyspace lock poisoned"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.keys().map(|_| ())
    }

    async fn list_push(&self, key: &str, counter: &str, value: Vec<u8>) -> Result<u64> {
        let mut keys = self.keys()?;
        // Type-check the list before burning an id
        keys.list(key)?;
        let id = keys.incr(counter, 1)?;
        let id = u64::try_from(id).map_err(|_| anyhow!("counter '{}' went negative", counter))?;
        keys.list_or_create(key)?.push_back((id, value));
        Ok(id)
    }

    async fn list_pop(&self, key: &str) -> Result<Option<ListItem>> {
        let mut keys = self.keys()?;
        Ok(keys.list(key)?.and_then(|list| list.pop_front()))
    }

    async fn list_peek_range(&self, key: &str, after: u64, limit: usize) -> Result<Vec<ListItem>> {
        let mut keys = self.keys()?;
        Ok(keys
            .list(key)?
            .map(|list| {
                list.iter()
                    .filter(|(id, _)| *id > after)
                    .take(limit)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    async fn list_get(&self, key: &str, id: u64) -> Result<Option<Vec<u8>>> {
        let mut keys = self.keys()?;
        Ok(keys.list(key)?.and_then(|list| {
            list.iter()
                .find(|(item_id, _)| *item_id == id)
                .map(|(_, value)| value.clone())
        }))
    }

    async fn list_remove(&self, key: &str, id: u64) -> Result<bool> {
        let mut keys = self.keys()?;
        let Some(list) = keys.list(key)? else {
            return Ok(false);
        };
        match list.iter().position(|(item_id, _)| *item_id == id) {
            Some(index) => {
                list.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_remove_through(&self, key: &str, id: u64) -> Result<usize> {
        let mut keys = self.keys()?;
        let Some(list) = keys.list(key)? else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|(item_id, _)| *item_id > id);
        Ok(before - list.len())
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut keys = self.keys()?;
        Ok(keys.list(key)?.map(|list| list.len()).unwrap_or(0))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut keys = self.keys()?;
        Ok(keys.hash(key)?.and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut keys = self.keys()?;
        Ok(keys.hash(key)?.cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()> {
        let mut keys = self.keys()?;
        keys.hash_or_create(key)?.insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut keys = self.keys()?;
        Ok(keys
            .hash(key)?
            .map_or(false, |hash| hash.remove(field).is_some()))
    }

    async fn hash_cas(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[u8]>,
        value: Option<Vec<u8>>,
    ) -> Result<bool> {
        let mut keys = self.keys()?;
        let current = keys
            .hash(key)?
            .and_then(|hash| hash.get(field).cloned());
        if current.as_deref() != expected {
            return Ok(false);
        }
        match value {
            Some(value) => {
                keys.hash_or_create(key)?.insert(field.to_string(), value);
            }
            None => {
                if let Some(hash) = keys.hash(key)? {
                    hash.remove(field);
                }
            }
        }
        Ok(true)
    }

    async fn counter_incr(&self, key: &str, by: i64) -> Result<i64> {
        self.keys()?.incr(key, by)
    }

    async fn key_expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut keys = self.keys()?;
        Ok(match keys.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        })
    }

    async fn key_persist(&self, key: &str) -> Result<bool> {
        let mut keys = self.keys()?;
        Ok(match keys.live(key) {
            Some(entry) => entry.expires_at.take().is_some(),
            None => false,
        })
    }

    async fn key_exists(&self, key: &str) -> Result<bool> {
        let mut keys = self.keys()?;
        Ok(keys.live(key).is_some())
    }

    async fn key_delete(&self, key: &str) -> Result<bool> {
        let mut keys = self.keys()?;
        let existed = keys.live(key).is_some();
        keys.entries.remove(key);
        Ok(existed)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        if !self.is_available() {
            bail!("store unavailable");
        }
        let sent = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).ok(),
            None => return Ok(0),
        };
        match sent {
            Some(delivered) => Ok(delivered),
            None => {
                // Every subscriber is gone
                self.channels
                    .remove_if(channel, |_, tx| tx.receiver_count() == 0);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>> {
        if !self.is_available() {
            bail!("store unavailable");
        }
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let result = match item {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Subscriber lagged, messages dropped");
                    None
                }
            };
            futures::future::ready(result)
        });
        Ok(stream.boxed())
    }

    fn lifecycle(&self) -> broadcast::Receiver<StoreEvent> {
        self.lifecycle_tx.subscribe()
    }
}
