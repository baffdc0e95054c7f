// Store adapter boundary: the only primitives the engines rely on.

mod memory;

#[cfg(test)]
mod tests;

pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// Connection lifecycle reported by the store driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Online,
    Offline,
    Error(String),
}

/// Entry of a sequenced list: store-assigned id plus the raw value
pub type ListItem = (u64, Vec<u8>);

/// Atomic primitives over the backing store.
///
/// Implementations must make every method atomic with respect to concurrent
/// callers. In particular `list_push` (id assignment + append), `list_pop`
/// (pop-and-return-id) and `hash_cas` (compare-and-advance) are the
/// primitives that keep two consumers from claiming the same message.
#[async_trait]
pub trait Store: Send + Sync {
    /// Reachability check
    async fn ping(&self) -> Result<()>;

    /// Increment `counter` and append `(id, value)` to `key`. Returns the id.
    async fn list_push(&self, key: &str, counter: &str, value: Vec<u8>) -> Result<u64>;

    /// Remove and return the oldest entry
    async fn list_pop(&self, key: &str) -> Result<Option<ListItem>>;

    /// Entries with id greater than `after`, oldest first, at most `limit`
    async fn list_peek_range(&self, key: &str, after: u64, limit: usize) -> Result<Vec<ListItem>>;

    async fn list_get(&self, key: &str, id: u64) -> Result<Option<Vec<u8>>>;

    async fn list_remove(&self, key: &str, id: u64) -> Result<bool>;

    /// Remove every entry with id less than or equal to `id`
    async fn list_remove_through(&self, key: &str, id: u64) -> Result<usize>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>>;

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<()>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Set `field` to `value` (or delete it when `None`) only if its current
    /// value equals `expected` (`None` = absent). Returns whether it applied.
    async fn hash_cas(
        &self,
        key: &str,
        field: &str,
        expected: Option<&[u8]>,
        value: Option<Vec<u8>>,
    ) -> Result<bool>;

    async fn counter_incr(&self, key: &str, by: i64) -> Result<i64>;

    async fn key_expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Cancel a pending expiry
    async fn key_persist(&self, key: &str) -> Result<bool>;

    async fn key_exists(&self, key: &str) -> Result<bool>;

    async fn key_delete(&self, key: &str) -> Result<bool>;

    /// Fire-and-forget publish. Returns the number of live subscribers.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;

    /// Live subscription. The stream ends when the store connection drops.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, Vec<u8>>>;

    fn lifecycle(&self) -> broadcast::Receiver<StoreEvent>;
}
