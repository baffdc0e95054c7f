use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;


/// Store pub/sub channel carrying discovery announcements
pub const DISCOVERY_CHANNEL: &str = "fedbus:discovery";

/// Where a named entity currently lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "at", content = "url", rename_all = "snake_case")]
pub enum Location {
    /// Owned by this bus's store
    Local,
    /// Owned by the remote bus reachable at this federation url
    Remote(String),
}

/// Presence change of a discoverable entity, published by the owning bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub name: String,
    pub present: bool,
    /// How long an absent entity stays resolvable
    #[serde(default)]
    pub ttl_ms: u64,
}

impl Announcement {
    pub fn present(name: &str) -> Self {
        Self {
            name: name.to_string(),
            present: true,
            ttl_ms: 0,
        }
    }

    pub fn absent(name: &str, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            present: false,
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_ms > 0).then(|| Duration::from_millis(self.ttl_ms))
    }
}

/// One row of a registry snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRecord {
    pub name: String,
    pub location: Location,
    pub recorded_at: DateTime<Utc>,
    /// Remaining lifetime, `None` when the entry does not expire
    pub expires_in: Option<Duration>,
}

struct RegistryEntry {
    location: Location,
    recorded_at: DateTime<Utc>,
    expires_at: Option<Instant>,
}

impl RegistryEntry {
    fn new(location: Location, ttl: Option<Duration>) -> Self {
        Self {
            location,
            recorded_at: Utc::now(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Name → location map used by `find()` and discovery.
///
/// Local entries come from `attach(discoverable)`; remote entries from
/// announcements received over federation tunnels.
pub struct LocationRegistry {
    entries: DashMap<String, RegistryEntry>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Mark `name` as owned by this bus, cancelling any pending expiry
    pub fn register_local(&self, name: &str) {
        self.entries
            .insert(name.to_string(), RegistryEntry::new(Location::Local, None));
    }

    /// Last local attachment went away. The entry stays resolvable for `ttl`;
    /// a zero ttl keeps it until explicitly removed.
    pub fn release_local(&self, name: &str, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if let Some(mut entry) = self.entries.get_mut(name) {
            if entry.location == Location::Local {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
    }

    /// Apply a discovery announcement from a remote bus.
    ///
    /// A live local entry always wins over what a remote bus claims.
    pub fn record_remote(&self, name: &str, url: &str, present: bool, ttl: Option<Duration>) {
        let now = Instant::now();
        if let Some(existing) = self.entries.get(name) {
            if existing.location == Location::Local && existing.is_live(now) {
                return;
            }
        }

        if present {
            self.entries.insert(
                name.to_string(),
                RegistryEntry::new(Location::Remote(url.to_string()), None),
            );
            return;
        }

        // Absent: keep the remote entry resolvable until its ttl runs out
        match ttl.filter(|ttl| !ttl.is_zero()) {
            Some(ttl) => {
                self.entries.insert(
                    name.to_string(),
                    RegistryEntry::new(Location::Remote(url.to_string()), Some(ttl)),
                );
            }
            None => {
                self.entries.remove_if(name, |_, entry| {
                    entry.location == Location::Remote(url.to_string())
                });
            }
        }
    }

    /// Current location of `name`, evicting the entry if it has expired
    pub fn lookup(&self, name: &str) -> Option<Location> {
        let now = Instant::now();
        let location = {
            let entry = self.entries.get(name)?;
            if entry.is_live(now) {
                return Some(entry.location.clone());
            }
            entry.location.clone()
        };
        self.entries.remove_if(name, |_, entry| !entry.is_live(now));
        debug!(name = %name, location = ?location, "Registry entry expired");
        None
    }

    /// Apply an announcement received from the bus at `url`
    pub fn apply(&self, url: &str, announcement: &Announcement) {
        self.record_remote(
            &announcement.name,
            url,
            announcement.present,
            announcement.ttl(),
        );
    }

    pub fn remove(&self, name: &str) -> Option<Location> {
        self.entries.remove(name).map(|(_, entry)| entry.location)
    }

    /// Live entries, sorted by name
    pub fn snapshot(&self) -> Vec<RegistryRecord> {
        let now = Instant::now();
        let mut records: Vec<RegistryRecord> = self
            .entries
            .iter()
            .filter(|entry| entry.is_live(now))
            .map(|entry| RegistryRecord {
                name: entry.key().clone(),
                location: entry.location.clone(),
                recorded_at: entry.recorded_at,
                expires_in: entry.expires_at.map(|at| at.saturating_duration_since(now)),
            })
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
