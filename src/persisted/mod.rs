// Persisted objects: a fixed set of JSON fields saved to one store hash.


use crate::bus::Core;
use crate::error::BusError;
use crate::federation::protocol::{to_reply, EntityKind, LoadReply, OpenArgs, PersistedCall};
use crate::federation::{Federate, RemoteHandle};
use anyhow::Context;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub(crate) fn persisted_key(name: &str) -> String {
    format!("fedbus:persisted:{}", name)
}

#[derive(Clone)]
enum PersistedDriver {
    Local(Arc<Core>),
    Remote(RemoteHandle),
}

/// An object whose declared fields survive in the store.
///
/// Only declared fields can be set, saved or loaded. Values are kept in
/// memory until `save`; `load` overwrites them with what the store holds.
#[derive(Clone)]
pub struct Persisted {
    name: String,
    key: String,
    fields: Arc<Vec<String>>,
    values: Arc<Mutex<Map<String, Value>>>,
    driver: PersistedDriver,
}

impl Persisted {
    pub(crate) fn local(core: Arc<Core>, name: &str, fields: Vec<String>) -> Self {
        Self::with_driver(name, fields, PersistedDriver::Local(core))
    }

    fn with_driver(name: &str, fields: Vec<String>, driver: PersistedDriver) -> Self {
        Self {
            name: name.to_string(),
            key: persisted_key(name),
            fields: Arc::new(fields),
            values: Arc::new(Mutex::new(Map::new())),
            driver,
        }
    }

    /// The object's name
    pub fn id(&self) -> &str {
        &self.name
    }

    /// Store key holding the saved fields
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn values(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_declared(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.values().get(field).cloned()
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<(), BusError> {
        if !self.is_declared(field) {
            return Err(BusError::Store(format!(
                "field '{}' is not declared on '{}'",
                field, self.name
            )));
        }
        self.values().insert(field.to_string(), value.into());
        Ok(())
    }

    /// Snapshot of the declared fields that currently hold a value
    pub fn to_map(&self) -> Map<String, Value> {
        self.values().clone()
    }

    /// Write every declared field. Returns the store key.
    pub async fn save(&self) -> Result<String, BusError> {
        match &self.driver {
            PersistedDriver::Local(core) => {
                self.save_local(core).await.map_err(BusError::store)?;
                info!(persisted = %self.name, "Saved");
                Ok(self.key.clone())
            }
            PersistedDriver::Remote(remote) => remote.call(PersistedCall::Save(self.to_map())).await,
        }
    }

    async fn save_local(&self, core: &Core) -> anyhow::Result<()> {
        let values = self.to_map();
        for field in self.fields.iter() {
            match values.get(field) {
                Some(value) => {
                    let encoded = serde_json::to_vec(value)
                        .with_context(|| format!("encoding field '{}'", field))?;
                    core.store.hash_set(&self.key, field, encoded).await?;
                }
                None => {
                    core.store.hash_delete(&self.key, field).await?;
                }
            }
        }
        Ok(())
    }

    /// Read the declared fields back. Returns whether anything was saved
    /// before, and the store key.
    pub async fn load(&self) -> Result<(bool, String), BusError> {
        match &self.driver {
            PersistedDriver::Local(core) => {
                let existed = self.load_local(core).await.map_err(BusError::store)?;
                debug!(persisted = %self.name, existed = existed, "Loaded");
                Ok((existed, self.key.clone()))
            }
            PersistedDriver::Remote(remote) => {
                let reply: LoadReply = remote.call(PersistedCall::Load).await?;
                *self.values() = reply.values;
                Ok((reply.existed, reply.key))
            }
        }
    }

    async fn load_local(&self, core: &Core) -> anyhow::Result<bool> {
        let stored = core.store.hash_get_all(&self.key).await?;
        let existed = !stored.is_empty();

        let mut loaded = Map::new();
        for field in self.fields.iter() {
            if let Some(raw) = stored.get(field) {
                let value: Value = serde_json::from_slice(raw)
                    .with_context(|| format!("decoding field '{}'", field))?;
                loaded.insert(field.clone(), value);
            }
        }
        *self.values() = loaded;
        Ok(existed)
    }

    pub(crate) async fn execute(&self, call: PersistedCall) -> Result<Value, BusError> {
        match call {
            PersistedCall::Save(values) => {
                {
                    let mut current = self.values();
                    current.clear();
                    for (field, value) in values {
                        if self.is_declared(&field) {
                            current.insert(field, value);
                        }
                    }
                }
                to_reply(self.save().await?)
            }
            PersistedCall::Load => {
                let (existed, key) = self.load().await?;
                to_reply(LoadReply {
                    existed,
                    key,
                    values: self.to_map(),
                })
            }
        }
    }
}

impl Federate for Persisted {
    const KIND: EntityKind = EntityKind::Persisted;

    fn entity_name(&self) -> String {
        self.name.clone()
    }

    fn open_args(&self) -> OpenArgs {
        OpenArgs {
            fields: self.fields.to_vec(),
            ..OpenArgs::default()
        }
    }

    fn remote(&self, handle: RemoteHandle) -> Self {
        let proxy = Self::with_driver(&self.name, self.fields.to_vec(), PersistedDriver::Remote(handle));
        *proxy.values() = self.to_map();
        proxy
    }

    fn relay(&self, _event: Value) -> Result<(), BusError> {
        Ok(())
    }
}
