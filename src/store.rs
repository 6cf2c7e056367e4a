// SPDX-License-Identifier: GPL-3.0-only
//! Key-value persistence
//!
//! The controller only needs get/set/observe over JSON values. The daemon
//! backs this with a single JSON document under the XDG data directory; tests
//! use the in-memory store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{AppError, Result};

const STORE_DIR: &str = "adaptive-monitor-control";
const STORE_FILE: &str = "displays.json";

pub type ObserverId = u64;
pub type Observer = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

/// Storage consumed by the controller
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Vec<String>;
    /// Call `observer` after every change of `key`
    fn observe(&self, key: &str, observer: Observer) -> ObserverId;
    fn unobserve(&self, id: ObserverId);
}

pub fn get_typed<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let value = store.get(key)?;
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, error = %e, "Stored value has an unexpected shape");
            None
        }
    }
}

pub fn set_typed<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    store.set(key, serde_json::to_value(value)?)
}

#[derive(Default)]
struct Observers {
    next_id: AtomicU64,
    list: Mutex<Vec<(ObserverId, String, Observer)>>,
}

impl Observers {
    fn add(&self, key: &str, observer: Observer) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.list.lock().push((id, key.to_string(), observer));
        id
    }

    fn remove(&self, id: ObserverId) {
        self.list.lock().retain(|(oid, _, _)| *oid != id);
    }

    fn notify(&self, key: &str, value: Option<&Value>) {
        // Clone out so observers may touch the store
        let matching: Vec<Observer> = self
            .list
            .lock()
            .iter()
            .filter(|(_, k, _)| k == key)
            .map(|(_, _, o)| o.clone())
            .collect();
        for observer in matching {
            observer(key, value);
        }
    }
}

/// Volatile store used by tests and as a fallback when the data dir is unusable
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
    observers: Observers,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.data.write().insert(key.to_string(), value.clone());
        self.observers.notify(key, Some(&value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.data.write().remove(key);
        self.observers.notify(key, None);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    fn observe(&self, key: &str, observer: Observer) -> ObserverId {
        self.observers.add(key, observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id)
    }
}

/// Single JSON document rewritten atomically on every change
pub struct JsonFileStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, Value>>,
    observers: Observers,
}

impl JsonFileStore {
    /// `$XDG_DATA_HOME/adaptive-monitor-control/displays.json`
    pub fn default_path() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|d| d.join(STORE_DIR).join(STORE_FILE))
            .ok_or_else(|| AppError::Config("no XDG data directory".to_string()))
    }

    /// Open (or start) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), keys = data.len(), "Opened display store");
        Ok(Self {
            path,
            data: RwLock::new(data),
            observers: Observers::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, data: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        {
            let mut data = self.data.write();
            data.insert(key.to_string(), value.clone());
            self.persist(&data).map_err(|e| AppError::Store {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        }
        self.observers.notify(key, Some(&value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        {
            let mut data = self.data.write();
            if data.remove(key).is_none() {
                return Ok(());
            }
            self.persist(&data).map_err(|e| AppError::Store {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        }
        self.observers.notify(key, None);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    fn observe(&self, key: &str, observer: Observer) -> ObserverId {
        self.observers.add(key, observer)
    }

    fn unobserve(&self, id: ObserverId) {
        self.observers.remove(id)
    }
}
