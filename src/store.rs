//! Typed accessors over the key-value persistence collaborator.
//!
//! The firmware kept raw JSON text blobs under fixed preference keys; this
//! layer keeps the same four keys and string semantics on the wire but
//! serializes and deserializes the data model types at the boundary, so the
//! rest of the crate never touches raw blobs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use crate::identity::NetworkCredential;
use crate::rules::AutomationRule;
use crate::transport::{KvStore, StoreError};

pub const KEY_DEVICE_ID: &str = "deviceId";
pub const KEY_CONFIG: &str = "config";
pub const KEY_WIFI_LIST: &str = "wifiList";
pub const KEY_AUTOMATIONS: &str = "automations";

/// Typed facade over a [`KvStore`]. Cloning shares the underlying store.
#[derive(Clone)]
pub struct DeviceStore {
    inner: Arc<dyn KvStore>,
}

impl DeviceStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self { inner }
    }

    pub fn device_id(&self) -> Option<String> {
        self.inner.get(KEY_DEVICE_ID).filter(|id| !id.is_empty())
    }

    pub fn set_device_id(&self, id: &str) {
        if let Err(e) = self.inner.put(KEY_DEVICE_ID, id) {
            warn!("Failed to persist device id: {}", e);
        }
    }

    /// Last update payload accepted from the backend, if any.
    pub fn config(&self) -> Option<Value> {
        let raw = self.inner.get(KEY_CONFIG)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Persisted config is not valid JSON ({}), ignoring", e);
                None
            }
        }
    }

    pub fn set_config(&self, doc: &Value) {
        if let Err(e) = self.inner.put(KEY_CONFIG, &doc.to_string()) {
            warn!("Failed to persist config payload: {}", e);
        }
    }

    pub fn wifi_list(&self) -> Vec<NetworkCredential> {
        let Some(raw) = self.inner.get(KEY_WIFI_LIST) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Persisted wifi list unreadable ({}), ignoring", e);
            Vec::new()
        })
    }

    pub fn set_wifi_list(&self, credentials: &[NetworkCredential]) {
        match serde_json::to_string(credentials) {
            Ok(raw) => {
                if let Err(e) = self.inner.put(KEY_WIFI_LIST, &raw) {
                    warn!("Failed to persist wifi list: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize wifi list: {}", e),
        }
    }

    pub fn automations(&self) -> Vec<AutomationRule> {
        let Some(raw) = self.inner.get(KEY_AUTOMATIONS) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("Persisted rule set unreadable ({}), ignoring", e);
            Vec::new()
        })
    }

    /// Replaces the persisted rule set wholesale. Rule ids are unique within
    /// one set; on duplicate ids the later rule wins.
    pub fn set_automations(&self, rules: &[AutomationRule]) {
        let mut by_id: BTreeMap<&str, &AutomationRule> = BTreeMap::new();
        for rule in rules {
            by_id.insert(rule.id.as_str(), rule);
        }
        let unique: Vec<&AutomationRule> = by_id.into_values().collect();

        match serde_json::to_string(&unique) {
            Ok(raw) => {
                if let Err(e) = self.inner.put(KEY_AUTOMATIONS, &raw) {
                    warn!("Failed to persist rule set: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize rule set: {}", e),
        }
    }
}

/// File-backed [`KvStore`]: a single TOML map of strings, written through
/// on every put. Good enough for the demo binary; real devices plug in
/// their flash preferences here.
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Opens (or initializes) the store at the given path.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw)
                .map_err(|e| StoreError::WriteFailed(format!("corrupt store file: {}", e)))?,
            Err(_) => BTreeMap::new(),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Default location under the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("automata-link").join("store.toml"))
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        }
        let raw = toml::to_string(entries).map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        std::fs::write(&self.path, raw).map_err(|e| StoreError::WriteFailed(e.to_string()))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("store mutex poisoned");
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::parse_condition;
    use crate::transport::MemoryStore;
    use serde_json::json;

    fn store() -> DeviceStore {
        DeviceStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn device_id_round_trip() {
        let store = store();
        assert!(store.device_id().is_none());
        store.set_device_id("23");
        assert_eq!(store.device_id().as_deref(), Some("23"));
    }

    #[test]
    fn config_round_trip_and_corruption_tolerance() {
        let kv = Arc::new(MemoryStore::new());
        let store = DeviceStore::new(kv.clone());

        store.set_config(&json!({"id": "5", "updateInterval": 4000}));
        assert_eq!(store.config().unwrap()["updateInterval"], 4000);

        kv.put(KEY_CONFIG, "{{nope").unwrap();
        assert!(store.config().is_none());
    }

    #[test]
    fn automations_replace_deduplicates_by_id() {
        let store = store();
        let first = parse_condition("soil", "soil>10").unwrap();
        let second = parse_condition("soil", "soil<90").unwrap();
        let other = parse_condition("temp", "temp=21").unwrap();

        store.set_automations(&[first, second.clone(), other.clone()]);
        let persisted = store.automations();

        assert_eq!(persisted.len(), 2);
        assert!(persisted.contains(&second), "last write wins for duplicate id");
        assert!(persisted.contains(&other));
    }

    #[test]
    fn wifi_list_round_trip() {
        let store = store();
        let creds = vec![NetworkCredential {
            ssid: "home".into(),
            secret: "pw".into(),
        }];
        store.set_wifi_list(&creds);
        assert_eq!(store.wifi_list(), creds);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("automata-link-test-{}", std::process::id()));
        let path = dir.join("store.toml");
        let _ = std::fs::remove_file(&path);

        {
            let store = FileStore::open(path.clone()).unwrap();
            store.put("deviceId", "77").unwrap();
        }
        let reopened = FileStore::open(path.clone()).unwrap();
        assert_eq!(reopened.get("deviceId").as_deref(), Some("77"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
