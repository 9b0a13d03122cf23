//! Persisted properties.
//!
//! [`Storage`] maps the typed [`PersistedProperty`] namespace onto an in-memory JSON document.
//! In memory mode that document is all there is and it's gone on restart. In durable mode the
//! document is loaded from a [`KeyValueStore`] by [`Storage::preload`] and written back after
//! every change.
use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::{tasks::BackgroundTasks, Result};

/// Key under which the whole persisted document is saved in durable storage.
pub const STORAGE_KEY: &str = ".posthog-bridge.json";

/// Properties the SDK keeps across calls (and restarts, with durable storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum PersistedProperty {
    AnonymousId,
    DistinctId,
    Props,
    FeatureFlags,
    FeatureFlagPayloads,
    OptedOut,
    SessionId,
    SessionLastTimestamp,
    SessionStartTimestamp,
    PersonProperties,
    GroupProperties,
    Groups,
    SessionReplay,
    Surveys,
    InstalledAppBuild,
    InstalledAppVersion,
}

impl PersistedProperty {
    /// Key of the property inside the persisted document.
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistedProperty::AnonymousId => "anonymous_id",
            PersistedProperty::DistinctId => "distinct_id",
            PersistedProperty::Props => "props",
            PersistedProperty::FeatureFlags => "feature_flags",
            PersistedProperty::FeatureFlagPayloads => "feature_flag_payloads",
            PersistedProperty::OptedOut => "opted_out",
            PersistedProperty::SessionId => "session_id",
            PersistedProperty::SessionLastTimestamp => "session_timestamp",
            PersistedProperty::SessionStartTimestamp => "session_start_timestamp",
            PersistedProperty::PersonProperties => "person_properties",
            PersistedProperty::GroupProperties => "group_properties",
            PersistedProperty::Groups => "groups",
            PersistedProperty::SessionReplay => "session_replay",
            PersistedProperty::Surveys => "surveys",
            PersistedProperty::InstalledAppBuild => "installed_app_build",
            PersistedProperty::InstalledAppVersion => "installed_app_version",
        }
    }
}

/// An asynchronous string key-value store backing durable persistence.
///
/// Implement this to plug in the host's preferences/keychain/database. [`FileStore`] is used when
/// nothing else is configured.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value. Returns `Ok(None)` if the key doesn't exist.
    async fn get_item(&self, key: &str) -> Result<Option<String>>;
    /// Write a value.
    async fn set_item(&self, key: &str, value: String) -> Result<()>;
    /// Remove a value. Removing a missing key is not an error.
    async fn remove_item(&self, key: &str) -> Result<()>;
}

/// A [`KeyValueStore`] that keeps one file per key in a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> FileStore {
        FileStore { dir: dir.into() }
    }

    fn path(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(file_name)
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.path(key), value).await?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

enum Backend {
    Memory,
    Durable {
        store: Arc<dyn KeyValueStore>,
        writes: BackgroundTasks,
        // Serializes writes so the last spawned write always lands last.
        write_lock: Arc<tokio::sync::Mutex<()>>,
    },
}

/// Storage for [`PersistedProperty`] values.
///
/// Reads and writes are synchronous and served from memory. `set_item(key, Value::Null)` is the
/// same as `remove_item(key)`.
pub struct Storage {
    state: Arc<RwLock<Map<String, Value>>>,
    backend: Backend,
}

impl Storage {
    /// Create an in-memory storage. Nothing survives a restart.
    pub fn memory() -> Storage {
        Storage {
            state: Arc::new(RwLock::new(Map::new())),
            backend: Backend::Memory,
        }
    }

    /// Create a storage persisted through `store`.
    ///
    /// [`Storage::preload`] must complete before reads reflect the durable state.
    pub(crate) fn durable(store: Arc<dyn KeyValueStore>, writes: BackgroundTasks) -> Storage {
        Storage {
            state: Arc::new(RwLock::new(Map::new())),
            backend: Backend::Durable {
                store,
                writes,
                write_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        }
    }

    /// Whether this storage survives restarts.
    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Durable { .. })
    }

    /// Load the persisted document from the backing store.
    ///
    /// Values written before preload completes take precedence over loaded ones.
    pub async fn preload(&self) -> Result<()> {
        let Backend::Durable { store, .. } = &self.backend else {
            return Ok(());
        };

        let Some(raw) = store.get_item(STORAGE_KEY).await? else {
            log::debug!(target: "posthog", "no persisted state found");
            return Ok(());
        };

        let loaded: Map<String, Value> = serde_json::from_str(&raw)?;
        let mut state = self
            .state
            .write()
            .expect("thread holding storage lock should not panic");
        for (key, value) in loaded {
            state.entry(key).or_insert(value);
        }
        log::debug!(target: "posthog", entries = state.len(); "preloaded persisted state");
        Ok(())
    }

    /// Read a property.
    pub fn get_item(&self, key: PersistedProperty) -> Option<Value> {
        let state = self
            .state
            .read()
            .expect("thread holding storage lock should not panic");
        state.get(key.as_str()).cloned()
    }

    /// Write a property. Writing `Value::Null` removes it.
    pub fn set_item(&self, key: PersistedProperty, value: Value) {
        if value.is_null() {
            self.remove_item(key);
            return;
        }
        {
            let mut state = self
                .state
                .write()
                .expect("thread holding storage lock should not panic");
            state.insert(key.as_str().to_owned(), value);
        }
        self.schedule_write();
    }

    /// Remove a property.
    pub fn remove_item(&self, key: PersistedProperty) {
        let removed = {
            let mut state = self
                .state
                .write()
                .expect("thread holding storage lock should not panic");
            state.remove(key.as_str()).is_some()
        };
        if removed {
            self.schedule_write();
        }
    }

    /// Read a property and deserialize it, treating malformed values as missing.
    pub(crate) fn get_as<T: DeserializeOwned>(&self, key: PersistedProperty) -> Option<T> {
        let value = self.get_item(key)?;
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!(target: "posthog", key = key.as_str(); "ignoring malformed persisted value: {:?}", err);
                None
            }
        }
    }

    /// Serialize and write a property. `None` removes it.
    pub(crate) fn set_as<T: Serialize>(&self, key: PersistedProperty, value: Option<&T>) {
        match value.map(serde_json::to_value) {
            None => self.remove_item(key),
            Some(Ok(value)) => self.set_item(key, value),
            Some(Err(err)) => {
                log::warn!(target: "posthog", key = key.as_str(); "failed to serialize persisted value: {:?}", err);
            }
        }
    }

    fn schedule_write(&self) {
        let Backend::Durable {
            store,
            writes,
            write_lock,
        } = &self.backend
        else {
            return;
        };

        let store = store.clone();
        let state = self.state.clone();
        let write_lock = write_lock.clone();
        writes.spawn(async move {
            let _guard = write_lock.lock().await;
            // Take the snapshot under the write lock so a later write never gets overtaken by an
            // older one.
            let snapshot = {
                let state = state
                    .read()
                    .expect("thread holding storage lock should not panic");
                serde_json::to_string(&*state)
            };
            let result = match snapshot {
                Ok(snapshot) => store.set_item(STORAGE_KEY, snapshot).await,
                Err(err) => Err(err.into()),
            };
            if let Err(err) = result {
                log::warn!(target: "posthog", "failed to persist state: {:?}", err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{FileStore, KeyValueStore, PersistedProperty, Storage, STORAGE_KEY};
    use crate::{tasks::BackgroundTasks, test_support::MemoryKeyValueStore};

    #[test]
    fn memory_storage_round_trips_values() {
        let storage = Storage::memory();
        storage.set_item(PersistedProperty::Props, json!({"plan": "pro", "seats": 3}));

        assert_eq!(
            storage.get_item(PersistedProperty::Props),
            Some(json!({"plan": "pro", "seats": 3}))
        );
    }

    #[test]
    fn setting_null_removes_the_property() {
        let storage = Storage::memory();
        storage.set_item(PersistedProperty::SessionId, json!("abc"));
        storage.set_item(PersistedProperty::SessionId, serde_json::Value::Null);

        assert_eq!(storage.get_item(PersistedProperty::SessionId), None);
    }

    #[test]
    fn malformed_typed_value_reads_as_missing() {
        let storage = Storage::memory();
        storage.set_item(PersistedProperty::SessionLastTimestamp, json!("not a number"));

        assert_eq!(
            storage.get_as::<i64>(PersistedProperty::SessionLastTimestamp),
            None
        );
    }

    #[tokio::test]
    async fn durable_storage_preloads_and_writes_back() {
        let backend = Arc::new(MemoryKeyValueStore::default());
        backend
            .set_item(STORAGE_KEY, json!({"distinct_id": "user-1"}).to_string())
            .await
            .unwrap();

        let tasks = BackgroundTasks::new();
        let storage = Storage::durable(backend.clone(), tasks.clone());
        assert_eq!(storage.get_item(PersistedProperty::DistinctId), None);

        storage.preload().await.unwrap();
        assert_eq!(
            storage.get_item(PersistedProperty::DistinctId),
            Some(json!("user-1"))
        );

        storage.set_item(PersistedProperty::AnonymousId, json!("anon-1"));
        tasks.settle().await;

        let raw = backend.get_item(STORAGE_KEY).await.unwrap().unwrap();
        let persisted: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            persisted,
            json!({"distinct_id": "user-1", "anonymous_id": "anon-1"})
        );
    }

    #[tokio::test]
    async fn values_written_before_preload_win() {
        let backend = Arc::new(MemoryKeyValueStore::default());
        backend
            .set_item(STORAGE_KEY, json!({"session_id": "stale"}).to_string())
            .await
            .unwrap();

        let storage = Storage::durable(backend, BackgroundTasks::new());
        storage.set_item(PersistedProperty::SessionId, json!("fresh"));
        storage.preload().await.unwrap();

        assert_eq!(
            storage.get_item(PersistedProperty::SessionId),
            Some(json!("fresh"))
        );
    }

    #[tokio::test]
    async fn preload_fails_on_corrupt_document() {
        let backend = Arc::new(MemoryKeyValueStore::default());
        backend
            .set_item(STORAGE_KEY, "{not json".to_owned())
            .await
            .unwrap();

        let storage = Storage::durable(backend, BackgroundTasks::new());
        assert!(storage.preload().await.is_err());
    }

    #[tokio::test]
    async fn file_store_reads_back_what_it_wrote() {
        let dir = std::env::temp_dir().join(format!("posthog-bridge-{}", uuid::Uuid::now_v7()));
        let store = FileStore::new(&dir);

        assert_eq!(store.get_item("key").await.unwrap(), None);
        store.set_item("key", "value".to_owned()).await.unwrap();
        assert_eq!(store.get_item("key").await.unwrap(), Some("value".to_owned()));
        store.remove_item("key").await.unwrap();
        store.remove_item("key").await.unwrap();
        assert_eq!(store.get_item("key").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(dir);
    }
}
