//! Secret storage for the identity's private key.
//!
//! Every store broadcasts a [`SecretChange`] to all subscribers, the writer
//! included, whenever a value changes. Stores backed by storage that other
//! processes can write to also detect those writes in
//! [`SecretStore::poll_external_changes`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use keyring_core::{Entry, Error as KeyringError};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretChange {
    pub key: String,
}

pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether a [`SecretChange`] was broadcast for this write.
    fn store(&self, key: &str, value: &str) -> Result<bool>;

    /// Returns whether a [`SecretChange`] was broadcast for this delete.
    fn delete(&self, key: &str) -> Result<bool>;
    fn subscribe(&self) -> broadcast::Receiver<SecretChange>;

    /// Re-read the backing storage and notify about values other processes
    /// changed since the last observation.
    fn poll_external_changes(&self) -> Result<()> {
        Ok(())
    }
}

/// Last observed value per key plus the change channel.
struct ChangeTracker {
    tx: broadcast::Sender<SecretChange>,
    observed: Mutex<HashMap<String, Option<String>>>,
}

impl ChangeTracker {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            tx,
            observed: Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretChange> {
        self.tx.subscribe()
    }

    fn observe(&self, key: &str, value: Option<&str>) {
        self.observed
            .lock()
            .insert(key.to_string(), value.map(ToString::to_string));
    }

    /// Seed the snapshot for `key` without overwriting an existing one.
    fn observe_if_unseen(&self, key: &str, value: Option<&str>) {
        self.observed
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| value.map(ToString::to_string));
    }

    /// Record `value` and notify if it differs from the previous observation.
    /// Returns whether a notification went out.
    fn changed(&self, key: &str, value: Option<&str>) -> bool {
        let previous = self
            .observed
            .lock()
            .insert(key.to_string(), value.map(ToString::to_string));
        if previous.as_ref().map(|p| p.as_deref()) == Some(value) {
            return false;
        }
        // No receivers is fine.
        let _ = self.tx.send(SecretChange {
            key: key.to_string(),
        });
        true
    }

    fn watched_keys(&self) -> Vec<String> {
        self.observed.lock().keys().cloned().collect()
    }
}

/// In-process store. Instances sharing one `Arc` behave like processes
/// sharing a keychain.
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
    tracker: ChangeTracker,
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            tracker: ChangeTracker::new(),
        }
    }
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<bool> {
        let previous = self
            .values
            .lock()
            .insert(key.to_string(), value.to_string());
        self.tracker.observe(key, previous.as_deref());
        Ok(self.tracker.changed(key, Some(value)))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let previous = self.values.lock().remove(key);
        self.tracker.observe(key, previous.as_deref());
        Ok(self.tracker.changed(key, None))
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretChange> {
        self.tracker.subscribe()
    }
}

/// JSON file of `key -> value` in the data dir.
pub struct FileSecretStore {
    path: PathBuf,
    tracker: ChangeTracker,
}

impl FileSecretStore {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let store = Self {
            path: data_dir.join("secrets.json"),
            tracker: ChangeTracker::new(),
        };
        for (key, value) in store.read_all()? {
            store.tracker.observe(&key, Some(&value));
        }
        Ok(store)
    }

    fn read_all(&self) -> Result<HashMap<String, String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw).map_err(|e| Error::Secret(format!("parse secrets file: {e}")))
    }

    fn write_all(&self, values: &HashMap<String, String>) -> Result<()> {
        let body = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, format!("{body}\n"))?;
        restrict_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn store(&self, key: &str, value: &str) -> Result<bool> {
        let mut values = self.read_all()?;
        values.insert(key.to_string(), value.to_string());
        self.write_all(&values)?;
        Ok(self.tracker.changed(key, Some(value)))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let mut values = self.read_all()?;
        if values.remove(key).is_some() {
            self.write_all(&values)?;
        }
        Ok(self.tracker.changed(key, None))
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretChange> {
        self.tracker.subscribe()
    }

    fn poll_external_changes(&self) -> Result<()> {
        let values = self.read_all()?;
        let mut keys = self.tracker.watched_keys();
        keys.extend(values.keys().cloned());
        keys.sort();
        keys.dedup();
        for key in keys {
            self.tracker
                .changed(&key, values.get(&key).map(String::as_str));
        }
        Ok(())
    }
}

/// Platform credential store through `keyring-core`.
///
/// The host must install a default store (`keyring_core::set_default_store`)
/// before use.
pub struct KeyringSecretStore {
    service_id: String,
    tracker: ChangeTracker,
}

impl KeyringSecretStore {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            tracker: ChangeTracker::new(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service_id, key).map_err(|e| {
            Error::Secret(format!(
                "Failed to create keyring entry for service='{}', key='{}': {}",
                self.service_id, key, e
            ))
        })
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_secret() {
            Ok(secret) => String::from_utf8(secret)
                .map(Some)
                .map_err(|_| Error::Secret(format!("stored secret '{key}' is not utf-8"))),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(KeyringError::NoStorageAccess(err)) => Err(Error::Secret(format!(
                "keyring store not initialized: {err}"
            ))),
            Err(e) => Err(Error::Secret(format!(
                "Failed to read '{key}' from keyring: {e}"
            ))),
        }
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.read(key)?;
        // Only the first read seeds the snapshot; later reads must not hide
        // another process's write from the next poll.
        self.tracker.observe_if_unseen(key, value.as_deref());
        Ok(value)
    }

    fn store(&self, key: &str, value: &str) -> Result<bool> {
        self.entry(key)?
            .set_secret(value.as_bytes())
            .map_err(|e| Error::Secret(format!("Failed to store '{key}' in keyring: {e}")))?;
        Ok(self.tracker.changed(key, Some(value)))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(KeyringError::NoEntry) => {}
            Err(e) => {
                return Err(Error::Secret(format!(
                    "Failed to delete '{key}' from keyring: {e}"
                )))
            }
        }
        Ok(self.tracker.changed(key, None))
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretChange> {
        self.tracker.subscribe()
    }

    fn poll_external_changes(&self) -> Result<()> {
        for key in self.tracker.watched_keys() {
            let value = self.read(&key)?;
            self.tracker.changed(&key, value.as_deref());
        }
        Ok(())
    }
}

/// Periodically call [`SecretStore::poll_external_changes`] so writes made
/// by other processes reach this process's subscribers.
pub fn spawn_secret_poller(
    store: Arc<dyn SecretStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = store.poll_external_changes() {
                tracing::warn!(%e, "secret store poll failed");
            }
        }
    })
}
