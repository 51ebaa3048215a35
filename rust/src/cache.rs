//! Persisted snapshot of profile + relay list.

use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::Metadata;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::KvStore;
use crate::relay_list::RelayMap;

pub const METADATA_CACHE_KEY: &str = "nostrMetadataCache";
pub const METADATA_CACHE_MAX_AGE: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataCache {
    /// Unix milliseconds of the last completed metadata sync.
    pub last_updated: u64,
    pub profile: Metadata,
    pub relays: RelayMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_created_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relays_created_at: Option<u64>,
}

/// `now - last_updated > 12h`.
pub fn is_stale(last_updated_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(last_updated_ms) > METADATA_CACHE_MAX_AGE.as_millis() as u64
}

#[derive(Clone)]
pub struct MetadataCacheStore {
    kv: Arc<dyn KvStore>,
}

impl MetadataCacheStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Unreadable or unparseable caches are logged and treated as absent.
    pub fn load(&self) -> Option<MetadataCache> {
        let raw = match self.kv.get(METADATA_CACHE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(%e, "failed to read metadata cache");
                return None;
            }
        };
        match serde_json::from_str::<MetadataCache>(&raw) {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(%e, "ignoring unparseable metadata cache");
                None
            }
        }
    }

    pub fn save(&self, cache: &MetadataCache) -> Result<()> {
        let json = serde_json::to_string(cache)?;
        tracing::debug!(last_updated = cache.last_updated, relays = cache.relays.len(), "saving metadata cache");
        self.kv.set(METADATA_CACHE_KEY, Some(&json))
    }

    pub fn invalidate(&self) -> Result<()> {
        self.kv.set(METADATA_CACHE_KEY, None)
    }
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
