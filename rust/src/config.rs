use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "quill_config.json";

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_KEY_ROTATION_LOCK_LEASE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SENT_EVENT_ID_CAPACITY: usize = 8192;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub disable_network: Option<bool>,
    pub bootstrap_relays: Option<Vec<String>>,
    /// Named built-in relay profile used when `bootstrap_relays` is unset.
    pub relay_profile: Option<String>,
    pub additional_write_relays: Option<Vec<String>>,
    pub default_status: Option<String>,
    pub default_status_link: Option<String>,
    pub fetch_timeout_secs: Option<u64>,
    // A lock older than this is treated as abandoned by a crashed instance.
    pub key_rotation_lock_lease_secs: Option<u64>,
    pub sent_event_id_capacity: Option<usize>,
}

/// Read `quill_config.json` from `data_dir`. Missing or unparseable files
/// yield the defaults.
pub fn load_app_config(data_dir: &Path) -> AppConfig {
    let path = data_dir.join(CONFIG_FILE_NAME);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(%e, path = %path.display(), "ignoring unparseable config");
            AppConfig::default()
        }
    }
}

pub fn default_app_config_json() -> String {
    let config = AppConfig {
        bootstrap_relays: Some(quill_relay_profiles::default_bootstrap_relays()),
        additional_write_relays: Some(vec![]),
        ..AppConfig::default()
    };
    serde_json::to_string_pretty(&config).unwrap_or_else(|_| "{}".to_string())
}

impl AppConfig {
    pub fn network_enabled(&self) -> bool {
        // Used to keep tests deterministic and offline.
        if let Some(disable) = self.disable_network {
            return !disable;
        }
        std::env::var("QUILL_DISABLE_NETWORK").ok().as_deref() != Some("1")
    }

    pub fn bootstrap_relays(&self) -> Vec<String> {
        let values = self.bootstrap_relays.as_deref().unwrap_or_default();
        let profile = match self.relay_profile.as_deref() {
            None => quill_relay_profiles::default_profile(),
            Some(name) => quill_relay_profiles::profile_by_name(name).unwrap_or_else(|| {
                tracing::warn!(name, "unknown relay profile; using default");
                quill_relay_profiles::default_profile()
            }),
        };
        quill_relay_profiles::resolve_relay_urls(values, profile.bootstrap_relays)
    }

    pub fn additional_write_relays(&self) -> Vec<String> {
        quill_relay_profiles::valid_relay_urls(
            self.additional_write_relays.as_deref().unwrap_or_default(),
        )
    }

    pub fn default_status(&self) -> String {
        self.default_status.clone().unwrap_or_default()
    }

    pub fn default_status_link(&self) -> String {
        self.default_status_link.clone().unwrap_or_default()
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FETCH_TIMEOUT)
    }

    pub fn key_rotation_lock_lease(&self) -> Duration {
        self.key_rotation_lock_lease_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEY_ROTATION_LOCK_LEASE)
    }

    pub fn sent_event_id_capacity(&self) -> usize {
        self.sent_event_id_capacity
            .filter(|c| *c > 0)
            .unwrap_or(DEFAULT_SENT_EVENT_ID_CAPACITY)
    }
}
