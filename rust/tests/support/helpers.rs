use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nostr_sdk::prelude::*;
use quill_core::{
    AppConfig, EngineContext, KvStore, MemoryKvStore, MemorySecretStore, SecretStore,
};

use super::mock_pool::ScriptedRelayPool;

pub const BOOTSTRAP_RELAY: &str = "wss://bootstrap.example";

pub async fn wait_until(what: &str, timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{what}: condition not met within {timeout:?}");
}

pub fn test_config() -> AppConfig {
    AppConfig {
        disable_network: Some(false),
        bootstrap_relays: Some(vec![BOOTSTRAP_RELAY.to_string()]),
        ..AppConfig::default()
    }
}

pub struct Harness {
    pub pool: Arc<ScriptedRelayPool>,
    pub secrets: Arc<dyn SecretStore>,
    pub kv: Arc<dyn KvStore>,
    pub config: AppConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            pool: ScriptedRelayPool::new(),
            secrets: Arc::new(MemorySecretStore::new()),
            kv: Arc::new(MemoryKvStore::new()),
            config: test_config(),
        }
    }

    /// Another instance on the same machine: shared secrets and KV, own relays.
    pub fn sibling(&self) -> Self {
        Self {
            pool: ScriptedRelayPool::new(),
            secrets: self.secrets.clone(),
            kv: self.kv.clone(),
            config: self.config.clone(),
        }
    }

    pub fn ctx(&self) -> EngineContext {
        EngineContext {
            relay_pool: self.pool.clone(),
            secrets: self.secrets.clone(),
            kv: self.kv.clone(),
            config: self.config.clone(),
        }
    }
}

pub fn now_secs() -> u64 {
    Timestamp::now().as_secs()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

pub fn sign(keys: &Keys, builder: EventBuilder, at: u64) -> Event {
    builder
        .custom_created_at(Timestamp::from_secs(at))
        .sign_with_keys(keys)
        .unwrap()
}

pub fn profile_event(keys: &Keys, name: &str, at: u64) -> Event {
    sign(keys, EventBuilder::metadata(&Metadata::new().name(name)), at)
}

/// `relays` are `(url, marker)` pairs; an empty marker means read+write.
pub fn relay_list_event(keys: &Keys, relays: &[(&str, &str)], at: u64) -> Event {
    let tags = relays
        .iter()
        .map(|&(url, marker)| {
            if marker.is_empty() {
                Tag::parse(["r", url]).unwrap()
            } else {
                Tag::parse(["r", url, marker]).unwrap()
            }
        })
        .collect::<Vec<_>>();
    sign(keys, EventBuilder::new(Kind::RelayList, "").tags(tags), at)
}

pub fn contact_list_event(keys: &Keys, content: &str, at: u64) -> Event {
    sign(keys, EventBuilder::new(Kind::ContactList, content), at)
}

pub fn status_event(
    keys: &Keys,
    content: &str,
    link: Option<&str>,
    expiration: Option<u64>,
    at: u64,
) -> Event {
    let mut tags = vec![Tag::identifier("general")];
    if let Some(link) = link {
        tags.push(Tag::parse(["r", link]).unwrap());
    }
    if let Some(exp) = expiration {
        tags.push(Tag::expiration(Timestamp::from_secs(exp)));
    }
    sign(
        keys,
        EventBuilder::new(Kind::from(30315u16), content).tags(tags),
        at,
    )
}

/// Values of every `name` tag, in order.
pub fn tag_values(ev: &Event, name: &str) -> Vec<String> {
    ev.tags
        .iter()
        .filter_map(|t| {
            let values = t.as_slice();
            (values.first().map(String::as_str) == Some(name))
                .then(|| values.get(1).cloned())
                .flatten()
        })
        .collect()
}
