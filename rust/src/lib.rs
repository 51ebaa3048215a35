//! Identity state synchronization for Nostr relays.
//!
//! The entry point is [`SyncEngine`]; everything it talks to sits behind
//! [`RelayPool`], [`SecretStore`] and [`KvStore`].

pub mod cache;
pub mod config;
pub mod echo;
pub mod engine;
pub mod error;
pub mod event_tags;
pub mod hashtag;
pub mod keys;
pub mod kv;
pub mod logging;
pub mod profile;
pub mod relay_list;
pub mod relay_pool;
pub mod secrets;
pub mod status;

pub use cache::{MetadataCache, MetadataCacheStore};
pub use config::{load_app_config, AppConfig};
pub use engine::{
    EngineContext, EnginePhase, KeyUpdateOutcome, SyncEngine, SyncOptions, UserStatusProps,
};
pub use error::{Error, Result};
pub use hashtag::parse_hashtags;
pub use keys::normalize_private_key;
pub use kv::{KvStore, MemoryKvStore, SqliteKvStore};
pub use relay_list::{apply_write_overlay, resolve_relay_list, RelayMap, RelayPolicy};
pub use relay_pool::{
    EventStream, LiveSubscription, NostrRelayPool, RelayPool, SendOutcome,
};
pub use secrets::{
    spawn_secret_poller, FileSecretStore, KeyringSecretStore, MemorySecretStore, SecretChange,
    SecretStore,
};
pub use status::{UserStatus, UserStatusValue};
