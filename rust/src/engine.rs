//! Identity state synchronization.
//!
//! [`SyncEngine`] mirrors the profile, relay list and user status of the
//! configured identity. State comes from three places: the persisted
//! metadata cache, one-shot fetches against relays, and a live subscription.
//! All of it funnels through the engine; the resolver, status model and
//! cache are helpers it calls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::cache::{is_stale, now_millis, MetadataCache, MetadataCacheStore};
use crate::config::AppConfig;
use crate::echo::{BoundedIdSet, EchoSuppressor};
use crate::error::{Error, Result};
use crate::event_tags::{expiration, tag_value};
use crate::hashtag::parse_hashtags;
use crate::keys::{normalize_private_key, KeyRotationLock, PRIVATE_KEY_SECRET};
use crate::kv::KvStore;
use crate::profile::parse_profile;
use crate::relay_list::{
    apply_write_overlay, is_relay_list_kind, parse_relay_list_event, select_relay_list_event,
    RelayMap,
};
use crate::relay_pool::{LiveSubscription, RelayPool};
use crate::secrets::SecretStore;
use crate::status::{UserStatus, UserStatusValue};

pub const USER_STATUS_KIND: u16 = 30315;
/// `d` tag of the status slot this engine reads and writes.
pub const USER_STATUS_IDENTIFIER: &str = "general";

pub fn user_status_kind() -> Kind {
    Kind::from(USER_STATUS_KIND)
}

/// Collaborators the engine is wired to.
#[derive(Clone)]
pub struct EngineContext {
    pub relay_pool: Arc<dyn RelayPool>,
    pub secrets: Arc<dyn SecretStore>,
    pub kv: Arc<dyn KvStore>,
    pub config: AppConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Uninitialized,
    Ready,
    Syncing,
    Rotating,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub sync_metadata: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStatusProps {
    pub status: String,
    /// Empty means no link.
    pub link_url: String,
    /// Unix seconds.
    pub expiration: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUpdateOutcome {
    Applied,
    /// Another holder owns the rotation lock; nothing was changed.
    Contended,
}

struct State {
    phase: EnginePhase,
    profile: Metadata,
    profile_created_at: Option<u64>,
    /// Relay map derived from events, without the write overlay.
    relays: RelayMap,
    relays_created_at: Option<u64>,
    /// Unix ms of the last completed metadata sync (or restored cache).
    last_updated: u64,
    /// Bumped on every clear; a live subscription only writes state while
    /// this still matches the value it started with.
    live_generation: u64,
}

impl State {
    fn new() -> Self {
        Self {
            phase: EnginePhase::Uninitialized,
            profile: Metadata::default(),
            profile_created_at: None,
            relays: RelayMap::new(),
            relays_created_at: None,
            last_updated: 0,
            live_generation: 0,
        }
    }

    fn clear(&mut self) {
        self.profile = Metadata::default();
        self.profile_created_at = None;
        self.relays = RelayMap::new();
        self.relays_created_at = None;
        self.last_updated = 0;
        self.live_generation = self.live_generation.wrapping_add(1);
    }

    /// Install a profile event unless the installed one is newer.
    fn install_profile(&mut self, ev: &Event) -> bool {
        let created_at = ev.created_at.as_secs();
        if self.profile_created_at.is_some_and(|cur| created_at < cur) {
            tracing::debug!(id = %ev.id, created_at, "ignoring older profile event");
            return false;
        }
        self.profile = parse_profile(ev);
        self.profile_created_at = Some(created_at);
        true
    }

    fn install_relay_list(&mut self, ev: &Event) -> bool {
        let created_at = ev.created_at.as_secs();
        if self.relays_created_at.is_some_and(|cur| created_at < cur) {
            tracing::debug!(id = %ev.id, created_at, "ignoring older relay list event");
            return false;
        }
        self.relays = parse_relay_list_event(ev);
        self.relays_created_at = Some(created_at);
        true
    }
}

struct LiveTask {
    task: JoinHandle<()>,
    key: u64,
}

#[derive(Default)]
struct Tasks {
    subscription: Option<LiveTask>,
    key_listener: Option<JoinHandle<()>>,
    publishes: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        if let Some(live) = self.subscription.take() {
            live.task.abort();
        }
        if let Some(h) = self.key_listener.take() {
            h.abort();
        }
        for h in self.publishes.drain(..) {
            h.abort();
        }
    }
}

struct Inner {
    pool: Arc<dyn RelayPool>,
    secrets: Arc<dyn SecretStore>,
    config: AppConfig,
    cache: MetadataCacheStore,
    rotation_lock: KeyRotationLock,
    state: Mutex<State>,
    status: UserStatus,
    echo: Mutex<EchoSuppressor>,
    /// Set by the instance that is writing the private key, so it can tell
    /// its own change notification from another instance's.
    key_update_initiator: AtomicBool,
    tasks: Mutex<Tasks>,
}

/// Cloneable handle; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

/// Restores the previous phase on drop if nobody moved the engine on.
struct PhaseGuard {
    inner: Arc<Inner>,
    entered: Option<(EnginePhase, EnginePhase)>,
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if let Some((previous, current)) = self.entered {
            let mut st = self.inner.state.lock();
            if st.phase == current {
                st.phase = previous;
            }
        }
    }
}

impl SyncEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let lease = ctx.config.key_rotation_lock_lease();
        let capacity = ctx.config.sent_event_id_capacity();
        Self {
            inner: Arc::new(Inner {
                pool: ctx.relay_pool,
                secrets: ctx.secrets,
                cache: MetadataCacheStore::new(ctx.kv.clone()),
                rotation_lock: KeyRotationLock::new(ctx.kv, lease),
                config: ctx.config,
                state: Mutex::new(State::new()),
                status: UserStatus::new(),
                echo: Mutex::new(EchoSuppressor::new(capacity)),
                key_update_initiator: AtomicBool::new(false),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    /// Restore the cache, sync (metadata only when the cache is stale), open
    /// the live subscription and start following key changes.
    pub async fn init(ctx: EngineContext) -> Result<Self> {
        let engine = Self::new(ctx);
        engine.restore_metadata_from_cache().await?;

        if engine.inner.config.network_enabled() {
            let sync_metadata = is_stale(engine.last_updated(), now_millis());
            if let Err(e) = engine
                .sync_states_with_relays(SyncOptions { sync_metadata })
                .await
            {
                tracing::error!(%e, "initial sync failed");
            }
            if let Err(e) = engine.start_states_sync_subscription().await {
                tracing::error!(%e, "failed to start states sync subscription");
            }
        } else {
            tracing::info!("network disabled; skipping relay sync");
        }

        engine.listen_private_key_change();
        Ok(engine)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.phase() == EnginePhase::Disposed {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn enter_phase(&self, phase: EnginePhase) -> PhaseGuard {
        let mut st = self.inner.state.lock();
        let entered = if st.phase == EnginePhase::Disposed {
            None
        } else {
            let previous = std::mem::replace(&mut st.phase, phase);
            Some((previous, phase))
        };
        PhaseGuard {
            inner: self.inner.clone(),
            entered,
        }
    }

    /* accessors */

    pub fn phase(&self) -> EnginePhase {
        self.inner.state.lock().phase
    }

    pub fn profile(&self) -> Metadata {
        self.inner.state.lock().profile.clone()
    }

    /// Relay map with the configured additional write relays applied.
    pub fn relays(&self) -> RelayMap {
        let relays = self.inner.state.lock().relays.clone();
        apply_write_overlay(&relays, &self.inner.config.additional_write_relays())
    }

    pub async fn relay_states(&self) -> BTreeMap<String, String> {
        self.inner.pool.relay_states().await
    }

    pub fn user_status(&self) -> UserStatusValue {
        self.inner.status.value()
    }

    pub fn last_updated(&self) -> u64 {
        self.inner.state.lock().last_updated
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Stored private key as 64-char hex.
    pub fn private_key(&self) -> Result<Option<String>> {
        self.ensure_live()?;
        self.inner.secrets.get(PRIVATE_KEY_SECRET)
    }

    pub fn is_private_key_set(&self) -> Result<bool> {
        Ok(self.private_key()?.is_some())
    }

    pub fn public_key(&self) -> Result<Option<PublicKey>> {
        Ok(self.keys()?.map(|k| k.public_key()))
    }

    fn keys(&self) -> Result<Option<Keys>> {
        let Some(hex) = self.private_key()? else {
            return Ok(None);
        };
        match Keys::parse(&hex) {
            Ok(keys) => Ok(Some(keys)),
            Err(e) => {
                tracing::error!(%e, "stored private key is unusable; treating as unset");
                Ok(None)
            }
        }
    }

    /* cache */

    /// Adopt the persisted cache if it is newer than what is in memory.
    /// Returns whether anything was restored.
    pub async fn restore_metadata_from_cache(&self) -> Result<bool> {
        self.ensure_live()?;
        let restored = {
            let cache = self.inner.cache.load();
            let mut st = self.inner.state.lock();
            if st.phase == EnginePhase::Uninitialized {
                st.phase = EnginePhase::Ready;
            }
            match cache {
                None => None,
                Some(cache) if st.last_updated >= cache.last_updated => {
                    tracing::debug!(
                        in_memory = st.last_updated,
                        cached = cache.last_updated,
                        "in-memory metadata is newer than cache"
                    );
                    None
                }
                Some(cache) => {
                    st.last_updated = cache.last_updated;
                    st.profile = cache.profile;
                    st.profile_created_at = cache.profile_created_at;
                    st.relays = cache.relays;
                    st.relays_created_at = cache.relays_created_at;
                    Some(st.relays.len())
                }
            }
        };

        let Some(relay_count) = restored else {
            return Ok(false);
        };
        tracing::info!(relays = relay_count, "restored metadata from cache");
        if relay_count > 0 {
            self.inner.pool.switch_relays(&self.relays()).await?;
        }
        Ok(true)
    }

    pub fn save_metadata_to_cache(&self) -> Result<()> {
        self.ensure_live()?;
        let cache = {
            let st = self.inner.state.lock();
            MetadataCache {
                last_updated: st.last_updated,
                profile: st.profile.clone(),
                relays: st.relays.clone(),
                profile_created_at: st.profile_created_at,
                relays_created_at: st.relays_created_at,
            }
        };
        self.inner.cache.save(&cache)
    }

    /* one-shot sync */

    /// Fetch the newest state from relays. Without a private key this is a
    /// logged no-op.
    pub async fn sync_states_with_relays(&self, opts: SyncOptions) -> Result<()> {
        self.ensure_live()?;
        let Some(pubkey) = self.public_key()? else {
            tracing::info!("private key is not set; skipping sync");
            return Ok(());
        };
        let _phase = self.enter_phase(EnginePhase::Syncing);

        if opts.sync_metadata {
            self.sync_metadata_with_relays(pubkey).await?;
        }
        self.sync_user_status_with_relays(pubkey).await
    }

    /// Read relays of the current map, or the bootstrap relays as a
    /// read-only map when there are none.
    fn read_relays_or_bootstrap(&self) -> (Vec<String>, RelayMap) {
        let relays = self.relays();
        let read = relays.read_urls();
        if !read.is_empty() {
            return (read, relays);
        }
        let bootstrap = self.inner.config.bootstrap_relays();
        tracing::debug!(relays = ?bootstrap, "no read relays; using bootstrap relays");
        let map = RelayMap::read_only(bootstrap.iter().cloned());
        (bootstrap, map)
    }

    async fn sync_metadata_with_relays(&self, pubkey: PublicKey) -> Result<()> {
        tracing::info!("started syncing metadata with relays");
        let (read, fetch_relays) = self.read_relays_or_bootstrap();
        self.inner.pool.switch_relays(&fetch_relays).await?;

        let fetched = self
            .inner
            .pool
            .fetch_last_event_per_kind(
                &[Kind::Metadata, Kind::ContactList, Kind::RelayList],
                &read,
                pubkey,
            )
            .await;

        let mut profile_ev: Option<Event> = None;
        let mut relay_evs: Vec<Event> = Vec::new();
        for (kind, ev) in fetched {
            tracing::debug!(kind = kind.as_u16(), found = ev.is_some(), "fetched");
            let Some(ev) = ev else {
                continue;
            };
            if kind == Kind::Metadata {
                profile_ev = Some(ev);
            } else if is_relay_list_kind(kind) {
                relay_evs.push(ev);
            }
        }

        {
            let mut st = self.inner.state.lock();
            match profile_ev.as_ref() {
                Some(ev) => {
                    st.install_profile(ev);
                }
                None => {
                    st.profile = Metadata::default();
                    st.profile_created_at = None;
                }
            }
            match select_relay_list_event(relay_evs.iter()) {
                Some(ev) => {
                    st.install_relay_list(ev);
                }
                None => {
                    st.relays = RelayMap::new();
                    st.relays_created_at = None;
                }
            }
            st.last_updated = now_millis();
        }

        self.save_metadata_to_cache()?;
        self.inner.pool.switch_relays(&self.relays()).await?;
        tracing::info!(relays = self.relays().len(), "finished syncing metadata with relays");
        Ok(())
    }

    async fn sync_user_status_with_relays(&self, pubkey: PublicKey) -> Result<()> {
        tracing::info!("started syncing user status with relays");
        let (read, _) = self.read_relays_or_bootstrap();
        let filter = Filter::new()
            .kind(user_status_kind())
            .author(pubkey)
            .identifier(USER_STATUS_IDENTIFIER);

        match self.inner.pool.fetch_last_event(&read, filter).await {
            None => {
                tracing::debug!("no user status event");
                self.inner.status.clear();
            }
            Some(ev) => self.apply_user_status_event(&ev),
        }
        Ok(())
    }

    fn apply_user_status_event(&self, ev: &Event) {
        self.inner
            .status
            .update(ev.content.clone(), tag_value(ev, "r"), expiration(ev));
    }

    /* live sync */

    /// (Re)open the live subscription for the current identity. Any previous
    /// subscription is stopped first.
    pub async fn start_states_sync_subscription(&self) -> Result<()> {
        self.ensure_live()?;
        self.stop_states_sync_subscription().await;
        let Some(pubkey) = self.public_key()? else {
            tracing::info!("private key is not set; no states sync subscription");
            return Ok(());
        };
        let generation = self.inner.state.lock().live_generation;

        let since = Timestamp::now();
        let filters = vec![
            Filter::new()
                .kinds([Kind::Metadata, Kind::ContactList, Kind::RelayList])
                .author(pubkey)
                .since(since),
            Filter::new()
                .kind(user_status_kind())
                .author(pubkey)
                .identifier(USER_STATUS_IDENTIFIER)
                .since(since),
        ];
        let LiveSubscription { key, events } = self.inner.pool.subscribe(filters).await?;

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let capacity = self.inner.config.sent_event_id_capacity();
        let task = tokio::spawn(async move {
            let mut seen = BoundedIdSet::new(capacity);
            while let Ok(event) = events.recv_async().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SyncEngine { inner }
                    .handle_live_event(pubkey, generation, &mut seen, event)
                    .await;
            }
            tracing::debug!("states sync subscription ended");
        });

        let replaced = self
            .inner
            .tasks
            .lock()
            .subscription
            .replace(LiveTask { task, key });
        if let Some(old) = replaced {
            old.task.abort();
            self.inner.pool.unsubscribe(old.key).await;
        }
        tracing::info!(%pubkey, "started states sync subscription");
        Ok(())
    }

    /// Stop the live subscription, if any, and close it on the relays.
    async fn stop_states_sync_subscription(&self) {
        let live = self.inner.tasks.lock().subscription.take();
        if let Some(live) = live {
            live.task.abort();
            self.inner.pool.unsubscribe(live.key).await;
            tracing::debug!("stopped states sync subscription");
        }
    }

    /// Run `f` on the state unless it was cleared after the subscription
    /// that delivered the event started.
    fn with_live_state<R>(&self, generation: u64, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        let mut st = self.inner.state.lock();
        if st.live_generation != generation {
            tracing::debug!("dropping event from a superseded subscription");
            return None;
        }
        Some(f(&mut st))
    }

    async fn handle_live_event(
        &self,
        author: PublicKey,
        generation: u64,
        seen: &mut BoundedIdSet,
        event: Event,
    ) {
        if event.pubkey != author {
            tracing::debug!(id = %event.id, "ignoring event from another author");
            return;
        }
        if let Err(e) = event.verify() {
            tracing::warn!(%e, id = %event.id, "dropping event with invalid signature");
            return;
        }
        // Same event delivered by several relays.
        if !seen.insert(event.id) {
            return;
        }
        if self.inner.echo.lock().should_ignore(&event.id) {
            tracing::debug!(id = %event.id, "ignoring echo of own event");
            return;
        }

        tracing::debug!(id = %event.id, kind = event.kind.as_u16(), "received from relays");
        if event.kind == Kind::Metadata {
            self.with_live_state(generation, |st| st.install_profile(&event));
        } else if is_relay_list_kind(event.kind) {
            let installed = self.with_live_state(generation, |st| st.install_relay_list(&event));
            if installed == Some(true) {
                if let Err(e) = self.inner.pool.switch_relays(&self.relays()).await {
                    tracing::error!(%e, "failed to switch relays");
                }
            }
        } else if event.kind.as_u16() == USER_STATUS_KIND {
            // Held under the state lock so a concurrent clear cannot slip in.
            self.with_live_state(generation, |_| self.apply_user_status_event(&event));
        }
    }

    /* publishing */

    /// Publish a kind 1 note with a `t` tag per hashtag in `content`.
    pub async fn post_text(&self, content: &str) -> Result<EventId> {
        self.ensure_live()?;
        let keys = self.keys()?.ok_or(Error::PrivateKeyNotSet)?;

        let mut tags = Vec::new();
        for hashtag in parse_hashtags(content) {
            tags.push(Tag::parse(["t", hashtag.as_str()]).map_err(|e| Error::Signing(e.to_string()))?);
        }
        let event = EventBuilder::new(Kind::TextNote, content)
            .tags(tags)
            .sign_with_keys(&keys)
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(self.publish(event))
    }

    /// Publish a status event and show it locally without waiting for relays.
    pub async fn update_user_status(&self, props: UserStatusProps) -> Result<EventId> {
        self.ensure_live()?;
        let keys = self.keys()?.ok_or(Error::PrivateKeyNotSet)?;

        let mut tags = vec![Tag::identifier(USER_STATUS_IDENTIFIER)];
        if !props.link_url.is_empty() {
            tags.push(
                Tag::parse(["r", props.link_url.as_str()])
                    .map_err(|e| Error::Signing(e.to_string()))?,
            );
        }
        if let Some(exp) = props.expiration {
            tags.push(Tag::expiration(Timestamp::from_secs(exp)));
        }
        let event = EventBuilder::new(user_status_kind(), props.status.as_str())
            .tags(tags)
            .sign_with_keys(&keys)
            .map_err(|e| Error::Signing(e.to_string()))?;

        let id = self.publish(event);
        self.inner
            .status
            .update(props.status, props.link_url, props.expiration);
        Ok(id)
    }

    /// Record the id, then hand the event to the relays in the background.
    fn publish(&self, event: Event) -> EventId {
        let id = event.id;
        self.inner.echo.lock().record(id);
        tracing::info!(%id, kind = event.kind.as_u16(), "sending event");

        let pool = self.inner.pool.clone();
        let handle = tokio::spawn(async move {
            match pool.send(&event).await {
                Ok(outcome) => tracing::info!(
                    %id,
                    success = ?outcome.success,
                    failed = ?outcome.failed,
                    "event sent"
                ),
                Err(e) => tracing::error!(%e, %id, "failed to send event"),
            }
        });
        let mut tasks = self.inner.tasks.lock();
        tasks.publishes.retain(|h| !h.is_finished());
        tasks.publishes.push(handle);
        id
    }

    /// Wait for background publishes started so far.
    pub async fn wait_for_pending_publishes(&self) {
        let pending = std::mem::take(&mut self.inner.tasks.lock().publishes);
        for handle in pending {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(%e, "publish task failed");
                }
            }
        }
    }

    /* key rotation */

    /// Store a new private key (`nsec1...` or hex), then rebuild all state
    /// for the new identity.
    pub async fn update_private_key(&self, input: &str) -> Result<KeyUpdateOutcome> {
        self.ensure_live()?;
        let hex = normalize_private_key(input).ok_or(Error::InvalidPrivateKey)?;

        let Some(_lock) = self.inner.rotation_lock.try_acquire()? else {
            tracing::warn!("private key is being updated by another instance; abort");
            return Ok(KeyUpdateOutcome::Contended);
        };
        let _phase = self.enter_phase(EnginePhase::Rotating);
        tracing::info!("started updating private key");

        self.write_secret(|secrets| secrets.store(PRIVATE_KEY_SECRET, &hex))?;

        // The initiator owns the shared cache.
        self.clear_states().await?;
        self.inner.cache.invalidate()?;
        let synced = self
            .sync_states_with_relays(SyncOptions {
                sync_metadata: true,
            })
            .await
            .and_then(|()| self.save_metadata_to_cache());
        self.start_states_sync_subscription().await?;
        synced?;

        tracing::info!("finished updating private key");
        Ok(KeyUpdateOutcome::Applied)
    }

    pub async fn clear_private_key(&self) -> Result<KeyUpdateOutcome> {
        self.ensure_live()?;
        let Some(_lock) = self.inner.rotation_lock.try_acquire()? else {
            tracing::warn!("private key is being updated by another instance; abort");
            return Ok(KeyUpdateOutcome::Contended);
        };
        let _phase = self.enter_phase(EnginePhase::Rotating);
        tracing::info!("started clearing private key");

        self.write_secret(|secrets| secrets.delete(PRIVATE_KEY_SECRET))?;

        self.clear_states().await?;
        self.inner.cache.invalidate()?;

        tracing::info!("finished clearing private key");
        Ok(KeyUpdateOutcome::Applied)
    }

    /// The flag goes up before the write because the notification may reach
    /// the listener before `write` returns. It stays up only if the store
    /// reports that it actually sent one.
    fn write_secret(&self, write: impl FnOnce(&dyn SecretStore) -> Result<bool>) -> Result<()> {
        self.inner
            .key_update_initiator
            .store(true, Ordering::SeqCst);
        let notified = write(self.inner.secrets.as_ref());
        if !matches!(notified, Ok(true)) {
            self.inner
                .key_update_initiator
                .store(false, Ordering::SeqCst);
        }
        notified.map(|_| ())
    }

    async fn clear_states(&self) -> Result<()> {
        tracing::info!("clearing internal states");
        // Events for the previous identity must not land in the cleared state.
        self.stop_states_sync_subscription().await;
        self.inner.pool.switch_relays(&RelayMap::new()).await?;
        self.inner.state.lock().clear();
        self.inner.status.clear();
        Ok(())
    }

    fn listen_private_key_change(&self) {
        let mut rx = self.inner.secrets.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let change = match rx.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "secret change listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if change.key != PRIVATE_KEY_SECRET {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SyncEngine { inner }.on_private_key_changed().await;
            }
        });
        if let Some(old) = self.inner.tasks.lock().key_listener.replace(handle) {
            old.abort();
        }
    }

    async fn on_private_key_changed(&self) {
        if self
            .inner
            .key_update_initiator
            .swap(false, Ordering::SeqCst)
        {
            tracing::debug!("own private key change; resetting initiator flag");
            return;
        }
        if self.phase() == EnginePhase::Disposed {
            return;
        }

        // Another instance rotated the key; it already took care of the cache.
        tracing::info!("clearing and refetching states due to private key update");
        if let Err(e) = self.clear_states().await {
            tracing::error!(%e, "failed to clear states");
        }
        if let Err(e) = self
            .sync_states_with_relays(SyncOptions {
                sync_metadata: true,
            })
            .await
        {
            tracing::error!(%e, "resync after key change failed");
        }
        if let Err(e) = self.start_states_sync_subscription().await {
            tracing::error!(%e, "failed to restart states sync subscription");
        }
    }

    /* lifecycle */

    /// Stop background work and close relay connections. Every later
    /// operation fails with [`Error::Disposed`].
    pub async fn dispose(&self) {
        {
            let mut st = self.inner.state.lock();
            if st.phase == EnginePhase::Disposed {
                return;
            }
            st.phase = EnginePhase::Disposed;
        }
        self.inner.tasks.lock().abort_all();
        self.inner.status.clear();
        self.inner.pool.shutdown().await;
        tracing::info!("engine disposed");
    }
}
