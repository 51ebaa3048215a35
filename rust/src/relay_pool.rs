//! Relay client seam.
//!
//! [`RelayPool`] is everything the engine needs from the network: switching
//! the active relay set, publishing, live subscriptions and one-shot
//! "newest event" fetches. [`NostrRelayPool`] implements it on a
//! `nostr-sdk` [`Client`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::relay_list::{RelayMap, RelayPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

/// Events delivered by a live subscription, in arrival order.
pub type EventStream = flume::Receiver<Event>;

/// An open live subscription. Pass `key` to [`RelayPool::unsubscribe`] to
/// close it on the relays.
pub struct LiveSubscription {
    pub key: u64,
    pub events: EventStream,
}

#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Reconfigure connections to match `relays`. Connections to urls present
    /// in both the old and new set are kept.
    async fn switch_relays(&self, relays: &RelayMap) -> Result<()>;

    /// Publish to every write relay of the active set.
    async fn send(&self, event: &Event) -> Result<SendOutcome>;

    /// Open a subscription on the read relays of the active set, including
    /// read relays added later.
    async fn subscribe(&self, filters: Vec<Filter>) -> Result<LiveSubscription>;

    /// Close a subscription opened by [`RelayPool::subscribe`]. Unknown keys
    /// are ignored.
    async fn unsubscribe(&self, key: u64);

    /// Newest event per kind across `relays`. Relays that fail or never
    /// answer contribute nothing.
    async fn fetch_last_event_per_kind(
        &self,
        kinds: &[Kind],
        relays: &[String],
        author: PublicKey,
    ) -> Vec<(Kind, Option<Event>)>;

    async fn fetch_last_event(&self, relays: &[String], filter: Filter) -> Option<Event>;

    /// `url -> connection status` for diagnostics.
    async fn relay_states(&self) -> BTreeMap<String, String>;

    async fn shutdown(&self);
}

struct Forwarder {
    task: JoinHandle<()>,
    ids: Vec<SubscriptionId>,
}

pub struct NostrRelayPool {
    client: Client,
    active: Mutex<RelayMap>,
    fetch_timeout: Duration,
    forwarders: Mutex<HashMap<u64, Forwarder>>,
    next_key: Mutex<u64>,
}

impl NostrRelayPool {
    pub fn new(fetch_timeout: Duration) -> Self {
        Self {
            client: Client::default(),
            active: Mutex::new(RelayMap::new()),
            fetch_timeout,
            forwarders: Mutex::new(HashMap::new()),
            next_key: Mutex::new(0),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Add `url` with exactly the roles of `policy`. Only read relays take
    /// part in (and inherit) pool subscriptions.
    async fn add_with_policy(&self, url: &RelayUrl, policy: RelayPolicy) {
        if policy.read {
            if let Err(e) = self.client.add_read_relay(url.clone()).await {
                tracing::warn!(%e, relay = %url, "add_read_relay failed");
            }
        }
        if policy.write {
            if let Err(e) = self.client.add_write_relay(url.clone()).await {
                tracing::warn!(%e, relay = %url, "add_write_relay failed");
            }
        }
    }

    /// Make `urls` reachable for one-shot requests. Relays not yet in the
    /// pool join without the read role, so live subscriptions stay off them.
    async fn ensure_connected(&self, urls: &[RelayUrl]) {
        let current = self.client.pool().all_relays().await;
        for url in urls.iter().filter(|u| !current.contains_key(*u)) {
            if let Err(e) = self.client.add_discovery_relay(url.clone()).await {
                tracing::warn!(%e, relay = %url, "add_discovery_relay failed");
            }
        }
        self.client.connect().await;
        self.client
            .wait_for_connection(Duration::from_secs(4))
            .await;
    }
}

fn has_roles(relay: &Relay, policy: RelayPolicy) -> bool {
    let flags = relay.flags();
    flags.has_read() == policy.read && flags.has_write() == policy.write
}

fn parse_urls(urls: &[String]) -> Vec<RelayUrl> {
    urls.iter()
        .filter_map(|u| match RelayUrl::parse(u) {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::warn!(%e, relay = %u, "skipping invalid relay url");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RelayPool for NostrRelayPool {
    async fn switch_relays(&self, relays: &RelayMap) -> Result<()> {
        let mut wanted: HashMap<RelayUrl, RelayPolicy> = HashMap::new();
        for (url, policy) in relays.iter().filter(|(_, p)| p.read || p.write) {
            match RelayUrl::parse(url) {
                Ok(parsed) => {
                    wanted.insert(parsed, policy);
                }
                Err(e) => tracing::warn!(%e, relay = %url, "skipping invalid relay url"),
            }
        }
        let current = self.client.pool().all_relays().await;

        for (url, relay) in &current {
            // A relay whose role changed is re-added so its subscriptions
            // match the new role.
            let keep = wanted
                .get(url)
                .is_some_and(|policy| has_roles(relay, *policy));
            if keep {
                relay.flags().remove(RelayServiceFlags::DISCOVERY);
                continue;
            }
            if let Err(e) = self.client.force_remove_relay(url.clone()).await {
                tracing::warn!(%e, relay = %url, "remove_relay failed");
            }
        }
        for (url, policy) in &wanted {
            let kept = current
                .get(url)
                .is_some_and(|relay| has_roles(relay, *policy));
            if !kept {
                self.add_with_policy(url, *policy).await;
            }
        }
        if !wanted.is_empty() {
            self.client.connect().await;
        }

        *self.active.lock() = relays.clone();
        tracing::info!(
            relays = ?relays.urls(),
            "switched relays"
        );
        Ok(())
    }

    async fn send(&self, event: &Event) -> Result<SendOutcome> {
        let write = parse_urls(&self.active.lock().write_urls());
        if write.is_empty() {
            return Err(Error::Relay("no write relays configured".to_string()));
        }
        self.ensure_connected(&write).await;
        let output = self
            .client
            .send_event_to(write, event)
            .await
            .map_err(|e| Error::Relay(e.to_string()))?;
        Ok(SendOutcome {
            success: output.success.iter().map(ToString::to_string).collect(),
            failed: output
                .failed
                .iter()
                .map(|(url, reason)| (url.to_string(), reason.clone()))
                .collect(),
        })
    }

    async fn subscribe(&self, filters: Vec<Filter>) -> Result<LiveSubscription> {
        // Grab the receiver first so nothing between subscribe and spawn is lost.
        let mut notifications = self.client.notifications();
        let mut ids: HashSet<SubscriptionId> = HashSet::new();
        for filter in filters {
            match self.client.subscribe(filter, None).await {
                Ok(out) => {
                    ids.insert(out.val);
                }
                Err(e) => {
                    for id in &ids {
                        self.client.unsubscribe(id).await;
                    }
                    return Err(Error::Relay(e.to_string()));
                }
            }
        }

        let (tx, rx) = flume::unbounded();
        let client = self.client.clone();
        let task_ids = ids.clone();
        let task = tokio::spawn(async move {
            let ids = task_ids;
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        subscription_id,
                        event,
                        ..
                    }) => {
                        if !ids.contains(&subscription_id) {
                            continue;
                        }
                        if tx.send((*event).clone()).is_err() {
                            // Subscriber went away.
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "subscription lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            for id in &ids {
                client.unsubscribe(id).await;
            }
        });

        let key = {
            let mut next = self.next_key.lock();
            *next += 1;
            *next
        };
        let mut forwarders = self.forwarders.lock();
        forwarders.retain(|_, f| !f.task.is_finished());
        forwarders.insert(
            key,
            Forwarder {
                task,
                ids: ids.into_iter().collect(),
            },
        );
        Ok(LiveSubscription { key, events: rx })
    }

    async fn unsubscribe(&self, key: u64) {
        let Some(forwarder) = self.forwarders.lock().remove(&key) else {
            return;
        };
        forwarder.task.abort();
        for id in &forwarder.ids {
            self.client.unsubscribe(id).await;
        }
        tracing::debug!(key, "closed live subscription");
    }

    async fn fetch_last_event_per_kind(
        &self,
        kinds: &[Kind],
        relays: &[String],
        author: PublicKey,
    ) -> Vec<(Kind, Option<Event>)> {
        let fetches = kinds.iter().map(|kind| async move {
            let filter = Filter::new().kind(*kind).author(author).limit(1);
            (*kind, self.fetch_last_event(relays, filter).await)
        });
        join_all(fetches).await
    }

    async fn fetch_last_event(&self, relays: &[String], filter: Filter) -> Option<Event> {
        let urls = parse_urls(relays);
        if urls.is_empty() {
            tracing::warn!("fetch skipped: no relays");
            return None;
        }
        // Extra relays added here are pruned by the next switch_relays.
        self.ensure_connected(&urls).await;
        match self
            .client
            .fetch_events_from(urls, filter, self.fetch_timeout)
            .await
        {
            Ok(events) => events.into_iter().max_by_key(|e| e.created_at),
            Err(e) => {
                tracing::warn!(%e, "fetch failed");
                None
            }
        }
    }

    async fn relay_states(&self) -> BTreeMap<String, String> {
        self.client
            .relays()
            .await
            .into_iter()
            .map(|(url, relay)| (url.to_string(), relay.status().to_string()))
            .collect()
    }

    async fn shutdown(&self) {
        for (_, forwarder) in self.forwarders.lock().drain() {
            forwarder.task.abort();
        }
        self.client.shutdown().await;
    }
}
