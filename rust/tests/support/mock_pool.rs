use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use quill_core::{LiveSubscription, RelayMap, RelayPool, Result, SendOutcome};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub relays: Vec<String>,
    pub kinds: Vec<u16>,
}

#[derive(Default)]
struct PoolState {
    stored: Vec<Event>,
    active: RelayMap,
    switches: Vec<RelayMap>,
    sent: Vec<Event>,
    fetches: Vec<FetchCall>,
    subscribers: Vec<(u64, flume::Sender<Event>)>,
    subscriptions: usize,
    shut_down: bool,
}

/// In-memory relay pool. Events passed to [`ScriptedRelayPool::store`] are
/// what fetches return; [`ScriptedRelayPool::push_live`] delivers to every
/// open subscription.
pub struct ScriptedRelayPool {
    state: Mutex<PoolState>,
    // `true` while fetches may complete.
    fetch_gate: watch::Sender<bool>,
}

impl ScriptedRelayPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState::default()),
            fetch_gate: watch::channel(true).0,
        })
    }

    /// Fetches are still recorded but do not return until
    /// [`ScriptedRelayPool::resume_fetches`].
    pub fn pause_fetches(&self) {
        self.fetch_gate.send_replace(false);
    }

    pub fn resume_fetches(&self) {
        self.fetch_gate.send_replace(true);
    }

    async fn wait_for_fetch_gate(&self) {
        let mut open = self.fetch_gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
    }

    pub fn store(&self, ev: Event) {
        self.state.lock().unwrap().stored.push(ev);
    }

    pub fn push_live(&self, ev: Event) {
        let mut st = self.state.lock().unwrap();
        st.subscribers.retain(|(_, tx)| tx.send(ev.clone()).is_ok());
    }

    pub fn sent(&self) -> Vec<Event> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn switches(&self) -> Vec<RelayMap> {
        self.state.lock().unwrap().switches.clone()
    }

    pub fn active(&self) -> RelayMap {
        self.state.lock().unwrap().active.clone()
    }

    pub fn fetches(&self) -> Vec<FetchCall> {
        self.state.lock().unwrap().fetches.clone()
    }

    /// Subscriptions opened so far, closed ones included.
    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    /// Subscriptions not yet closed by `unsubscribe`.
    pub fn open_subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }

    fn newest_matching(&self, filter: &Filter) -> Option<Event> {
        let st = self.state.lock().unwrap();
        st.stored
            .iter()
            .filter(|ev| {
                filter.kinds.as_ref().map_or(true, |k| k.contains(&ev.kind))
                    && filter
                        .authors
                        .as_ref()
                        .map_or(true, |a| a.contains(&ev.pubkey))
            })
            .max_by_key(|ev| ev.created_at)
            .cloned()
    }
}

#[async_trait]
impl RelayPool for ScriptedRelayPool {
    async fn switch_relays(&self, relays: &RelayMap) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            st.active = relays.clone();
            st.switches.push(relays.clone());
        }
        // Give concurrent callers a chance to interleave like a real network.
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn send(&self, event: &Event) -> Result<SendOutcome> {
        let mut st = self.state.lock().unwrap();
        st.sent.push(event.clone());
        Ok(SendOutcome {
            success: st.active.write_urls(),
            failed: BTreeMap::new(),
        })
    }

    async fn subscribe(&self, _filters: Vec<Filter>) -> Result<LiveSubscription> {
        let (tx, rx) = flume::unbounded();
        let mut st = self.state.lock().unwrap();
        st.subscriptions += 1;
        let key = st.subscriptions as u64;
        st.subscribers.push((key, tx));
        Ok(LiveSubscription { key, events: rx })
    }

    async fn unsubscribe(&self, key: u64) {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .retain(|(k, _)| *k != key);
    }

    async fn fetch_last_event_per_kind(
        &self,
        kinds: &[Kind],
        relays: &[String],
        author: PublicKey,
    ) -> Vec<(Kind, Option<Event>)> {
        self.state.lock().unwrap().fetches.push(FetchCall {
            relays: relays.to_vec(),
            kinds: kinds.iter().map(|k| k.as_u16()).collect(),
        });
        tokio::task::yield_now().await;
        self.wait_for_fetch_gate().await;
        kinds
            .iter()
            .map(|kind| {
                let filter = Filter::new().kind(*kind).author(author);
                (*kind, self.newest_matching(&filter))
            })
            .collect()
    }

    async fn fetch_last_event(&self, relays: &[String], filter: Filter) -> Option<Event> {
        let kinds = filter
            .kinds
            .as_ref()
            .map(|k| k.iter().map(|k| k.as_u16()).collect())
            .unwrap_or_default();
        self.state.lock().unwrap().fetches.push(FetchCall {
            relays: relays.to_vec(),
            kinds,
        });
        tokio::task::yield_now().await;
        self.wait_for_fetch_gate().await;
        self.newest_matching(&filter)
    }

    async fn relay_states(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .active
            .urls()
            .into_iter()
            .map(|url| (url, "Connected".to_string()))
            .collect()
    }

    async fn shutdown(&self) {
        let mut st = self.state.lock().unwrap();
        st.subscribers.clear();
        st.shut_down = true;
    }
}
