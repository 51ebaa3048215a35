//! Relay list derivation from kind 3 and kind 10002 events.

use std::collections::BTreeMap;

use nostr_sdk::prelude::{Event, Kind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPolicy {
    pub read: bool,
    pub write: bool,
}

impl RelayPolicy {
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
    };
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
    };
    pub const WRITE_ONLY: Self = Self {
        read: false,
        write: true,
    };
}

/// `url -> {read, write}`, iterated in url order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayMap(BTreeMap<String, RelayPolicy>);

impl RelayMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every url marked read-only.
    pub fn read_only<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .map(|u| (u.into(), RelayPolicy::READ_ONLY))
            .collect()
    }

    pub fn insert(&mut self, url: impl Into<String>, policy: RelayPolicy) {
        self.0.insert(url.into(), policy);
    }

    pub fn get(&self, url: &str) -> Option<RelayPolicy> {
        self.0.get(url).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, RelayPolicy)> {
        self.0.iter().map(|(url, policy)| (url.as_str(), *policy))
    }

    pub fn urls(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn read_urls(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, p)| p.read)
            .map(|(url, _)| url.to_string())
            .collect()
    }

    pub fn write_urls(&self) -> Vec<String> {
        self.iter()
            .filter(|(_, p)| p.write)
            .map(|(url, _)| url.to_string())
            .collect()
    }
}

impl FromIterator<(String, RelayPolicy)> for RelayMap {
    fn from_iter<T: IntoIterator<Item = (String, RelayPolicy)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

pub fn is_relay_list_kind(kind: Kind) -> bool {
    kind == Kind::ContactList || kind == Kind::RelayList
}

/// The newest relay-list event among `events`.
///
/// Non relay-list kinds are skipped. On equal `created_at` the kind 10002
/// event wins over kind 3; equal kind and timestamp keeps the first seen.
pub fn select_relay_list_event<'a, I>(events: I) -> Option<&'a Event>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut latest: Option<&Event> = None;
    for ev in events.into_iter().filter(|ev| is_relay_list_kind(ev.kind)) {
        let newer = match latest {
            None => true,
            Some(cur) => (ev.created_at, ev.kind.as_u16()) > (cur.created_at, cur.kind.as_u16()),
        };
        if newer {
            latest = Some(ev);
        }
    }
    latest
}

/// Derive the relay map from the newest relay-list event among `events`.
/// Never fails: anything unparseable degrades to an empty map.
pub fn resolve_relay_list<'a, I>(events: I) -> RelayMap
where
    I: IntoIterator<Item = &'a Event>,
{
    select_relay_list_event(events)
        .map(parse_relay_list_event)
        .unwrap_or_default()
}

/// Parse a single relay-list event according to its kind.
pub fn parse_relay_list_event(ev: &Event) -> RelayMap {
    match ev.kind {
        Kind::ContactList => parse_contact_list_relays(ev),
        Kind::RelayList => parse_relay_list_tags(ev),
        other => {
            tracing::error!(kind = other.as_u16(), "not a relay list event");
            RelayMap::new()
        }
    }
}

/// Kind 3 keeps the relay map as JSON in its content.
pub fn parse_contact_list_relays(ev: &Event) -> RelayMap {
    if ev.content.trim().is_empty() {
        return RelayMap::new();
    }
    match serde_json::from_str::<RelayMap>(&ev.content) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!(%e, id = %ev.id, "failed to parse kind 3 relay map");
            RelayMap::new()
        }
    }
}

/// Kind 10002 lists relays as `["r", url, marker?]` tags.
pub fn parse_relay_list_tags(ev: &Event) -> RelayMap {
    let mut map = RelayMap::new();
    for tag in ev.tags.iter() {
        let values = tag.as_slice();
        if values.len() < 2 || values[0] != "r" {
            continue;
        }
        let url = values[1].as_str();
        let policy = match values.get(2).map(String::as_str) {
            None => RelayPolicy::READ_WRITE,
            Some("read") => RelayPolicy::READ_ONLY,
            Some("write") => RelayPolicy::WRITE_ONLY,
            Some(marker) => {
                tracing::warn!(marker, url, "invalid relay marker in kind 10002 event");
                continue;
            }
        };
        map.insert(url, policy);
    }
    map
}

/// Force `write` on for each extra relay, keeping any existing `read` flag.
pub fn apply_write_overlay(map: &RelayMap, extra_write_relays: &[String]) -> RelayMap {
    let mut out = map.clone();
    for url in extra_write_relays {
        let read = out.get(url).map(|p| p.read).unwrap_or(false);
        out.insert(url.clone(), RelayPolicy { read, write: true });
    }
    out
}
