#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RelayProfileId {
    Bootstrap,
    PublicNostr,
}

/// A named set of relays used before the user's own relay list is known.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RelayProfile {
    pub id: RelayProfileId,
    pub name: &'static str,
    pub bootstrap_relays: &'static [&'static str],
}

impl RelayProfile {
    pub fn bootstrap_relays_vec(self) -> Vec<String> {
        self.bootstrap_relays
            .iter()
            .map(|v| (*v).to_string())
            .collect()
    }
}

pub const BOOTSTRAP: RelayProfile = RelayProfile {
    id: RelayProfileId::Bootstrap,
    name: "bootstrap",
    bootstrap_relays: &["wss://relay.nostr.band", "wss://relayable.org"],
};

pub const PUBLIC_NOSTR: RelayProfile = RelayProfile {
    id: RelayProfileId::PublicNostr,
    name: "public-nostr",
    bootstrap_relays: &[
        "wss://relay.primal.net",
        "wss://nos.lol",
        "wss://relay.damus.io",
    ],
};

pub fn default_profile() -> RelayProfile {
    BOOTSTRAP
}

pub fn profile_by_name(name: &str) -> Option<RelayProfile> {
    [BOOTSTRAP, PUBLIC_NOSTR]
        .into_iter()
        .find(|p| p.name == name.trim())
}

pub fn default_bootstrap_relays() -> Vec<String> {
    default_profile().bootstrap_relays_vec()
}

/// Keep only parseable websocket URLs from user-provided values.
pub fn valid_relay_urls(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in values {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(url) = url::Url::parse(trimmed) else {
            continue;
        };
        if !matches!(url.scheme(), "ws" | "wss") {
            continue;
        }
        let v = trimmed.to_string();
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Filter valid relay URLs from user-provided values, falling back to given defaults.
pub fn resolve_relay_urls(values: &[String], defaults: &[&str]) -> Vec<String> {
    let parsed = valid_relay_urls(values);
    if !parsed.is_empty() {
        return parsed;
    }
    let defaults: Vec<String> = defaults.iter().map(|u| (*u).to_string()).collect();
    valid_relay_urls(&defaults)
}
