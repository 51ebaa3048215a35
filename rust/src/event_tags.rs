use nostr_sdk::prelude::Event;

/// Value of the first tag named `name`, or `""` when absent.
pub fn tag_value(ev: &Event, name: &str) -> String {
    ev.tags
        .iter()
        .map(|t| t.as_slice())
        .find(|values| values.first().map(String::as_str) == Some(name))
        .and_then(|values| values.get(1).cloned())
        .unwrap_or_default()
}

/// NIP-40 `expiration` tag as unix seconds. Non-numeric values are ignored.
pub fn expiration(ev: &Event) -> Option<u64> {
    let raw = tag_value(ev, "expiration");
    if raw.is_empty() {
        return None;
    }
    match raw.trim().parse::<u64>() {
        Ok(secs) => Some(secs),
        Err(_) => {
            tracing::warn!(value = %raw, id = %ev.id, "ignoring invalid expiration tag");
            None
        }
    }
}
