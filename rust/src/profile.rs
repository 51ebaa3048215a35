use nostr_sdk::prelude::{Event, JsonUtil, Metadata};

/// Parse kind 0 content. Malformed JSON degrades to the empty profile.
pub fn parse_profile(ev: &Event) -> Metadata {
    if ev.content.trim().is_empty() {
        return Metadata::default();
    }
    match Metadata::from_json(&ev.content) {
        Ok(metadata) => metadata,
        Err(e) => {
            tracing::error!(%e, id = %ev.id, "failed to parse kind 0 profile");
            Metadata::default()
        }
    }
}
