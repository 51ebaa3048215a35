//! Private key input handling and the advisory key-rotation lock.

use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::{FromBech32, SecretKey};

use crate::cache::now_millis;
use crate::error::Result;
use crate::kv::KvStore;

pub const PRIVATE_KEY_SECRET: &str = "nostr-priv-key";
pub const KEY_ROTATION_LOCK_KEY: &str = "keyRotationLock";

/// Accept a bech32 `nsec1...` key or 64 lowercase hex chars and return the
/// hex form. Anything else is `None`.
pub fn normalize_private_key(input: &str) -> Option<String> {
    let input = input.trim();
    if input.starts_with("nsec1") {
        return match SecretKey::from_bech32(input) {
            Ok(sk) => Some(sk.to_secret_hex()),
            Err(e) => {
                tracing::warn!(%e, "failed to decode nsec");
                None
            }
        };
    }
    let is_hex = input.len() == 64
        && input
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !is_hex {
        return None;
    }
    // Reject values outside the curve order.
    SecretKey::from_hex(input).ok().map(|_| input.to_string())
}

/// Advisory lock shared through the KV store.
///
/// Check-then-set is not atomic across processes; this only narrows the
/// window for two instances rotating the key at once. The flag holds the
/// acquisition time so a holder that crashed is taken over after `lease`.
pub struct KeyRotationLock {
    kv: Arc<dyn KvStore>,
    lease: Duration,
}

impl KeyRotationLock {
    pub fn new(kv: Arc<dyn KvStore>, lease: Duration) -> Self {
        Self { kv, lease }
    }

    /// `Ok(None)` when another holder's lease is still live.
    pub fn try_acquire(&self) -> Result<Option<KeyRotationGuard>> {
        let now = now_millis();
        if let Some(raw) = self.kv.get(KEY_ROTATION_LOCK_KEY)? {
            // Legacy boolean flags carry no timestamp and count as fresh.
            let acquired_at = raw.trim().parse::<u64>().unwrap_or(now);
            let age = now.saturating_sub(acquired_at);
            if age <= self.lease.as_millis() as u64 {
                return Ok(None);
            }
            tracing::warn!(age_ms = age, "taking over expired key rotation lock");
        }
        self.kv
            .set(KEY_ROTATION_LOCK_KEY, Some(&now.to_string()))?;
        Ok(Some(KeyRotationGuard {
            kv: self.kv.clone(),
        }))
    }

    #[cfg(test)]
    fn is_held(&self) -> bool {
        matches!(self.kv.get(KEY_ROTATION_LOCK_KEY), Ok(Some(_)))
    }
}

/// Releases the lock on drop, whatever happened while it was held.
pub struct KeyRotationGuard {
    kv: Arc<dyn KvStore>,
}

impl Drop for KeyRotationGuard {
    fn drop(&mut self) {
        if let Err(e) = self.kv.set(KEY_ROTATION_LOCK_KEY, None) {
            tracing::error!(%e, "failed to release key rotation lock");
        }
    }
}
