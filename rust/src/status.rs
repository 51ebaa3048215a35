//! Ephemeral user status (NIP-38) with self-clearing expiry.
//!
//! At most one expiry timer is outstanding per [`UserStatus`]. A timer only
//! clears the status it was armed for: every update bumps a generation
//! counter and a timer that wakes up for an older generation does nothing.
//! Reads also check the expiration, so a status whose timer never ran (no
//! runtime, process suspended) still presents as cleared.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatusValue {
    pub status: String,
    pub link_url: String,
    /// Unix seconds.
    pub expiration: Option<u64>,
}

impl UserStatusValue {
    pub fn is_empty(&self) -> bool {
        self.status.is_empty()
    }

    fn is_expired_at(&self, now: u64) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}

#[derive(Default)]
struct Slot {
    value: UserStatusValue,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn reset(&mut self) {
        self.value = UserStatusValue::default();
        self.generation = self.generation.wrapping_add(1);
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Clone, Default)]
pub struct UserStatus {
    slot: Arc<Mutex<Slot>>,
}

impl UserStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> UserStatusValue {
        let mut slot = self.slot.lock();
        if slot.value.is_expired_at(now_secs()) {
            tracing::debug!(status = %slot.value.status, "user status expired (lazy)");
            slot.reset();
        }
        slot.value.clone()
    }

    pub fn update(&self, status: String, link_url: String, expiration: Option<u64>) {
        let mut slot = self.slot.lock();
        slot.reset();
        slot.value = UserStatusValue {
            status,
            link_url,
            expiration,
        };

        let Some(exp) = expiration else {
            return;
        };
        let now = now_secs();
        if exp <= now {
            // already expired
            slot.value = UserStatusValue::default();
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime to arm a timer on; `value()` still enforces expiry.
            return;
        };
        let generation = slot.generation;
        let weak = Arc::downgrade(&self.slot);
        let wait = Duration::from_secs(exp - now);
        slot.timer = Some(handle.spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(slot) = weak.upgrade() else {
                return;
            };
            let mut slot = slot.lock();
            if slot.generation != generation {
                return;
            }
            tracing::info!(status = %slot.value.status, "user status expired");
            slot.value = UserStatusValue::default();
            slot.generation = slot.generation.wrapping_add(1);
            // This task is the timer; drop the handle without aborting ourselves.
            slot.timer = None;
        }));
    }

    pub fn clear(&self) {
        self.slot.lock().reset();
    }

    #[cfg(test)]
    fn has_timer(&self) -> bool {
        self.slot.lock().timer.is_some()
    }
}

pub(crate) fn now_secs() -> u64 {
    nostr_sdk::Timestamp::now().as_secs()
}
