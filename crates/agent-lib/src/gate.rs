//! Notification cooldown gate
//!
//! Suppresses repeat notifications of the same kind for the same device
//! inside a cooldown window. This is the only suppression mechanism: it
//! limits by time since the last firing, never by volume. State is purely
//! in-memory; losing it on restart risks at most one duplicate
//! notification.

use crate::detector::AnomalyKind;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Default cooldown between notifications of the same kind (5 minutes)
const DEFAULT_COOLDOWN_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    device_id: String,
    kind: AnomalyKind,
}

/// Per-(device, kind) cooldown tracking, owned by the monitor loop
pub struct NotificationGate {
    cooldown: Duration,
    last_fired: HashMap<CooldownKey, Instant>,
}

impl NotificationGate {
    pub fn new() -> Self {
        Self {
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            last_fired: HashMap::new(),
        }
    }

    /// Set a custom cooldown window
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Whether a notification of this kind may fire for this device now.
    /// Returns true and stamps the entry when no prior firing lies inside
    /// the cooldown window; false leaves the existing stamp untouched.
    pub fn should_fire(&mut self, device_id: &str, kind: AnomalyKind) -> bool {
        let key = CooldownKey {
            device_id: device_id.to_string(),
            kind,
        };
        let now = Instant::now();

        if let Some(last) = self.last_fired.get(&key) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }

        self.last_fired.insert(key, now);
        self.prune(now);
        true
    }

    /// Number of live cooldown entries
    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        let cooldown = self.cooldown;
        self.last_fired
            .retain(|_, fired| now.duration_since(*fired) < cooldown);
    }
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new()
    }
}
