//! Local TTL cache for registry entries

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

/// String-keyed map whose entries vanish after their TTL
pub struct TtlCache<V> {
    slots: RwLock<HashMap<String, Slot<V>>>,
    default_ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn insert(&self, key: &str, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.slots.write().insert(
            key.to_string(),
            Slot {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Live value for `key`
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        self.slots
            .read()
            .get(key)
            .filter(|slot| slot.expires_at > now)
            .map(|slot| slot.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Restart the TTL of a live entry, returning its value
    pub fn touch(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut slots = self.slots.write();
        match slots.get_mut(key) {
            Some(slot) if slot.expires_at > now => {
                slot.expires_at = now + self.default_ttl;
                Some(slot.value.clone())
            }
            _ => None,
        }
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.slots.write().remove(key).map(|slot| slot.value)
    }

    /// Snapshot of all live entries
    pub fn entries(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        self.slots
            .read()
            .iter()
            .filter(|(_, slot)| slot.expires_at > now)
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .read()
            .values()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, returning their keys
    pub fn purge_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.slots.write().retain(|key, slot| {
            let live = slot.expires_at > now;
            if !live {
                expired.push(key.clone());
            }
            live
        });
        expired
    }
}
