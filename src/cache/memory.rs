//! In-process [`KeyValueStore`] backend.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use super::{KeyValueStore, StoreError};

#[derive(Debug)]
struct Slot {
    value: String,
    // `None` when the TTL reaches past what the clock can represent.
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_owned(),
            expires_at: Instant::now().checked_add(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// A [`KeyValueStore`] held in process memory.
///
/// Expired entries are dropped lazily when touched, or in bulk by
/// [`purge_expired`](Self::purge_expired). Coordination only spans the tasks of
/// one process; point every instance at a shared backend for multi-instance
/// deployments.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttp_idempotency::cache::{KeyValueStore, MemoryStore};
///
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let ttl = Duration::from_secs(60);
/// assert!(store.set_if_absent("idemlock:v1:k", "1", ttl).await.unwrap());
/// assert!(!store.set_if_absent("idemlock:v1:k", "1", ttl).await.unwrap());
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        // The read guard must be dropped before `remove_if` touches the same shard.
        let live = match self.entries.get(key) {
            None => return Ok(None),
            Some(slot) => slot.is_live(now).then(|| slot.value.clone()),
        };
        if live.is_none() {
            self.entries.remove_if(key, |_, slot| !slot.is_live(now));
        }
        Ok(live)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(key.to_owned(), Slot::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(Slot::new(value, ttl));
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, slot)| slot.is_live(now)))
    }
}
