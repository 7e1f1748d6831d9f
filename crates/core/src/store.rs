//! Atomic key-value store port shared by admission control and the tool cache.
//!
//! Implementations must make `set_if_absent` and `incr` atomic; callers never
//! lock around them. Expired keys behave exactly like missing keys.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("value stored at `{key}` is not an integer")]
    NotAnInteger { key: String },
}

#[async_trait]
pub trait AtomicStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// SET NX EX. Returns `true` when the key was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    /// INCR. Missing keys start from zero and keep no expiry.
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining lifetime; `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| deadline > now)
    }
}

/// Process-local store. Uses tokio's clock so paused-time tests can expire keys.
#[derive(Debug, Default)]
pub struct InMemoryAtomicStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryAtomicStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().await.values().filter(|entry| entry.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl AtomicStore for InMemoryAtomicStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        Ok(live_entry(&mut entries, key, Instant::now()).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            Entry { value: value.to_owned(), expires_at: ttl.map(|ttl| now + ttl) },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries
            .insert(key.to_owned(), Entry { value: value.to_owned(), expires_at: Some(now + ttl) });
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                let current = entry
                    .value
                    .parse::<i64>()
                    .map_err(|_| StoreError::NotAnInteger { key: key.to_owned() })?;
                let next = current.saturating_add(1);
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(key.to_owned(), Entry { value: "1".to_owned(), expires_at: None });
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let existed = live_entry(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(live_entry(&mut entries, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now)))
    }
}
