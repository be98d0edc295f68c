//! # Cache
//!
//! A thread-safe keyed store with optional TTL expiration callbacks.
//! Holds the orchestrator's PU contexts and the process manager's active
//! children.
//!
//! ## Guarantees
//!
//! - All operations observe a consistent view (one lock per cache).
//! - `get` after `remove` fails deterministically with `NotFound`.
//! - Expired entries are collected lazily during any operation; the
//!   registered expiration callback runs after the lock is released, so
//!   callbacks may re-enter the cache freely.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Errors from cache operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not present.
    #[error("Key not found in cache")]
    NotFound,

    /// `add` was called for a key that already exists.
    #[error("Key already exists in cache")]
    DuplicateKey,
}

/// Callback invoked when an entry expires. Receives the expired key and
/// value. Runs outside the cache lock.
pub type ExpirationCallback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

/// Keyed store with optional per-entry TTL.
pub struct Cache<K, V> {
    inner: Mutex<HashMap<K, Entry<V>>>,
    default_ttl: Option<Duration>,
    on_expire: Option<ExpirationCallback<K, V>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A cache whose entries never expire.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            default_ttl: None,
            on_expire: None,
        }
    }

    /// A cache whose entries expire `ttl` after insertion. The callback,
    /// if given, fires once per expired entry.
    #[must_use]
    pub fn with_ttl(ttl: Duration, on_expire: Option<ExpirationCallback<K, V>>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            default_ttl: Some(ttl),
            on_expire,
        }
    }

    /// Insert a new entry. Fails with `DuplicateKey` if the key is live.
    pub fn add(&self, key: K, value: V) -> Result<(), CacheError> {
        let expired = {
            let mut map = self.inner.lock();
            let expired = Self::collect_expired(&mut map);
            if map.contains_key(&key) {
                drop(map);
                self.fire_expirations(expired);
                return Err(CacheError::DuplicateKey);
            }
            map.insert(key, self.entry(value));
            expired
        };
        self.fire_expirations(expired);
        Ok(())
    }

    /// Insert or replace an entry.
    pub fn add_or_update(&self, key: K, value: V) {
        let expired = {
            let mut map = self.inner.lock();
            let expired = Self::collect_expired(&mut map);
            map.insert(key, self.entry(value));
            expired
        };
        self.fire_expirations(expired);
    }

    /// Replace an existing entry. Fails with `NotFound` if absent.
    pub fn update(&self, key: K, value: V) -> Result<(), CacheError> {
        let expired = {
            let mut map = self.inner.lock();
            let expired = Self::collect_expired(&mut map);
            if !map.contains_key(&key) {
                drop(map);
                self.fire_expirations(expired);
                return Err(CacheError::NotFound);
            }
            map.insert(key, self.entry(value));
            expired
        };
        self.fire_expirations(expired);
        Ok(())
    }

    /// Fetch a copy of the value for `key`.
    pub fn get(&self, key: &K) -> Result<V, CacheError> {
        let (result, expired) = {
            let mut map = self.inner.lock();
            let expired = Self::collect_expired(&mut map);
            let result = map
                .get(key)
                .map(|e| e.value.clone())
                .ok_or(CacheError::NotFound);
            (result, expired)
        };
        self.fire_expirations(expired);
        result
    }

    /// Remove an entry, returning its value.
    pub fn remove(&self, key: &K) -> Result<V, CacheError> {
        let (result, expired) = {
            let mut map = self.inner.lock();
            let expired = Self::collect_expired(&mut map);
            let result = map.remove(key).map(|e| e.value).ok_or(CacheError::NotFound);
            (result, expired)
        };
        self.fire_expirations(expired);
        result
    }

    /// Number of live entries.
    #[must_use]
    pub fn size(&self) -> usize {
        let expired = {
            let mut map = self.inner.lock();
            Self::collect_expired(&mut map)
        };
        self.fire_expirations(expired);
        self.inner.lock().len()
    }

    /// Copies of all live keys.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        let (keys, expired) = {
            let mut map = self.inner.lock();
            let expired = Self::collect_expired(&mut map);
            (map.keys().cloned().collect(), expired)
        };
        self.fire_expirations(expired);
        keys
    }

    fn entry(&self, value: V) -> Entry<V> {
        Entry {
            value,
            expires_at: self.default_ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn collect_expired(map: &mut HashMap<K, Entry<V>>) -> Vec<(K, V)> {
        let now = Instant::now();
        let dead: Vec<K> = map
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        dead.into_iter()
            .filter_map(|k| map.remove(&k).map(|e| (k, e.value)))
            .collect()
    }

    fn fire_expirations(&self, expired: Vec<(K, V)>) {
        if let Some(cb) = &self.on_expire {
            for (k, v) in &expired {
                cb(k, v);
            }
        }
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
