use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{UnixTimeMs, DEFAULT_CACHE_CAPACITY};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache serialization failed for {key}: {message}")]
    Serialization { key: String, message: String },
}

/// Hierarchical cache key, e.g. `["contacts", "list", "search=ada"]`.
/// Prefix matching covers every parameter variant of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    pub fetched_at: UnixTimeMs,
    pub stale: bool,
}

/// Entries captured before an optimistic write, restored verbatim on
/// failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    entries: Vec<(QueryKey, CacheEntry)>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.iter().map(|(k, _)| k)
    }
}

/// Handed out by [`QueryCache::begin_fetch`]; the result is only written
/// if no cancellation or newer fetch happened in between.
#[derive(Debug)]
#[must_use]
pub struct FetchTicket {
    key: QueryKey,
    id: u64,
}

struct CacheInner {
    entries: LruCache<QueryKey, CacheEntry>,
    in_flight: HashMap<QueryKey, u64>,
    next_ticket: u64,
}

/// Process-wide server-state cache shared by every query and mutation.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                in_flight: HashMap::new(),
                next_ticket: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matching(inner: &CacheInner, prefix: &QueryKey) -> Vec<QueryKey> {
        inner
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn keys(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        let mut keys = Self::matching(&self.lock(), prefix);
        keys.sort();
        keys
    }

    pub fn entry(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    pub fn get_raw(&self, key: &QueryKey) -> Option<Value> {
        self.entry(key).map(|e| e.data)
    }

    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let data = self.get_raw(key)?;
        match serde_json::from_value(data) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(%key, error = %e, "cached data has a different shape");
                None
            }
        }
    }

    pub fn set_raw(&self, key: QueryKey, data: Value) {
        self.lock().entries.put(
            key,
            CacheEntry {
                data,
                fetched_at: UnixTimeMs::now(),
                stale: false,
            },
        );
    }

    pub fn set_query_data<T: Serialize + ?Sized>(
        &self,
        key: QueryKey,
        data: &T,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(data).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.set_raw(key, value);
        Ok(())
    }

    /// Rewrites every entry under `prefix` that deserializes as `T`. Returns
    /// how many entries changed.
    pub fn update_query_data<T, F>(&self, prefix: &QueryKey, mut f: F) -> usize
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&QueryKey, T) -> T,
    {
        let mut inner = self.lock();
        let mut updated = 0;
        for key in Self::matching(&inner, prefix) {
            let Some(entry) = inner.entries.peek_mut(&key) else {
                continue;
            };
            let Ok(current) = serde_json::from_value::<T>(entry.data.clone()) else {
                continue;
            };
            if let Ok(next) = serde_json::to_value(f(&key, current)) {
                entry.data = next;
                updated += 1;
            }
        }
        updated
    }

    /// Stops in-flight fetches under `prefix` from writing their results.
    pub fn cancel_queries(&self, prefix: &QueryKey) {
        let mut inner = self.lock();
        let before = inner.in_flight.len();
        inner.in_flight.retain(|k, _| !k.starts_with(prefix));
        let cancelled = before - inner.in_flight.len();
        if cancelled > 0 {
            debug!(%prefix, cancelled, "cancelled in-flight queries");
        }
    }

    pub fn snapshot(&self, prefix: &QueryKey) -> Snapshot {
        let inner = self.lock();
        let entries = inner
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Snapshot { entries }
    }

    pub fn restore(&self, snapshot: Snapshot) {
        let mut inner = self.lock();
        for (key, entry) in snapshot.entries {
            inner.entries.put(key, entry);
        }
    }

    /// Marks entries stale so the next read refetches them.
    pub fn invalidate(&self, prefix: &QueryKey) {
        let mut inner = self.lock();
        for key in Self::matching(&inner, prefix) {
            if let Some(entry) = inner.entries.peek_mut(&key) {
                entry.stale = true;
            }
        }
        debug!(%prefix, "invalidated");
    }

    pub fn remove(&self, prefix: &QueryKey) {
        let mut inner = self.lock();
        for key in Self::matching(&inner, prefix) {
            inner.entries.pop(&key);
        }
        inner.in_flight.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.in_flight.clear();
        debug!("query cache cleared");
    }

    pub fn begin_fetch(&self, key: &QueryKey) -> FetchTicket {
        let mut inner = self.lock();
        inner.next_ticket += 1;
        let id = inner.next_ticket;
        inner.in_flight.insert(key.clone(), id);
        FetchTicket {
            key: key.clone(),
            id,
        }
    }

    /// Writes a fetch result unless the fetch was cancelled or superseded.
    /// Returns whether it was written.
    pub fn complete_fetch(&self, ticket: FetchTicket, data: Value) -> bool {
        let mut inner = self.lock();
        if inner.in_flight.get(&ticket.key) != Some(&ticket.id) {
            debug!(key = %ticket.key, "discarding result of cancelled fetch");
            return false;
        }
        inner.in_flight.remove(&ticket.key);
        inner.entries.put(
            ticket.key,
            CacheEntry {
                data,
                fetched_at: UnixTimeMs::now(),
                stale: false,
            },
        );
        true
    }

    /// Fails an in-flight fetch without touching cached data.
    pub fn abandon_fetch(&self, ticket: FetchTicket) {
        let mut inner = self.lock();
        if inner.in_flight.get(&ticket.key) == Some(&ticket.id) {
            inner.in_flight.remove(&ticket.key);
        }
    }

    /// Cached data when fresh, otherwise runs `fetch` and caches the result.
    pub async fn fetch_query<T, E, F, Fut>(&self, key: &QueryKey, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(entry) = self.entry(key).filter(|e| !e.stale) {
            if let Ok(data) = serde_json::from_value(entry.data) {
                return Ok(data);
            }
        }

        let ticket = self.begin_fetch(key);
        match fetch().await {
            Ok(data) => {
                match serde_json::to_value(&data) {
                    Ok(value) => {
                        self.complete_fetch(ticket, value);
                    }
                    Err(_) => self.abandon_fetch(ticket),
                }
                Ok(data)
            }
            Err(e) => {
                self.abandon_fetch(ticket);
                Err(e)
            }
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("QueryCache")
            .field("entries", &inner.entries.len())
            .field("in_flight", &inner.in_flight.len())
            .finish()
    }
}
