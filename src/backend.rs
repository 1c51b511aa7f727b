//! Cache backends and the guarded client the rest of the crate talks to them through.

use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use tracing::warn;

use crate::error::BackendError;
use crate::traits::CacheBackend;
use crate::traits::CacheObserver;

#[derive(Clone, Debug)]
struct Stored {
    bytes: Arc<Vec<u8>>,
    ttl:   Duration,
}

// Each entry carries its own time to live; updates restart the clock.
struct PerEntryTtl;

impl Expiry<String, Stored> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Stored, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Stored,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process backend on top of a [moka](https://crates.io/crates/moka) cache.
pub struct MokaBackend {
    name:  String,
    cache: Cache<String, Stored>,
}

impl MokaBackend {
    pub fn new(name: impl Into<String>, max_capacity: u64) -> Self {
        let name = name.into();
        let cache = Cache::builder()
            .name(&name)
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::tiny_lfu())
            .expire_after(PerEntryTtl)
            .build();
        Self { name, cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Debug for MokaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaBackend")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.cache.get(key).await.map(|stored| stored.bytes.as_ref().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError> {
        self.cache
            .insert(
                key.to_string(),
                Stored {
                    bytes: Arc::new(value),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool, BackendError> {
        // contains_key() doesn't account for expired entries which are not evicted yet.
        Ok(self.cache.get(key).await.is_some())
    }
}

/// Backends by name. The configuration picks one of them.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn CacheBackend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with a single in-process backend registered under `name`.
    pub fn with_moka(name: impl Into<String>, max_capacity: u64) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(MokaBackend::new(name, max_capacity)));
        registry
    }

    /// Registers a backend under its own name, replacing any previous one.
    pub fn register(&self, backend: Arc<dyn CacheBackend>) {
        self.backends.write().insert(backend.name().to_string(), backend);
    }

    pub fn select(&self, name: &str) -> Result<Arc<dyn CacheBackend>, BackendError> {
        self.backends
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }
}

/// Observers shared by all parts of one cache.
#[derive(Clone, Default)]
pub struct Observers {
    list: Arc<RwLock<Vec<Arc<dyn CacheObserver>>>>,
}

impl Observers {
    pub fn add(&self, observer: Arc<dyn CacheObserver>) {
        self.list.write().push(observer);
    }

    // Never hold the lock while observers run.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn CacheObserver>> {
        self.list.read().clone()
    }
}

impl Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Observers({})", self.list.read().len())
    }
}

/// Typed, time-bounded access to a [`CacheBackend`].
///
/// The plain methods report [`BackendError`]s; the `read`/`write`/`purge`/`flag` family absorbs them: the failure is
/// logged, observers are told, and the call degrades to a miss.
#[derive(Clone, Debug)]
pub struct BackendClient {
    backend:   Arc<dyn CacheBackend>,
    timeout:   Duration,
    observers: Observers,
}

impl BackendClient {
    pub fn new(backend: Arc<dyn CacheBackend>, timeout: Duration, observers: Observers) -> Self {
        Self {
            backend,
            timeout,
            observers,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T, BackendError>>) -> Result<T, BackendError> {
        tokio::time::timeout(self.timeout, op)
            .await
            .unwrap_or(Err(BackendError::Timeout(self.timeout)))
    }

    pub async fn fetch<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BackendError> {
        let Some(bytes) = self.bounded(self.backend.get(key)).await?
        else {
            return Ok(None);
        };
        postcard::from_bytes(&bytes).map(Some).map_err(|err| BackendError::Codec {
            key:    key.to_string(),
            reason: err.to_string(),
        })
    }

    pub async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), BackendError> {
        let bytes = postcard::to_stdvec(value).map_err(|err| BackendError::Codec {
            key:    key.to_string(),
            reason: err.to_string(),
        })?;
        self.bounded(self.backend.set(key, bytes, ttl)).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.bounded(self.backend.delete(key)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.bounded(self.backend.contains(key)).await
    }

    pub(crate) async fn absorb<T>(&self, op: &str, key: &str, outcome: Result<T, BackendError>) -> Option<T> {
        match outcome {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(backend = self.backend.name(), op, key, "cache backend failure absorbed: {err}");
                for observer in self.observers.snapshot() {
                    observer.on_backend_error(&err).await;
                }
                None
            }
        }
    }

    /// A miss when the key is absent, undecodable, or the backend fails.
    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let outcome = self.fetch(key).await;
        self.absorb("get", key, outcome).await.flatten()
    }

    pub async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> bool {
        let outcome = self.store(key, value, ttl).await;
        self.absorb("set", key, outcome).await.is_some()
    }

    pub async fn purge(&self, key: &str) -> bool {
        let outcome = self.remove(key).await;
        self.absorb("delete", key, outcome).await.is_some()
    }

    /// Presence probe; an unreachable backend reports absence.
    pub async fn flag(&self, key: &str) -> bool {
        let outcome = self.exists(key).await;
        self.absorb("contains", key, outcome).await.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TrackedKey {
    key:        String,
    ttl:        Duration,
    // Unix time, in milliseconds, the tracked entry expires at.
    expires_at: u64,
}

/// A set of cache keys stored as a single backend value. Used for the per-record fanout of lookups and the per-type
/// list of negative lookups.
///
/// Every key remembers when the entry it names expires. Expired keys are dropped whenever the set is added to, so a
/// set never grows past the number of live entries it tracks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeySet {
    entries: Vec<TrackedKey>,
}

impl KeySet {
    /// Adds a key, or extends the deadline of a known one. Returns `true` for a new key.
    pub fn add(&mut self, key: String, ttl: Duration) -> bool {
        self.add_at(key, ttl, unix_millis())
    }

    fn add_at(&mut self, key: String, ttl: Duration, now: u64) -> bool {
        self.entries.retain(|entry| entry.expires_at > now);
        let expires_at = now.saturating_add(as_millis(ttl));

        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.key == key) {
            if expires_at > entry.expires_at {
                entry.expires_at = expires_at;
                entry.ttl = ttl;
            }
            return false;
        }

        self.entries.push(TrackedKey { key, ttl, expires_at });
        true
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lifetime to store the set with. Never shorter than what is left of any tracked entry.
    pub fn ttl(&self) -> Duration {
        self.entries.iter().map(|entry| entry.ttl).max().unwrap_or_default()
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, as_millis)
}
