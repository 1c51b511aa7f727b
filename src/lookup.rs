//! Secondary lookups: fingerprint to primary key, plus the bookkeeping needed to purge them.
//!
//! Every positive lookup entry is tracked in the fanout set of the record it resolves to. Every negative one is
//! tracked in the negative set of its type. Tracking is written before the entry itself: an entry that cannot be
//! tracked is not cached at all, so an invalidation can always find what it has to purge.
//!
//! A set is read, extended and written back. Updates of one set are serialized within a process. Processes sharing a
//! backend can still race on the same set and lose a key; such an entry outlives an invalidation by its TTL at most.

use std::hash::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use tracing::debug;
use tracing::instrument;

use crate::backend::BackendClient;
use crate::backend::KeySet;
use crate::codec::encode_typed;
use crate::codec::fingerprint;
use crate::codec::Identifier;
use crate::codec::KeySpace;
use crate::codec::TypeName;
use crate::error::Result;
use crate::types::Criteria;
use crate::types::LookupEntry;
use crate::types::PrimaryKey;
use crate::types::Resolution;

const TRACK_LOCKS: usize = 32;

#[derive(Clone, Debug)]
pub struct LookupIndex {
    keys:              KeySpace,
    backend:           BackendClient,
    lookup_ttl:        Duration,
    recent_change_ttl: Duration,
    track_locks:       Arc<[Mutex<()>]>,
}

impl LookupIndex {
    pub fn new(keys: KeySpace, backend: BackendClient, lookup_ttl: Duration, recent_change_ttl: Duration) -> Self {
        Self {
            keys,
            backend,
            lookup_ttl,
            recent_change_ttl,
            track_locks: (0..TRACK_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lookup_key(&self, type_name: &TypeName, criteria: &Criteria) -> String {
        self.keys.lookup(type_name, &fingerprint(criteria))
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn resolve(&self, type_name: &TypeName, criteria: &Criteria) -> Resolution {
        let key = self.lookup_key(type_name, criteria);
        match self.backend.read::<LookupEntry>(&key).await {
            Some(LookupEntry::Resolved(pk)) => Resolution::Resolved(pk),
            Some(LookupEntry::NotFound) => Resolution::NotFound,
            None => Resolution::Unknown,
        }
    }

    /// Remembers that `criteria` resolved to the record `pk`. Fails only when `pk` cannot form an identifier.
    #[instrument(level = "trace", skip(self))]
    pub async fn record(
        &self,
        type_name: &TypeName,
        pk: &PrimaryKey,
        criteria: &Criteria,
        recently_changed: bool,
    ) -> Result<()> {
        let identifier = encode_typed(type_name, pk)?;
        let key = self.lookup_key(type_name, criteria);
        let ttl = if recently_changed {
            self.recent_change_ttl
        }
        else {
            self.lookup_ttl
        };

        if !self.track(&self.keys.fanout(&identifier), key.clone(), ttl).await {
            debug!(%identifier, "lookup not cached: its fanout set is unavailable");
            return Ok(());
        }
        self.backend.write(&key, &LookupEntry::Resolved(pk.clone()), ttl).await;
        Ok(())
    }

    /// Remembers that `criteria` match nothing.
    #[instrument(level = "trace", skip(self))]
    pub async fn record_missing(&self, type_name: &TypeName, criteria: &Criteria, ttl: Duration) {
        let key = self.lookup_key(type_name, criteria);
        if !self.track(&self.keys.negatives(type_name), key.clone(), ttl).await {
            debug!(%type_name, "negative lookup not cached: the negative set is unavailable");
            return;
        }
        self.backend.write(&key, &LookupEntry::NotFound, ttl).await;
    }

    fn track_lock(&self, set_key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        set_key.hash(&mut hasher);
        &self.track_locks[hasher.finish() as usize % self.track_locks.len()]
    }

    // A set that is absent reads as empty; a set that cannot be read is not overwritten.
    async fn track(&self, set_key: &str, key: String, ttl: Duration) -> bool {
        let _guard = self.track_lock(set_key).lock().await;

        let outcome = self.backend.fetch::<KeySet>(set_key).await;
        let Some(set) = self.backend.absorb("get", set_key, outcome).await
        else {
            return false;
        };
        let mut set = set.unwrap_or_default();
        // Rewritten even when the key is already there: the set must outlive the entry being refreshed.
        set.add(key, ttl);
        self.backend.write(set_key, &set, set.ttl()).await
    }

    /// Drops every lookup entry resolving to `identifier`, then the fanout set itself. Returns how many lookup entries
    /// were named by the set.
    #[instrument(level = "trace", skip(self))]
    pub async fn purge_all(&self, identifier: &Identifier) -> usize {
        self.purge_set(&self.keys.fanout(identifier)).await
    }

    /// Drops every negative lookup entry of the type.
    #[instrument(level = "trace", skip(self))]
    pub async fn purge_missing(&self, type_name: &TypeName) -> usize {
        self.purge_set(&self.keys.negatives(type_name)).await
    }

    async fn purge_set(&self, set_key: &str) -> usize {
        let Some(set) = self.backend.read::<KeySet>(set_key).await
        else {
            return 0;
        };
        for key in set.keys() {
            self.backend.purge(key).await;
        }
        self.backend.purge(set_key).await;
        debug!(set = set_key, purged = set.len(), "lookup entries purged");
        set.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MokaBackend;
    use crate::backend::Observers;
    use crate::criteria;
    use crate::test::RecordingBackend;

    fn index(backend: Arc<RecordingBackend>) -> LookupIndex {
        LookupIndex::new(
            KeySpace::new("t"),
            BackendClient::new(backend, Duration::from_millis(200), Observers::default()),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        )
    }

    fn widget() -> TypeName {
        TypeName::new("shop.widget").unwrap()
    }

    #[tokio::test]
    async fn resolve_after_record() {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let index = index(backend.clone());
        let by_sku = criteria! { "sku" => "W-1", "owner_id" => 3 };

        assert_eq!(index.resolve(&widget(), &by_sku).await, Resolution::Unknown);
        index.record(&widget(), &PrimaryKey::Int(1), &by_sku, false).await.unwrap();
        assert_eq!(
            index.resolve(&widget(), &criteria! { "owner_id" => 3, "sku" => "W-1" }).await,
            Resolution::Resolved(PrimaryKey::Int(1))
        );

        let key = KeySpace::new("t").lookup(&widget(), &fingerprint(&by_sku));
        assert_eq!(backend.ttl_of(&key), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn recent_change_shortens_ttl_and_fanout_keeps_the_longest() {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let index = index(backend.clone());
        let keys = KeySpace::new("t");
        let id = encode_typed(&widget(), &PrimaryKey::Int(1)).unwrap();

        let recent = criteria! { "sku" => "W-1" };
        index.record(&widget(), &PrimaryKey::Int(1), &recent, true).await.unwrap();
        assert_eq!(
            backend.ttl_of(&keys.lookup(&widget(), &fingerprint(&recent))),
            Some(Duration::from_secs(60))
        );
        assert_eq!(backend.ttl_of(&keys.fanout(&id)), Some(Duration::from_secs(60)));

        index
            .record(&widget(), &PrimaryKey::Int(1), &criteria! { "name" => "one" }, false)
            .await
            .unwrap();
        assert_eq!(backend.ttl_of(&keys.fanout(&id)), Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn purge_all_clears_every_tracked_lookup() {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let index = index(backend.clone());
        let id = encode_typed(&widget(), &PrimaryKey::Int(7)).unwrap();
        let lookups = [
            criteria! { "sku" => "W-7" },
            criteria! { "name" => "seven" },
            criteria! { "owner_id" => 1, "name" => "seven" },
        ];
        for criteria in &lookups {
            index.record(&widget(), &PrimaryKey::Int(7), criteria, false).await.unwrap();
        }
        // Recording the same lookup twice doesn't grow the set.
        index.record(&widget(), &PrimaryKey::Int(7), &lookups[0], false).await.unwrap();

        assert_eq!(index.purge_all(&id).await, 3);
        for criteria in &lookups {
            assert_eq!(index.resolve(&widget(), criteria).await, Resolution::Unknown);
        }
        assert_eq!(index.purge_all(&id).await, 0);
    }

    #[tokio::test]
    async fn negative_lookups_are_purged_per_type() {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let index = index(backend.clone());
        let missing = criteria! { "sku" => "nope" };

        index.record_missing(&widget(), &missing, Duration::from_secs(300)).await;
        assert_eq!(index.resolve(&widget(), &missing).await, Resolution::NotFound);

        let gadget = TypeName::new("shop.gadget").unwrap();
        assert_eq!(index.resolve(&gadget, &missing).await, Resolution::Unknown);
        assert_eq!(index.purge_missing(&gadget).await, 0);

        assert_eq!(index.purge_missing(&widget()).await, 1);
        assert_eq!(index.resolve(&widget(), &missing).await, Resolution::Unknown);
    }

    #[tokio::test]
    async fn negative_set_keeps_live_keys_only() {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let index = index(backend.clone());
        let keys = KeySpace::new("t");
        let gone = criteria! { "sku" => "gone" };
        let kept = criteria! { "sku" => "kept" };
        let fresh = criteria! { "sku" => "fresh" };

        index.record_missing(&widget(), &gone, Duration::from_millis(100)).await;
        index.record_missing(&widget(), &kept, Duration::from_secs(300)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        index.record_missing(&widget(), &fresh, Duration::from_secs(300)).await;

        let set = index.backend.read::<KeySet>(&keys.negatives(&widget())).await.unwrap();
        assert_eq!(
            set.keys().collect::<Vec<_>>(),
            [
                keys.lookup(&widget(), &fingerprint(&kept)),
                keys.lookup(&widget(), &fingerprint(&fresh))
            ]
        );
        assert_eq!(index.purge_missing(&widget()).await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_records_are_all_tracked() {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let index = index(backend);
        let id = encode_typed(&widget(), &PrimaryKey::Int(7)).unwrap();

        let tasks = (0..24)
            .map(|n| {
                let index = index.clone();
                tokio::spawn(async move {
                    index
                        .record(&widget(), &PrimaryKey::Int(7), &criteria! { "name" => n }, false)
                        .await
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(index.purge_all(&id).await, 24);
    }

    #[tokio::test]
    async fn untrackable_lookup_is_not_cached() {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let index = index(backend.clone());
        let by_sku = criteria! { "sku" => "W-1" };

        backend.set_failing(true);
        index.record(&widget(), &PrimaryKey::Int(1), &by_sku, false).await.unwrap();
        backend.set_failing(false);
        assert_eq!(index.resolve(&widget(), &by_sku).await, Resolution::Unknown);
    }

    #[tokio::test]
    async fn bad_primary_key_is_rejected() {
        let index = LookupIndex::new(
            KeySpace::new("t"),
            BackendClient::new(
                Arc::new(MokaBackend::new("m", 10)),
                Duration::from_millis(200),
                Observers::default(),
            ),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        assert!(index
            .record(&widget(), &PrimaryKey::from("a.b"), &criteria! { "sku" => "x" }, false)
            .await
            .is_err());
    }
}
