use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;

use crate::backend::BackendClient;
use crate::backend::Observers;
use crate::codec::Identifier;
use crate::codec::KeySpace;
use crate::codec::TypeName;
use crate::lookup::LookupIndex;
use crate::traits::ChangeListener;
use crate::types::ChangeEvent;

/// Purges cached state on record changes.
///
/// Every step talks to the backend on its own; a failed step is logged and the next one is still attempted. Nothing
/// here ever fails the write that triggered it.
#[derive(Clone, Debug)]
pub struct InvalidationHook {
    keys:              KeySpace,
    backend:           BackendClient,
    lookups:           LookupIndex,
    observers:         Observers,
    enabled:           bool,
    recent_change_ttl: Duration,
}

impl InvalidationHook {
    pub(crate) fn new(
        keys: KeySpace,
        backend: BackendClient,
        lookups: LookupIndex,
        observers: Observers,
        enabled: bool,
        recent_change_ttl: Duration,
    ) -> Self {
        Self {
            keys,
            backend,
            lookups,
            observers,
            enabled,
            recent_change_ttl,
        }
    }

    /// Marks the record as recently changed and drops its row entry along with every lookup resolving to it. The
    /// negative lookups of the type go too: the changed record may match one of them now.
    #[instrument(level = "debug", skip(self))]
    pub async fn invalidate(&self, identifier: &Identifier, event: Option<ChangeEvent>) {
        if !self.enabled {
            return;
        }

        self.backend
            .write(&self.keys.changed(identifier), &true, self.recent_change_ttl)
            .await;
        self.backend.purge(&self.keys.row(identifier)).await;
        let lookups = self.lookups.purge_all(identifier).await;
        let negatives = self.lookups.purge_missing(&identifier.type_name()).await;
        debug!(%identifier, lookups, negatives, "removed from cache");

        for observer in self.observers.snapshot() {
            observer.on_removed(identifier, event).await;
        }
    }

    /// A new record can only be shadowed by "not found" entries: the one under its own row key and the negative
    /// lookups of its type.
    #[instrument(level = "debug", skip(self))]
    pub async fn created(&self, type_name: &TypeName, identifier: &Identifier) {
        if !self.enabled {
            return;
        }

        self.backend.purge(&self.keys.row(identifier)).await;
        let negatives = self.lookups.purge_missing(type_name).await;
        debug!(%identifier, negatives, "negative entries cleared");
    }
}

#[async_trait]
impl<R> ChangeListener<R> for InvalidationHook
where
    R: Send + Sync,
{
    async fn on_before_delete(&self, _type_name: &TypeName, identifier: &Identifier, _instance: Option<&R>) {
        self.invalidate(identifier, Some(ChangeEvent::BeforeDelete)).await
    }

    // Repeated after the delete: a reader racing with it may have cached the row in between.
    async fn on_after_delete(&self, _type_name: &TypeName, identifier: &Identifier, _instance: Option<&R>) {
        self.invalidate(identifier, Some(ChangeEvent::AfterDelete)).await
    }

    async fn on_after_save(&self, type_name: &TypeName, identifier: &Identifier, _instance: Option<&R>, created: bool) {
        if created {
            self.created(type_name, identifier).await
        }
        else {
            self.invalidate(identifier, Some(ChangeEvent::AfterSave { created })).await
        }
    }

    async fn on_relation_changed(&self, _type_name: &TypeName, identifier: &Identifier, _instance: Option<&R>) {
        self.invalidate(identifier, Some(ChangeEvent::RelationChanged)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::encode;
    use crate::criteria;
    use crate::test::EventLog;
    use crate::test::RecordingBackend;
    use crate::types::CachedRow;
    use crate::types::PrimaryKey;
    use crate::types::Resolution;

    struct Fixture {
        backend: Arc<RecordingBackend>,
        client:  BackendClient,
        lookups: LookupIndex,
        hook:    InvalidationHook,
        events:  Arc<EventLog>,
        keys:    KeySpace,
    }

    fn fixture(enabled: bool) -> Fixture {
        let backend = Arc::new(RecordingBackend::new("rec"));
        let observers = Observers::default();
        let events = Arc::new(EventLog::default());
        observers.add(events.clone());
        let keys = KeySpace::new("t");
        let client = BackendClient::new(backend.clone(), Duration::from_millis(200), observers.clone());
        let lookups = LookupIndex::new(
            keys.clone(),
            client.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
        );
        let hook = InvalidationHook::new(
            keys.clone(),
            client.clone(),
            lookups.clone(),
            observers,
            enabled,
            Duration::from_secs(60),
        );
        Fixture {
            backend,
            client,
            lookups,
            hook,
            events,
            keys,
        }
    }

    fn widget() -> TypeName {
        TypeName::new("shop.widget").unwrap()
    }

    #[tokio::test]
    async fn update_purges_row_and_lookups() {
        let f = fixture(true);
        let id = encode("shop.widget", &PrimaryKey::Int(3)).unwrap();
        let by_sku = criteria! { "sku" => "W-3" };
        f.client
            .write(&f.keys.row(&id), &CachedRow::Record("three".to_string()), Duration::from_secs(600))
            .await;
        f.lookups.record(&widget(), &PrimaryKey::Int(3), &by_sku, false).await.unwrap();
        let missing = criteria! { "sku" => "W-33" };
        f.lookups.record_missing(&widget(), &missing, Duration::from_secs(300)).await;

        ChangeListener::<String>::on_after_save(&f.hook, &widget(), &id, None, false).await;

        assert!(f.client.read::<CachedRow<String>>(&f.keys.row(&id)).await.is_none());
        assert_eq!(f.lookups.resolve(&widget(), &by_sku).await, Resolution::Unknown);
        assert_eq!(f.lookups.resolve(&widget(), &missing).await, Resolution::Unknown);
        assert!(f.client.flag(&f.keys.changed(&id)).await);
        assert_eq!(f.backend.ttl_of(&f.keys.changed(&id)), Some(Duration::from_secs(60)));
        assert_eq!(f.events.removed(), vec![(id, Some(ChangeEvent::AfterSave { created: false }))]);
    }

    #[tokio::test]
    async fn create_clears_negative_entries_only() {
        let f = fixture(true);
        let id = encode("shop.widget", &PrimaryKey::Int(42)).unwrap();
        let missing = criteria! { "sku" => "W-42" };
        f.client
            .write(&f.keys.row(&id), &CachedRow::<String>::NotFound, Duration::from_secs(300))
            .await;
        f.lookups.record_missing(&widget(), &missing, Duration::from_secs(300)).await;

        ChangeListener::<String>::on_change(&f.hook, ChangeEvent::AfterSave { created: true }, &id, None).await;

        assert!(!f.client.flag(&f.keys.row(&id)).await);
        assert_eq!(f.lookups.resolve(&widget(), &missing).await, Resolution::Unknown);
        assert!(!f.client.flag(&f.keys.changed(&id)).await);
        assert!(f.events.removed().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_never_escapes() {
        let f = fixture(true);
        let id = encode("shop.widget", &PrimaryKey::Int(1)).unwrap();
        f.backend.set_failing(true);

        ChangeListener::<String>::on_before_delete(&f.hook, &widget(), &id, None).await;
        ChangeListener::<String>::on_after_delete(&f.hook, &widget(), &id, None).await;

        assert!(f.events.backend_errors() >= 2);
        assert_eq!(f.events.removed().len(), 2);
    }

    #[tokio::test]
    async fn disabled_hook_does_nothing() {
        let f = fixture(false);
        let id = encode("shop.widget", &PrimaryKey::Int(1)).unwrap();
        f.client
            .write(&f.keys.row(&id), &CachedRow::Record(1u32), Duration::from_secs(600))
            .await;

        ChangeListener::<u32>::on_relation_changed(&f.hook, &widget(), &id, None).await;

        assert!(f.client.flag(&f.keys.row(&id)).await);
        assert!(f.events.removed().is_empty());
    }
}
