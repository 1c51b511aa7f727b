use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;

use crate::codec::Identifier;
use crate::codec::TypeName;
use crate::error::BackendError;
use crate::error::Result;
use crate::types::ChangeEvent;
use crate::types::Criteria;
use crate::types::PrimaryKey;
use crate::types::Saved;

/// The source of truth the cache sits in front of. One implementation per record type.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    type Record: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// `<namespace>.<model>` name of the record type.
    fn type_name(&self) -> &str;

    fn primary_key_of(&self, record: &Self::Record) -> PrimaryKey;

    /// Turns the textual form of a key, as found in an identifier or passed as a string criterion, into the key the
    /// store expects. Stores with string keys override this so that `"00501"` or `"42"` are never read as integers.
    fn primary_key_from_segment(&self, segment: &str) -> PrimaryKey {
        PrimaryKey::from_segment(segment)
    }

    async fn get_by_primary_key(&self, pk: &PrimaryKey) -> Result<Option<Self::Record>>;

    /// Must fail with [`Error::AmbiguousLookup`](crate::Error::AmbiguousLookup) when more than one record matches.
    async fn get_by_filter(&self, criteria: &Criteria) -> Result<Option<Self::Record>>;

    async fn save(&self, record: &Self::Record) -> Result<Saved>;

    /// Returns the deleted record, if there was one.
    async fn delete(&self, pk: &PrimaryKey) -> Result<Option<Self::Record>>;
}

/// A key-value store with per-key expiration. The cache only relies on this contract; it never implements storage
/// itself.
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync + 'static {
    /// Name under which the backend is registered.
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), BackendError>;
    async fn delete(&self, key: &str) -> Result<(), BackendError>;

    async fn contains(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Receiver of record change notifications.
///
/// Every method gets the type of the record, its identifier, and the instance when the notifier has it at hand.
#[async_trait]
pub trait ChangeListener<R>: Send + Sync
where
    R: Send + Sync,
{
    async fn on_before_delete(&self, type_name: &TypeName, identifier: &Identifier, instance: Option<&R>);
    async fn on_after_delete(&self, type_name: &TypeName, identifier: &Identifier, instance: Option<&R>);
    async fn on_after_save(&self, type_name: &TypeName, identifier: &Identifier, instance: Option<&R>, created: bool);
    async fn on_relation_changed(&self, type_name: &TypeName, identifier: &Identifier, instance: Option<&R>);

    /// Dispatches a change event to the corresponding method.
    async fn on_change(&self, event: ChangeEvent, identifier: &Identifier, instance: Option<&R>) {
        let type_name = identifier.type_name();
        match event {
            ChangeEvent::BeforeDelete => self.on_before_delete(&type_name, identifier, instance).await,
            ChangeEvent::AfterDelete => self.on_after_delete(&type_name, identifier, instance).await,
            ChangeEvent::AfterSave { created } => {
                self.on_after_save(&type_name, identifier, instance, created).await
            }
            ChangeEvent::RelationChanged => self.on_relation_changed(&type_name, identifier, instance).await,
        }
    }
}

/// Gets told about what the cache does behind the caller's back.
#[async_trait]
pub trait CacheObserver: Send + Sync + 'static {
    /// An identifier and every lookup pointing at it were purged.
    async fn on_removed(&self, _identifier: &Identifier, _event: Option<ChangeEvent>) {}
    /// A backend failure was absorbed.
    async fn on_backend_error(&self, _error: &BackendError) {}
}
