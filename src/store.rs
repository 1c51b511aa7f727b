use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::error::Result;
use crate::manager::RowCache;
use crate::traits::ChangeListener;
use crate::traits::RecordStore;
use crate::types::ChangeEvent;
use crate::types::Criteria;
use crate::types::PrimaryKey;
use crate::types::Saved;

/// Record store decorator: reads go through the [`RowCache`], writes go to the wrapped store and then fire the
/// invalidation hook. Exposes the same [`RecordStore`] interface, so the data-access layer picks the cached or the
/// plain store when it is constructed.
pub struct CachedRecordStore<S>
where
    S: RecordStore,
{
    cache: Arc<RowCache<S>>,
}

impl<S> CachedRecordStore<S>
where
    S: RecordStore,
{
    pub fn new(cache: Arc<RowCache<S>>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<RowCache<S>> {
        &self.cache
    }

    pub fn inner(&self) -> &S {
        self.cache.store()
    }

    /// Notifies the cache that a relation of the record has changed. Lookups through that relation may now resolve
    /// elsewhere.
    pub async fn relation_changed(&self, pk: &PrimaryKey) -> Result<()> {
        let identifier = self.cache.identifier(pk)?;
        self.cache
            .hook()
            .on_change(ChangeEvent::RelationChanged, &identifier, None::<&S::Record>)
            .await;
        Ok(())
    }

    fn found_or_none(outcome: Result<S::Record>) -> Result<Option<S::Record>> {
        match outcome {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl<S> RecordStore for CachedRecordStore<S>
where
    S: RecordStore,
{
    type Record = S::Record;

    fn type_name(&self) -> &str {
        self.cache.type_name().as_str()
    }

    fn primary_key_of(&self, record: &Self::Record) -> PrimaryKey {
        self.inner().primary_key_of(record)
    }

    fn primary_key_from_segment(&self, segment: &str) -> PrimaryKey {
        self.inner().primary_key_from_segment(segment)
    }

    async fn get_by_primary_key(&self, pk: &PrimaryKey) -> Result<Option<Self::Record>> {
        Self::found_or_none(self.cache.get_by_pk(pk.clone()).await)
    }

    async fn get_by_filter(&self, criteria: &Criteria) -> Result<Option<Self::Record>> {
        Self::found_or_none(self.cache.get(criteria).await)
    }

    #[instrument(level = "debug", skip(self, record))]
    async fn save(&self, record: &Self::Record) -> Result<Saved> {
        let pk = self.primary_key_of(record);
        let identifier = self.cache.identifier(&pk)?;
        let saved = self.inner().save(record).await?;
        let created = saved == Saved::Created;

        self.cache
            .hook()
            .on_change(ChangeEvent::AfterSave { created }, &identifier, Some(record))
            .await;

        if !created && self.cache.config().enabled() && self.cache.config().refill_on_save() {
            match self.cache.get_by_pk(pk).await {
                Ok(_) => debug!(%identifier, "refilled"),
                Err(err) => warn!(%identifier, "refill failed: {err}"),
            }
        }

        Ok(saved)
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, pk: &PrimaryKey) -> Result<Option<Self::Record>> {
        let identifier = self.cache.identifier(pk)?;
        let hook = self.cache.hook();

        hook.on_change(ChangeEvent::BeforeDelete, &identifier, None::<&S::Record>)
            .await;
        let deleted = self.inner().delete(pk).await?;
        hook.on_change(ChangeEvent::AfterDelete, &identifier, deleted.as_ref())
            .await;

        Ok(deleted)
    }
}
