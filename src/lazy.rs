use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::codec::Identifier;
use crate::error::Error;
use crate::error::Result;
use crate::manager::RowCache;
use crate::traits::RecordStore;
use crate::types::LookupSubject;

/// A record that is loaded on first access.
///
/// The outcome of a successful resolution is kept for the lifetime of the handle, a failed one is retried on the next
/// access. In fail-silently mode a missing record or a bad subject resolves to `None` instead of an error.
pub struct LazyRecord<S>
where
    S: RecordStore,
{
    cache:         Arc<RowCache<S>>,
    subject:       LookupSubject,
    fail_silently: bool,
    record:        OnceCell<Option<S::Record>>,
}

impl<S> LazyRecord<S>
where
    S: RecordStore,
{
    pub fn new(cache: Arc<RowCache<S>>, subject: LookupSubject) -> Self {
        Self {
            cache,
            subject,
            fail_silently: false,
            record: OnceCell::new(),
        }
    }

    pub fn fail_silently(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    pub fn subject(&self) -> &LookupSubject {
        &self.subject
    }

    pub fn is_resolved(&self) -> bool {
        self.record.initialized()
    }

    pub async fn get(&self) -> Result<Option<&S::Record>> {
        let record = self
            .record
            .get_or_try_init(|| async {
                match self.cache.get_subject(&self.subject).await {
                    Ok(record) => Ok(Some(record)),
                    Err(err) if self.fail_silently && Self::is_silenced(&err) => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(record.as_ref())
    }

    /// The identifier of the record, without loading it when the subject already names it.
    pub async fn identifier(&self) -> Result<Identifier> {
        if let Some(Some(record)) = self.record.get() {
            return self.cache.identifier_of(record);
        }
        self.cache.identifier_for_subject(&self.subject).await
    }

    fn is_silenced(err: &Error) -> bool {
        matches!(
            err,
            Error::RecordNotFound { .. } | Error::MalformedIdentifier(_) | Error::InvalidArgument(_)
        )
    }
}

impl<S> Debug for LazyRecord<S>
where
    S: RecordStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyRecord")
            .field("subject", &self.subject)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Lazy handles deduplicated by identifier: every caller asking for the same record shares one handle and thus one
/// load.
pub struct LazyRecords<S>
where
    S: RecordStore,
{
    cache:   Arc<RowCache<S>>,
    handles: Mutex<HashMap<Identifier, Arc<LazyRecord<S>>>>,
}

impl<S> LazyRecords<S>
where
    S: RecordStore,
{
    pub fn new(cache: Arc<RowCache<S>>) -> Self {
        Self {
            cache,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_add(&self, identifier: Identifier) -> Arc<LazyRecord<S>> {
        self.handles
            .lock()
            .entry(identifier)
            .or_insert_with_key(|identifier| {
                Arc::new(LazyRecord::new(self.cache.clone(), identifier.clone().into()).fail_silently())
            })
            .clone()
    }

    pub fn get(&self, identifier: &Identifier) -> Option<Arc<LazyRecord<S>>> {
        self.handles.lock().get(identifier).cloned()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MokaBackend;
    use crate::config::CacheConfig;
    use crate::criteria;
    use crate::test::Widget;
    use crate::test::WidgetStore;
    use crate::types::PrimaryKey;

    fn cache() -> Arc<RowCache<WidgetStore>> {
        let store = WidgetStore::new();
        store.insert(Widget::new(1, "one", "W-1", 10));
        Arc::new(
            RowCache::new(
                store,
                Arc::new(CacheConfig::builder().build().unwrap()),
                Arc::new(MokaBackend::new("m", 100)),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn resolves_once() {
        let cache = cache();
        let lazy = cache.lazy(LookupSubject::Filter(
            cache.type_name().clone(),
            criteria! { "sku" => "W-1" },
        ));
        assert!(!lazy.is_resolved());
        assert_eq!(lazy.get().await.unwrap().map(|w| w.id), Some(1));
        assert!(lazy.is_resolved());
        assert_eq!(lazy.get().await.unwrap().map(|w| w.id), Some(1));
        assert_eq!(cache.store().filter_reads(), 1);
        assert_eq!(lazy.identifier().await.unwrap().as_str(), "shop.widget.1");
    }

    #[tokio::test]
    async fn failures_are_silenced_on_request() {
        let cache = cache();
        let subject = LookupSubject::Key(cache.type_name().clone(), PrimaryKey::Int(404));

        let loud = cache.lazy(subject.clone());
        assert!(loud.get().await.unwrap_err().is_not_found());
        assert!(!loud.is_resolved());

        let quiet = cache.lazy(subject).fail_silently();
        assert!(quiet.get().await.unwrap().is_none());
        assert!(quiet.is_resolved());
    }

    #[tokio::test]
    async fn handles_are_shared_per_identifier() {
        let cache = cache();
        let handles = LazyRecords::new(cache.clone());
        let id = Identifier::parse("shop.widget.1").unwrap();

        let first = handles.get_or_add(id.clone());
        let second = handles.get_or_add(id.clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(handles.len(), 1);

        assert_eq!(first.get().await.unwrap().map(|w| w.name.clone()).as_deref(), Some("one"));
        assert!(handles.get(&id).is_some_and(|h| h.is_resolved()));

        let missing = handles.get_or_add(Identifier::parse("shop.widget.2").unwrap());
        assert!(missing.get().await.unwrap().is_none());
        assert_eq!(cache.store().pk_reads(), 2);
    }
}
