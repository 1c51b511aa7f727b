use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::instrument;

use crate::backend::BackendClient;
use crate::backend::BackendRegistry;
use crate::backend::Observers;
use crate::codec::encode_typed;
use crate::codec::Identifier;
use crate::codec::KeySpace;
use crate::codec::TypeName;
use crate::config::CacheConfig;
use crate::error::Error;
use crate::error::Result;
use crate::hook::InvalidationHook;
use crate::lazy::LazyRecord;
use crate::lookup::LookupIndex;
use crate::traits::CacheBackend;
use crate::traits::CacheObserver;
use crate::traits::RecordStore;
use crate::types::CachedRow;
use crate::types::Criteria;
use crate::types::LookupSubject;
use crate::types::PrimaryKey;
use crate::types::Resolution;

/// Read-through cache of the records of one type.
///
/// ```ignore
/// let config = Arc::new(CacheConfig::from_env()?);
/// let registry = BackendRegistry::with_moka(config.backend(), config.max_capacity());
/// let widgets = RowCache::from_registry(WidgetStore::new(pool), config, &registry)?;
///
/// let widget = widgets.get(&criteria! { "sku" => "W-1" }).await?;
/// let same = widgets.get_by_pk(widget.id).await?;
/// ```
///
/// Lookups by primary key go straight to the row entry. Any other lookup is first resolved to a primary key through
/// the [`LookupIndex`]. Misses are served by the record store and populate the cache on the way back.
pub struct RowCache<S>
where
    S: RecordStore,
{
    store:     S,
    type_name: TypeName,
    config:    Arc<CacheConfig>,
    keys:      KeySpace,
    backend:   BackendClient,
    lookups:   LookupIndex,
    hook:      Arc<InvalidationHook>,
    observers: Observers,
}

impl<S> RowCache<S>
where
    S: RecordStore,
{
    pub fn new(store: S, config: Arc<CacheConfig>, backend: Arc<dyn CacheBackend>) -> Result<Self> {
        let type_name = TypeName::new(store.type_name())?;
        let observers = Observers::default();
        let keys = KeySpace::new(config.key_prefix());
        let backend = BackendClient::new(backend, config.backend_timeout(), observers.clone());
        let lookups = LookupIndex::new(
            keys.clone(),
            backend.clone(),
            config.lookup_ttl(),
            config.recent_change_ttl(),
        );
        let hook = Arc::new(InvalidationHook::new(
            keys.clone(),
            backend.clone(),
            lookups.clone(),
            observers.clone(),
            config.enabled(),
            config.recent_change_ttl(),
        ));

        Ok(Self {
            store,
            type_name,
            config,
            keys,
            backend,
            lookups,
            hook,
            observers,
        })
    }

    /// Uses the backend the configuration names.
    pub fn from_registry(store: S, config: Arc<CacheConfig>, registry: &BackendRegistry) -> Result<Self> {
        let backend = registry
            .select(&config.backend())
            .map_err(|err| Error::Config(err.to_string()))?;
        Self::new(store, config, backend)
    }

    pub fn add_observer(&self, observer: Arc<dyn CacheObserver>) {
        self.observers.add(observer);
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }

    /// The listener to subscribe to change events of this type.
    pub fn hook(&self) -> &Arc<InvalidationHook> {
        &self.hook
    }

    pub fn lookups(&self) -> &LookupIndex {
        &self.lookups
    }

    pub fn identifier(&self, pk: &PrimaryKey) -> Result<Identifier> {
        encode_typed(&self.type_name, pk)
    }

    pub fn identifier_of(&self, record: &S::Record) -> Result<Identifier> {
        self.identifier(&self.store.primary_key_of(record))
    }

    /// Fetches the single record matching `criteria`.
    #[instrument(level = "debug", skip(self), fields(type_name = %self.type_name))]
    pub async fn get(&self, criteria: &Criteria) -> Result<S::Record> {
        if criteria.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "{} lookup needs at least one criterion",
                self.type_name
            )));
        }

        let pk = criteria.primary_key()?.map(|pk| self.store_key(pk));

        if !self.config.enabled() {
            let record = match &pk {
                Some(pk) => self.store.get_by_primary_key(pk).await?,
                None => self.store.get_by_filter(criteria).await?,
            };
            return record.ok_or_else(|| self.not_found(criteria));
        }

        match pk {
            Some(pk) => self.get_by_key(pk, criteria).await,
            None => self.get_by_lookup(criteria).await,
        }
    }

    pub async fn get_by_pk(&self, pk: impl Into<PrimaryKey>) -> Result<S::Record> {
        self.get(&Criteria::pk(pk)).await
    }

    /// Lookup through a relation: the relation's implicit `constraint` is merged into the criteria first, so the
    /// result is cached the same as an explicit lookup with the combined criteria.
    pub async fn get_related(&self, constraint: &Criteria, criteria: &Criteria) -> Result<S::Record> {
        self.get(&criteria.merged_over(constraint)).await
    }

    pub async fn get_subject(&self, subject: &LookupSubject) -> Result<S::Record> {
        match subject {
            LookupSubject::Identifier(identifier) => {
                self.check_type(&identifier.type_name())?;
                self.get_by_pk(self.store.primary_key_from_segment(identifier.key_segment()))
                    .await
            }
            LookupSubject::Key(type_name, pk) => {
                self.check_type(type_name)?;
                self.get_by_pk(pk.clone()).await
            }
            LookupSubject::Filter(type_name, criteria) => {
                self.check_type(type_name)?;
                self.get(criteria).await
            }
        }
    }

    /// Resolves criteria to the identifier of the matching record, loading the record only when the lookup is not
    /// cached yet.
    pub async fn identifier_for(&self, criteria: &Criteria) -> Result<Identifier> {
        if let Some(pk) = criteria.primary_key()? {
            return self.identifier(&pk);
        }

        if self.config.enabled() {
            match self.lookups.resolve(&self.type_name, criteria).await {
                Resolution::Resolved(pk) => return self.identifier(&pk),
                Resolution::NotFound => return Err(self.not_found(criteria)),
                Resolution::Unknown => (),
            }
        }

        let record = self.get(criteria).await?;
        self.identifier_of(&record)
    }

    pub async fn identifier_for_subject(&self, subject: &LookupSubject) -> Result<Identifier> {
        match subject {
            LookupSubject::Identifier(identifier) => {
                self.check_type(&identifier.type_name())?;
                Ok(identifier.clone())
            }
            LookupSubject::Key(type_name, pk) => {
                self.check_type(type_name)?;
                self.identifier(pk)
            }
            LookupSubject::Filter(type_name, criteria) => {
                self.check_type(type_name)?;
                self.identifier_for(criteria).await
            }
        }
    }

    /// Forced purge of a record and of every lookup resolving to it.
    pub async fn invalidate(&self, pk: impl Into<PrimaryKey>) -> Result<()> {
        let identifier = self.identifier(&pk.into())?;
        self.hook.invalidate(&identifier, None).await;
        Ok(())
    }

    /// A handle resolving `subject` on first access.
    pub fn lazy(self: &Arc<Self>, subject: impl Into<LookupSubject>) -> LazyRecord<S> {
        LazyRecord::new(self.clone(), subject.into())
    }

    // String criteria carry no type; the store decides what they stand for.
    fn store_key(&self, pk: PrimaryKey) -> PrimaryKey {
        match pk {
            PrimaryKey::Str(segment) => self.store.primary_key_from_segment(&segment),
            pk => pk,
        }
    }

    async fn get_by_key(&self, pk: PrimaryKey, criteria: &Criteria) -> Result<S::Record> {
        let identifier = self.identifier(&pk)?;
        let row_key = self.keys.row(&identifier);

        match self.backend.read::<CachedRow<S::Record>>(&row_key).await {
            Some(CachedRow::Record(record)) => {
                debug!(%identifier, "row hit");
                return Ok(record);
            }
            Some(CachedRow::NotFound) => {
                debug!(%identifier, "negative row hit");
                return Err(self.not_found(criteria));
            }
            None => (),
        }

        match self.store.get_by_primary_key(&pk).await? {
            Some(record) => {
                self.cache_row(&identifier, &record).await;
                Ok(record)
            }
            None => {
                if self.config.caches_not_found(self.type_name.as_str()) {
                    let ttl = self.negative_ttl(Some(&identifier)).await;
                    self.backend
                        .write(&row_key, &CachedRow::<S::Record>::NotFound, ttl)
                        .await;
                }
                Err(self.not_found(criteria))
            }
        }
    }

    async fn get_by_lookup(&self, criteria: &Criteria) -> Result<S::Record> {
        let mut known = None;

        match self.lookups.resolve(&self.type_name, criteria).await {
            Resolution::NotFound => {
                debug!(%criteria, "negative lookup hit");
                return Err(self.not_found(criteria));
            }
            Resolution::Resolved(pk) => {
                let identifier = self.identifier(&pk)?;
                match self
                    .backend
                    .read::<CachedRow<S::Record>>(&self.keys.row(&identifier))
                    .await
                {
                    Some(CachedRow::Record(record)) => {
                        debug!(%identifier, %criteria, "lookup hit");
                        return Ok(record);
                    }
                    Some(CachedRow::NotFound) => return Err(self.not_found(criteria)),
                    None => known = Some(identifier),
                }
            }
            Resolution::Unknown => (),
        }

        match self.store.get_by_filter(criteria).await? {
            Some(record) => {
                let pk = self.store.primary_key_of(&record);
                let identifier = self.identifier(&pk)?;
                self.cache_row(&identifier, &record).await;
                let recently_changed = self.recently_changed(&identifier).await;
                self.lookups
                    .record(&self.type_name, &pk, criteria, recently_changed)
                    .await?;
                Ok(record)
            }
            None => {
                if self.config.caches_not_found(self.type_name.as_str()) {
                    let ttl = self.negative_ttl(known.as_ref()).await;
                    self.lookups.record_missing(&self.type_name, criteria, ttl).await;
                }
                Err(self.not_found(criteria))
            }
        }
    }

    async fn cache_row(&self, identifier: &Identifier, record: &S::Record) {
        self.backend
            .write(
                &self.keys.row(identifier),
                &CachedRow::Record(record.clone()),
                self.config.row_ttl(),
            )
            .await;
    }

    async fn recently_changed(&self, identifier: &Identifier) -> bool {
        self.backend.flag(&self.keys.changed(identifier)).await
    }

    async fn negative_ttl(&self, identifier: Option<&Identifier>) -> Duration {
        match identifier {
            Some(identifier) if self.recently_changed(identifier).await => self.config.recent_change_ttl(),
            _ => self.config.negative_ttl(),
        }
    }

    fn check_type(&self, type_name: &TypeName) -> Result<()> {
        if *type_name == self.type_name {
            Ok(())
        }
        else {
            Err(Error::InvalidArgument(format!(
                "{type_name} subject passed to the {} cache",
                self.type_name
            )))
        }
    }

    fn not_found(&self, criteria: &Criteria) -> Error {
        Error::not_found(self.type_name.as_str(), criteria)
    }
}

impl<S> Debug for RowCache<S>
where
    S: RecordStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache")
            .field("type_name", &self.type_name)
            .field("backend", &self.backend)
            .field("enabled", &self.config.enabled())
            .finish()
    }
}
