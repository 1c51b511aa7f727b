//! # rowcache
//!
//! Read-through, write-invalidated row cache for key-indexed record-based storages.
//!
//! Think of it as a cache in front of the point lookups of a database table: fetch a record by primary key or by any
//! combination of filter arguments, and get it from the cache whenever the cache knows the answer.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Key-indexed, record-based storage; e.g., database tables or remote services.
//! - Many more reads than writes, and reads that mostly fetch single records.
//! - Lookups that are not only by primary key: by email, by SKU, by a foreign key plus a slug.
//!
//! The cache operates on the following principles:
//!
//! - It is backend-agnostic: any key-value store with per-key expiration implements [`CacheBackend`]. An in-process
//!   backend over [moka](https://crates.io/crates/moka) is included.
//! - Records are cached under their [`Identifier`], `<namespace>.<model>.<pk>`.
//! - Every other lookup is cached as a fingerprint of its criteria pointing at a primary key. Each record keeps the
//!   list of fingerprints resolving to it, so a write purges all of them.
//! - The cache never fails a read or a write because the cache backend is unhappy; it falls back to the record store.
//! - Fully async.
//!
//! # Record Store
//!
//! The source of truth is a [`RecordStore`]. [`CachedRecordStore`] wraps one and implements the same trait, reading
//! through a [`RowCache`] and invalidating it on every write:
//!
//! ```ignore
//! let config = Arc::new(CacheConfig::from_env()?);
//! let registry = BackendRegistry::with_moka(config.backend(), config.max_capacity());
//! let widgets = CachedRecordStore::new(Arc::new(RowCache::from_registry(WidgetStore::new(db), config, &registry)?));
//!
//! let widget = widgets.get_by_filter(&criteria! { "sku" => "W-1" }).await?;
//! ```
//!
//! Writes that bypass the decorator must notify the cache themselves, via [`RowCache::hook()`], which implements
//! [`ChangeListener`], or via [`RowCache::invalidate()`].
//!
//! # Staleness
//!
//! A reader racing with a write may cache a value that is about to become stale. Right after a write the record is
//! marked as recently changed, and lookups cached while the mark lives expire along with it. The window is the
//! `recent_change_ttl` of the [`CacheConfig`].

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod hook;
pub mod lazy;
pub mod lookup;
pub mod manager;
pub mod store;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use backend::BackendRegistry;
#[doc(inline)]
pub use codec::Identifier;
#[doc(inline)]
pub use config::CacheConfig;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use error::Result;
#[doc(inline)]
pub use manager::RowCache;
#[doc(inline)]
pub use store::CachedRecordStore;
#[doc(inline)]
pub use traits::CacheBackend;
#[doc(inline)]
pub use traits::ChangeListener;
#[doc(inline)]
pub use traits::RecordStore;

pub mod prelude {
    pub use crate::backend::BackendRegistry;
    pub use crate::backend::MokaBackend;
    pub use crate::codec::Identifier;
    pub use crate::codec::TypeName;
    pub use crate::config::CacheConfig;
    pub use crate::criteria;
    pub use crate::error::Error;
    pub use crate::lazy::LazyRecord;
    pub use crate::lazy::LazyRecords;
    pub use crate::manager::RowCache;
    pub use crate::store::CachedRecordStore;
    pub use crate::traits::*;
    pub use crate::types::*;
}

/// Builds [`Criteria`](crate::types::Criteria) from `name => value` pairs.
///
/// ```ignore
/// let by_owner = criteria! { "owner_id" => 7, "sku" => "W-1" };
/// ```
#[macro_export]
macro_rules! criteria {
    () => {
        $crate::types::Criteria::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {
        $crate::types::Criteria::new()$(.with($name, $value))+
    };
}
