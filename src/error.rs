use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that cross the public boundary of the cache.
///
/// Cache backend failures are not among them: they are absorbed where they happen and the operation falls back to
/// the record store. See [`BackendError`].
#[derive(Debug, Error)]
pub enum Error {
    /// The record is absent both in the cache and in the record store.
    #[error("{type_name} record not found for {lookup}")]
    RecordNotFound { type_name: String, lookup: String },

    #[error("malformed identifier '{0}'")]
    MalformedIdentifier(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filter criteria matched more than one record.
    #[error("{type_name} lookup {lookup} matched more than one record")]
    AmbiguousLookup { type_name: String, lookup: String },

    /// The record store failed for a reason other than a missing record.
    #[error("record store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn not_found(type_name: impl Into<String>, lookup: impl ToString) -> Self {
        Self::RecordNotFound {
            type_name: type_name.into(),
            lookup:    lookup.to_string(),
        }
    }

    pub fn ambiguous(type_name: impl Into<String>, lookup: impl ToString) -> Self {
        Self::AmbiguousLookup {
            type_name: type_name.into(),
            lookup:    lookup.to_string(),
        }
    }

    pub fn store<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Store(Box::new(err))
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound { .. })
    }
}

/// Failures of a cache backend. These never leave the crate's read and write paths; a failed read is a miss and a
/// failed invalidation step is logged and skipped.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("cache backend '{backend}' is unavailable: {reason}")]
    Unavailable { backend: String, reason: String },

    #[error("cache backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot (de)serialize cached value under '{key}': {reason}")]
    Codec { key: String, reason: String },

    #[error("no cache backend registered under the name '{0}'")]
    UnknownBackend(String),
}

impl From<garde::Report> for Error {
    fn from(report: garde::Report) -> Self {
        Self::Config(report.to_string())
    }
}

impl From<clap::Error> for Error {
    fn from(err: clap::Error) -> Self {
        Self::Config(err.to_string())
    }
}
