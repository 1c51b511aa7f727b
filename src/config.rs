use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt::Display;
use std::time::Duration;

use clap::ArgAction;
use clap::Parser;
use fieldx::fxstruct;
use garde::Validate;

use crate::error::Result;

/// Values accepted as "true" for boolean settings, matched as prefixes.
const TRUTH_PREFIXES: [&str; 7] = ["y", "Y", "1", "t", "T", "en", "on"];

/// Row cache settings. Built once at process start, either with the builder or from the environment via
/// [`CacheConfig::from_env()`], and shared by reference afterwards.
///
/// ```ignore
/// let config = CacheConfig::builder()
///     .backend("default")
///     .row_ttl(Duration::from_secs(3600))
///     .build()?
///     .with_negative_caching("shop.widget");
/// ```
#[derive(Debug, Clone)]
#[fxstruct(no_new, builder, get(copy))]
pub struct CacheConfig {
    /// Name of the backend in the [`BackendRegistry`](crate::backend::BackendRegistry).
    #[fieldx(get(clone), builder(into), default(String::from("default")))]
    backend: String,

    /// Prefix of every key written to the backend.
    #[fieldx(get(clone), builder(into), default(String::from("rowcache")))]
    key_prefix: String,

    /// When off, every operation goes straight to the record store and nothing is cached or invalidated.
    #[fieldx(default(true))]
    enabled: bool,

    /// Time to live of cached records.
    #[fieldx(default(Duration::from_secs(60 * 60 * 24 * 7)))]
    row_ttl: Duration,

    /// Time to live of lookup-to-primary-key entries.
    #[fieldx(default(Duration::from_secs(60 * 60)))]
    lookup_ttl: Duration,

    /// Time to live of "not found" entries.
    #[fieldx(default(Duration::from_secs(60 * 5)))]
    negative_ttl: Duration,

    /// How long a record counts as recently changed after a write. Entries cached within this window live no longer
    /// than the window itself, to limit the damage of reading from a lagging replica.
    #[fieldx(default(Duration::from_secs(60)))]
    recent_change_ttl: Duration,

    /// Upper bound of a single backend call.
    #[fieldx(default(Duration::from_millis(250)))]
    backend_timeout: Duration,

    /// Capacity of the in-process backend.
    #[fieldx(default(100_000))]
    max_capacity: u64,

    /// Re-read an updated record right after its invalidation so that the cache holds the fresh copy.
    #[fieldx(default(false))]
    refill_on_save: bool,

    /// Types allowed to cache "not found" outcomes.
    #[fieldx(get(off), default(HashSet::new()))]
    negative_cache_types: HashSet<String>,
}

impl CacheConfig {
    /// Loads the settings from `ROWCACHE_*` environment variables, with defaults for missing ones.
    pub fn from_env() -> Result<Self> {
        Self::from_args(["rowcache"])
    }

    /// Parses command line style arguments; environment variables fill in for missing options.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        ConfigArgs::try_parse_from(args)?.into_config()
    }

    pub fn with_negative_caching(mut self, type_name: impl Into<String>) -> Self {
        self.negative_cache_types.insert(type_name.into());
        self
    }

    pub fn caches_not_found(&self, type_name: &str) -> bool {
        self.negative_cache_types.contains(type_name)
    }
}

/// Environment and command line form of [`CacheConfig`]. Durations are in seconds unless the name says otherwise.
#[derive(Debug, Clone, Parser, Validate)]
#[clap(about, name = "rowcache")]
pub struct ConfigArgs {
    /// Cache backend name.
    #[clap(long, env = "ROWCACHE_BACKEND", default_value = "default")]
    #[garde(length(min = 1))]
    backend: String,

    /// Prefix of the cache keys.
    #[clap(long, env = "ROWCACHE_KEY_PREFIX", default_value = "rowcache")]
    #[garde(length(min = 1))]
    key_prefix: String,

    /// Enable row caching.
    #[clap(long, env = "ROWCACHE_ENABLED", default_value = "true", value_parser = parse_truth, action = ArgAction::Set)]
    #[garde(skip)]
    enabled: bool,

    #[clap(long, env = "ROWCACHE_ROW_TTL", default_value_t = 60 * 60 * 24 * 7)]
    #[garde(range(min = 1))]
    row_ttl: u64,

    #[clap(long, env = "ROWCACHE_LOOKUP_TTL", default_value_t = 60 * 60)]
    #[garde(range(min = 1))]
    lookup_ttl: u64,

    #[clap(long, env = "ROWCACHE_NEGATIVE_TTL", default_value_t = 60 * 5)]
    #[garde(range(min = 1))]
    negative_ttl: u64,

    #[clap(long, env = "ROWCACHE_RECENT_CHANGE_TTL", default_value_t = 60)]
    #[garde(range(min = 1), custom(Self::not_longer_than("lookup-ttl", &self.lookup_ttl)))]
    recent_change_ttl: u64,

    #[clap(long, env = "ROWCACHE_BACKEND_TIMEOUT_MS", default_value_t = 250)]
    #[garde(range(min = 1))]
    backend_timeout_ms: u64,

    #[clap(long, env = "ROWCACHE_MAX_CAPACITY", default_value_t = 100_000)]
    #[garde(range(min = 1))]
    max_capacity: u64,

    /// Warm the cache with the fresh record after an update.
    #[clap(long, env = "ROWCACHE_REFILL_ON_SAVE", default_value = "false", value_parser = parse_truth, action = ArgAction::Set)]
    #[garde(skip)]
    refill_on_save: bool,

    /// Record types allowed to cache "not found" outcomes. Comma separated in the environment.
    #[clap(long = "negative-cache-type", env = "ROWCACHE_NEGATIVE_CACHE_TYPES", value_delimiter = ',')]
    #[garde(skip)]
    negative_cache_types: Vec<String>,
}

impl ConfigArgs {
    fn not_longer_than<'a, T: PartialOrd + Display>(
        max_name: &'static str,
        max: &'a T,
    ) -> impl FnOnce(&'a T, &()) -> garde::Result {
        move |value, _| {
            if value > max {
                Err(garde::Error::new(format!("{value} is longer than {max_name} ({max})")))
            }
            else {
                Ok(())
            }
        }
    }

    pub fn into_config(self) -> Result<CacheConfig> {
        self.validate()?;

        Ok(CacheConfig {
            backend:              self.backend,
            key_prefix:           self.key_prefix,
            enabled:              self.enabled,
            row_ttl:              Duration::from_secs(self.row_ttl),
            lookup_ttl:           Duration::from_secs(self.lookup_ttl),
            negative_ttl:         Duration::from_secs(self.negative_ttl),
            recent_change_ttl:    Duration::from_secs(self.recent_change_ttl),
            backend_timeout:      Duration::from_millis(self.backend_timeout_ms),
            max_capacity:         self.max_capacity,
            refill_on_save:       self.refill_on_save,
            negative_cache_types: self
                .negative_cache_types
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        })
    }
}

fn parse_truth(value: &str) -> std::result::Result<bool, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty value".to_string());
    }
    Ok(TRUTH_PREFIXES.iter().any(|prefix| value.starts_with(prefix)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn builder_defaults() {
        let config = CacheConfig::builder().build().unwrap();
        assert_eq!(config.backend(), "default");
        assert!(config.enabled());
        assert_eq!(config.row_ttl(), Duration::from_secs(604_800));
        assert_eq!(config.lookup_ttl(), Duration::from_secs(3600));
        assert_eq!(config.negative_ttl(), Duration::from_secs(300));
        assert_eq!(config.recent_change_ttl(), Duration::from_secs(60));
        assert!(!config.caches_not_found("shop.widget"));
        assert!(config.with_negative_caching("shop.widget").caches_not_found("shop.widget"));
    }

    #[test]
    fn args_override_defaults() {
        let config = CacheConfig::from_args([
            "rowcache",
            "--row-ttl=10",
            "--recent-change-ttl=5",
            "--enabled=off",
            "--negative-cache-type=shop.widget,shop.gadget",
        ])
        .unwrap();
        assert_eq!(config.row_ttl(), Duration::from_secs(10));
        assert_eq!(config.recent_change_ttl(), Duration::from_secs(5));
        assert!(!config.enabled());
        assert!(config.caches_not_found("shop.widget"));
        assert!(config.caches_not_found("shop.gadget"));
    }

    #[test]
    fn invalid_args_are_config_errors() {
        assert!(matches!(
            CacheConfig::from_args(["rowcache", "--row-ttl=0"]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_args(["rowcache", "--lookup-ttl=30", "--recent-change-ttl=60"]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_args(["rowcache", "--row-ttl=soon"]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn truth_values() {
        for yes in ["y", "Yes", "1", "true", "True", "enabled", "on"] {
            assert_eq!(parse_truth(yes), Ok(true), "{yes}");
        }
        for no in ["n", "0", "false", "off", "disabled"] {
            assert_eq!(parse_truth(no), Ok(false), "{no}");
        }
        assert!(parse_truth(" ").is_err());
    }
}
