#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use rowcache::codec::fingerprint;
use rowcache::codec::KeySpace;
use rowcache::config::CacheConfigBuilder;
use rowcache::prelude::*;
use rowcache::test::RecordingBackend;
use rowcache::test::Widget;
use rowcache::test::WidgetStore;
use rowcache::test::WIDGET_TYPE;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> CacheConfigBuilder {
    CacheConfig::builder().key_prefix("it")
}

pub fn widgets() -> WidgetStore {
    let store = WidgetStore::new();
    store.insert(Widget::new(1, "one", "W-1", 10));
    store.insert(Widget::new(2, "two", "W-2", 10));
    store.insert(Widget::new(7, "seven", "W-7", 20));
    store
}

pub struct Setup {
    pub cache:   Arc<RowCache<WidgetStore>>,
    pub backend: Arc<RecordingBackend>,
}

impl Setup {
    pub fn new(config: CacheConfig) -> Self {
        init_tracing();
        let backend = Arc::new(RecordingBackend::new("recording"));
        let cache = Arc::new(RowCache::new(widgets(), Arc::new(config), backend.clone()).unwrap());
        Self { cache, backend }
    }

    pub fn with_negative_caching() -> Self {
        Self::new(config().build().unwrap().with_negative_caching(WIDGET_TYPE))
    }

    pub fn store(&self) -> &WidgetStore {
        self.cache.store()
    }

    pub fn lookup_key(&self, criteria: &Criteria) -> String {
        KeySpace::new(self.cache.config().key_prefix()).lookup(self.cache.type_name(), &fingerprint(criteria))
    }

    pub fn identifier(&self, id: i64) -> Identifier {
        self.cache.identifier(&PrimaryKey::Int(id)).unwrap()
    }
}

pub const SHORT: Duration = Duration::from_millis(300);
