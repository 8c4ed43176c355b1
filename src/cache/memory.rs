use dashmap::DashMap;

use crate::cache::CacheStore;

/// Process-local cache. Used in tests and when the SQLite file cannot be opened.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    async fn put_raw(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }
}
