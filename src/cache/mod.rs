//! Last-known-good snapshots, overwrite-only, shared by every view.
//!
//! Backends store raw JSON strings. Storage failures and undecodable entries
//! both read back as absent; nothing in here returns an error to callers.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::types::{MeetingDate, RaceScope};

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

pub trait CacheStore: Send + Sync {
    fn get_raw(&self, key: &str) -> impl Future<Output = Option<String>> + Send;

    /// Overwrites any previous value stored under `key`.
    fn put_raw(&self, key: &str, value: String) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Reunions(MeetingDate),
    Selections(RaceScope),
    Odds(RaceScope),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Reunions(date) => write!(f, "reunions_{date}"),
            CacheKey::Selections(s) => {
                write!(f, "selections_{}_{}_{}", s.date, s.reunion_label, s.race_label)
            }
            CacheKey::Odds(s) => write!(f, "odds_{}_{}_{}", s.date, s.reunion_label, s.race_label),
        }
    }
}

pub async fn get_json<T, C>(cache: &C, key: &CacheKey) -> Option<T>
where
    T: DeserializeOwned,
    C: CacheStore + ?Sized,
{
    let key = key.to_string();
    let raw = cache.get_raw(&key).await?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, "cache entry is malformed, ignoring: {e}");
            None
        }
    }
}

pub async fn put_json<T, C>(cache: &C, key: &CacheKey, value: &T)
where
    T: Serialize + Sync,
    C: CacheStore + ?Sized,
{
    let key = key.to_string();
    match serde_json::to_string(value) {
        Ok(raw) => cache.put_raw(&key, raw).await,
        Err(e) => warn!(key = %key, "cache entry could not be serialized: {e}"),
    }
}

/// Backend picked at startup: SQLite when the file opens, memory otherwise.
pub enum CacheBackend {
    Sqlite(SqliteCache),
    Memory(MemoryCache),
}

impl CacheStore for CacheBackend {
    async fn get_raw(&self, key: &str) -> Option<String> {
        match self {
            CacheBackend::Sqlite(c) => c.get_raw(key).await,
            CacheBackend::Memory(c) => c.get_raw(key).await,
        }
    }

    async fn put_raw(&self, key: &str, value: String) {
        match self {
            CacheBackend::Sqlite(c) => c.put_raw(key, value).await,
            CacheBackend::Memory(c) => c.put_raw(key, value).await,
        }
    }
}
