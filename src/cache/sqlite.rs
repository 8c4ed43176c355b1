use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::error::Result;

/// SQLite-backed cache. One row per (namespace, key); writes upsert.
#[derive(Debug, Clone)]
pub struct SqliteCache {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteCache {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn open(path: &str, namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{path}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let cache = Self::with_pool(pool, namespace).await?;
        info!("Cache ready at {path} (namespace {namespace})");
        Ok(cache)
    }

    pub async fn with_pool(pool: SqlitePool, namespace: &str) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            namespace: namespace.to_string(),
        })
    }
}

impl CacheStore for SqliteCache {
    async fn get_raw(&self, key: &str) -> Option<String> {
        let row: std::result::Result<Option<(String,)>, sqlx::Error> =
            sqlx::query_as("SELECT value FROM cache_entries WHERE namespace = ? AND key = ?")
                .bind(&self.namespace)
                .bind(key)
                .fetch_optional(&self.pool)
                .await;
        match row {
            Ok(row) => row.map(|(value,)| value),
            Err(e) => {
                warn!(key, "cache read failed, treating as absent: {e}");
                None
            }
        }
    }

    async fn put_raw(&self, key: &str, value: String) {
        let result = sqlx::query(
            r#"
            INSERT INTO cache_entries (namespace, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (namespace, key) DO UPDATE
            SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(value)
        .bind(now_ms())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(key, "cache write failed: {e}");
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
