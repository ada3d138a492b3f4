use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const USERS_SET_KEY: &str = "gptrelay:users";
pub const SETTING_KEY: &str = "gptrelay:setting";

pub fn user_item_key(token: &str) -> String {
    format!("gptrelay:user:{token}")
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError(err.to_string())
    }
}

/// Minimal key-value surface the relay persists through.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    /// Writes `value`; with `keep_ttl` an existing expiry on the key is preserved.
    async fn set(&self, key: &str, value: &str, keep_ttl: bool) -> Result<(), StoreError>;
    async fn sadd(&self, set_key: &str, member: &str) -> Result<(), StoreError>;
    async fn smembers(&self, set_key: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<i64>,
}

#[derive(Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    sets: Arc<RwLock<HashMap<String, BTreeSet<String>>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let guard = self.entries.read().await;
        Ok(guard
            .get(key)
            .filter(|entry| entry.expires_at.is_none_or(|at| at > now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, keep_ttl: bool) -> Result<(), StoreError> {
        let mut guard = self.entries.write().await;
        let expires_at = if keep_ttl {
            guard.get(key).and_then(|entry| entry.expires_at)
        } else {
            None
        };
        guard.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn sadd(&self, set_key: &str, member: &str) -> Result<(), StoreError> {
        let mut guard = self.sets.write().await;
        guard
            .entry(set_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.sets.read().await;
        Ok(guard
            .get(set_key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Clone)]
pub struct SqliteKvStore {
    pool: Pool<Sqlite>,
}

impl SqliteKvStore {
    pub async fn new(dsn: &str) -> Result<Self, StoreError> {
        ensure_sqlite_file(dsn).map_err(StoreError)?;
        // every pooled connection to an in-memory database would see its own empty db
        let max_connections = if is_memory_dsn(dsn) { 1 } else { 5 };
        let options = dsn
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_entries (\
             key TEXT PRIMARY KEY,\
             value TEXT NOT NULL,\
             expires_at INTEGER\
             )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_sets (\
             set_key TEXT NOT NULL,\
             member TEXT NOT NULL,\
             PRIMARY KEY (set_key, member)\
             )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM kv_entries WHERE key=? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str, keep_ttl: bool) -> Result<(), StoreError> {
        let sql = if keep_ttl {
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, NULL)\
             ON CONFLICT(key) DO UPDATE SET value=excluded.value"
        } else {
            "INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, NULL)\
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, expires_at=NULL"
        };
        sqlx::query(sql)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sadd(&self, set_key: &str, member: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO kv_sets (set_key, member) VALUES (?, ?)")
            .bind(set_key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn smembers(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query_as::<_, (String,)>(
            "SELECT member FROM kv_sets WHERE set_key=? ORDER BY member",
        )
        .bind(set_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(member,)| member).collect())
    }
}

fn is_memory_dsn(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if is_memory_dsn(dsn) {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KvStore) {
        assert_eq!(store.get("missing").await.unwrap(), None);
        store.set("k", "v1", true).await.unwrap();
        store.set("k", "v2", false).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.sadd("s", "b").await.unwrap();
        store.sadd("s", "a").await.unwrap();
        store.sadd("s", "a").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["a", "b"]);
        assert!(store.smembers("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_roundtrips_keys_and_sets() {
        exercise(&MemoryKvStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_memory_store_roundtrips_keys_and_sets() {
        let store = SqliteKvStore::new("sqlite::memory:").await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn memory_store_keep_ttl_preserves_expiry() {
        let store = MemoryKvStore::new();
        store
            .entries
            .write()
            .await
            .insert(
                "expiring".to_string(),
                MemoryEntry {
                    value: "old".to_string(),
                    expires_at: Some(chrono::Utc::now().timestamp() - 10),
                },
            );
        store.set("expiring", "new", true).await.unwrap();
        assert_eq!(store.get("expiring").await.unwrap(), None);
        store.set("expiring", "new", false).await.unwrap();
        assert_eq!(store.get("expiring").await.unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn user_keys_are_namespaced() {
        assert_eq!(user_item_key("abc"), "gptrelay:user:abc");
    }
}
