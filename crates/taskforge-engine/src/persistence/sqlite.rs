//! Embedded, single-file, journalled store backend.
//!
//! Schema mirrors the two logical relations named in the external
//! interface: `state_data` and `state_locks`. The pool is capped at one
//! connection, which turns SQLite's own single-writer behaviour into the
//! "single serialisation point per key" guarantee without hand-rolled
//! per-key locking.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::error::ErrorKind;
use crate::value::{self, Value};

use super::store::{caller_owner, Kind, Store, StateEntry, StoreResult, StoreStats};

fn kind_to_str(kind: Kind) -> &'static str {
    match kind {
        Kind::String => "string",
        Kind::Number => "number",
        Kind::Boolean => "boolean",
        Kind::List => "list",
        Kind::Map => "map",
    }
}

fn kind_from_str(s: &str) -> StoreResult<Kind> {
    match s {
        "string" => Ok(Kind::String),
        "number" => Ok(Kind::Number),
        "boolean" => Ok(Kind::Boolean),
        "list" => Ok(Kind::List),
        "map" => Ok(Kind::Map),
        other => Err(ErrorKind::Corrupt(format!("unknown stored kind: {other}"))),
    }
}

fn encode_value(kind: Kind, value: &Value) -> String {
    match (kind, value) {
        (Kind::String, Value::String(s)) => s.clone(),
        (Kind::Number, Value::Number(n)) => n.to_string(),
        (Kind::Boolean, Value::Boolean(b)) => b.to_string(),
        _ => value::to_json(value).to_string(),
    }
}

fn decode_value(kind: Kind, raw: &str) -> StoreResult<Value> {
    match kind {
        Kind::String => Ok(Value::String(raw.to_string())),
        Kind::Number => raw
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|e| ErrorKind::Corrupt(e.to_string())),
        Kind::Boolean => raw
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|e| ErrorKind::Corrupt(e.to_string())),
        Kind::List | Kind::Map => {
            let json: serde_json::Value =
                serde_json::from_str(raw).map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
            Ok(value::from_json(&json))
        }
    }
}

/// An `sqlx`-backed store over a journalled SQLite file.
pub struct SqliteStore {
    pool: SqlitePool,
    sweeper: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

impl SqliteStore {
    /// Opens (creating if absent) the store file at `path`, runs schema
    /// setup, and spawns the background sweeper unless `spawn_sweeper` is
    /// false (tests construct stores without it to keep behaviour
    /// deterministic).
    pub async fn open(path: &Path, spawn_sweeper: bool) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ErrorKind::WorkdirCreate(e.to_string()))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| ErrorKind::Io(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_data (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                kind TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT,
                version INTEGER NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_state_data_expires_at ON state_data(expires_at);")
            .execute(&pool)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_state_data_updated_at ON state_data(updated_at);")
            .execute(&pool)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_locks (
                lock_name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_state_locks_expires_at ON state_locks(expires_at);")
            .execute(&pool)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?;

        let sweeper = if spawn_sweeper {
            let sweep_pool = pool.clone();
            Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
                loop {
                    interval.tick().await;
                    if let Err(error) = sweep_once(&sweep_pool).await {
                        tracing::warn!(%error, "background sweep failed");
                    }
                }
            }))
        } else {
            None
        };

        Ok(Self { pool, sweeper })
    }

    /// Resolves the default storage location, `$HOME/.<app>/state.db`.
    pub fn default_path(app: &str) -> StoreResult<std::path::PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ErrorKind::Io("could not resolve home directory".to_string()))?;
        Ok(home.join(format!(".{app}")).join("state.db"))
    }
}

async fn sweep_once(pool: &SqlitePool) -> StoreResult<u64> {
    let now = Utc::now().to_rfc3339();
    let data = sqlx::query("DELETE FROM state_data WHERE expires_at IS NOT NULL AND expires_at <= ?")
        .bind(&now)
        .execute(pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
    sqlx::query("DELETE FROM state_locks WHERE expires_at <= ?")
        .bind(&now)
        .execute(pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
    Ok(data.rows_affected())
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> StoreResult<StateEntry> {
    let kind = kind_from_str(row.try_get::<String, _>("kind").map_err(|e| ErrorKind::Corrupt(e.to_string()))?.as_str())?;
    let raw: String = row.try_get("value").map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
    let expires_at: Option<String> = row.try_get("expires_at").map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
    let created_at: String = row.try_get("created_at").map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
    let updated_at: String = row.try_get("updated_at").map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
    Ok(StateEntry {
        key: row.try_get("key").map_err(|e| ErrorKind::Corrupt(e.to_string()))?,
        value: decode_value(kind, &raw)?,
        kind,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| ErrorKind::Corrupt(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| ErrorKind::Corrupt(e.to_string()))?
            .with_timezone(&Utc),
        expires_at: expires_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| ErrorKind::Corrupt(e.to_string()))
            })
            .transpose()?,
        version: row
            .try_get::<i64, _>("version")
            .map_err(|e| ErrorKind::Corrupt(e.to_string()))? as u64,
    })
}

/// Runs a `fetch_live` then `upsert` against a single `sqlx::Executor` so
/// the read and the write land in one pool checkout (the plain pool for
/// independent ops, a transaction for read-modify-write ones) and cannot
/// be interleaved by a concurrent caller's own read-modify-write.
async fn fetch_live_with<'c, E>(exec: E, key: &str) -> StoreResult<Option<StateEntry>>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let row = sqlx::query("SELECT * FROM state_data WHERE key = ?")
        .bind(key)
        .fetch_optional(exec)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
    let Some(row) = row else { return Ok(None) };
    let entry = row_to_entry(&row)?;
    if entry.is_expired(Utc::now()) {
        Ok(None)
    } else {
        Ok(Some(entry))
    }
}

async fn upsert_with<'c, E>(exec: E, entry: &StateEntry) -> StoreResult<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO state_data (key, value, kind, created_at, updated_at, expires_at, version)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            kind = excluded.kind,
            updated_at = excluded.updated_at,
            expires_at = excluded.expires_at,
            version = excluded.version
        "#,
    )
    .bind(&entry.key)
    .bind(encode_value(entry.kind, &entry.value))
    .bind(kind_to_str(entry.kind))
    .bind(entry.created_at.to_rfc3339())
    .bind(entry.updated_at.to_rfc3339())
    .bind(entry.expires_at.map(|e| e.to_rfc3339()))
    .bind(entry.version as i64)
    .execute(exec)
    .await
    .map_err(|e| ErrorKind::Io(e.to_string()))?;
    Ok(())
}

impl SqliteStore {
    async fn fetch_live(&self, key: &str) -> StoreResult<Option<StateEntry>> {
        fetch_live_with(&self.pool, key).await
    }

    async fn upsert(&self, entry: &StateEntry) -> StoreResult<()> {
        upsert_with(&self.pool, entry).await
    }

    /// Begins a transaction so a read-modify-write op's `fetch_live` and
    /// `upsert` run as one serialisation point per key, per spec invariant
    /// I4: two concurrent callers on the same key cannot both read the
    /// pre-mutation value and then both write, since the second caller's
    /// transaction blocks on the connection until the first commits.
    async fn read_modify_write<F, Fut, T>(&self, key: &str, f: F) -> StoreResult<T>
    where
        F: FnOnce(Option<StateEntry>) -> Fut,
        Fut: std::future::Future<Output = StoreResult<(T, Option<StateEntry>)>>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        let existing = fetch_live_with(&mut *tx, key).await?;
        let (result, entry) = f(existing).await?;
        if let Some(entry) = entry {
            upsert_with(&mut *tx, &entry).await?;
        }
        tx.commit().await.map_err(|e| ErrorKind::Io(e.to_string()))?;
        Ok(result)
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        let kind = Kind::of(&value)
            .ok_or_else(|| ErrorKind::InvalidValue("cannot store a nil value".to_string()))?;
        let now = Utc::now();
        let existing = self.fetch_live(key).await?;
        let entry = StateEntry {
            key: key.to_string(),
            value,
            kind,
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
            expires_at: ttl.map(|d| now + chrono::Duration::from_std(d).unwrap_or_default()),
            version: existing.map(|e| e.version + 1).unwrap_or(1),
        };
        self.upsert(&entry).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.fetch_live(key).await?.map(|e| e.value))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM state_data WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.fetch_live(key).await?.is_some())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            "SELECT key FROM state_data WHERE expires_at IS NULL OR expires_at > ? ORDER BY key",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
        let mut matched: Vec<String> = rows
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("key").ok())
            .filter(|key| glob_match::glob_match(pattern, key))
            .collect();
        matched.sort();
        Ok(matched)
    }

    async fn clear(&self, pattern: &str) -> StoreResult<u64> {
        let rows = sqlx::query("SELECT key FROM state_data")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?;
        let mut removed = 0u64;
        for row in rows {
            let key: String = row.try_get("key").map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
            if glob_match::glob_match(pattern, &key) {
                sqlx::query("DELETE FROM state_data WHERE key = ?")
                    .bind(&key)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| ErrorKind::Io(e.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut entry = self
            .fetch_live(key)
            .await?
            .ok_or_else(|| ErrorKind::not_found(key))?;
        let now = Utc::now();
        entry.expires_at = Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
        entry.updated_at = now;
        entry.version += 1;
        self.upsert(&entry).await
    }

    async fn get_ttl(&self, key: &str) -> StoreResult<i64> {
        let Some(entry) = self.fetch_live(key).await? else {
            return Ok(-2);
        };
        match entry.expires_at {
            None => Ok(-1),
            Some(exp) => Ok((exp - Utc::now()).num_seconds().max(0)),
        }
    }

    async fn increment(&self, key: &str, delta: f64) -> StoreResult<f64> {
        self.read_modify_write(key, |existing| async move {
            let new_value = match &existing {
                None => delta,
                Some(entry) => match &entry.value {
                    Value::Number(n) => n + delta,
                    other => {
                        return Err(ErrorKind::TypeMismatch(format!(
                            "key {key} holds {} not a number",
                            other.kind_name()
                        )))
                    }
                },
            };
            let now = Utc::now();
            let entry = StateEntry {
                key: key.to_string(),
                value: Value::Number(new_value),
                kind: Kind::Number,
                created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
                updated_at: now,
                expires_at: None,
                version: existing.map(|e| e.version + 1).unwrap_or(1),
            };
            Ok((new_value, Some(entry)))
        })
        .await
    }

    async fn append(&self, key: &str, s: &str) -> StoreResult<usize> {
        self.read_modify_write(key, |existing| async move {
            let new_value = match &existing {
                None => s.to_string(),
                Some(entry) => match &entry.value {
                    Value::String(existing) => format!("{existing}{s}"),
                    other => {
                        return Err(ErrorKind::TypeMismatch(format!(
                            "key {key} holds {} not a string",
                            other.kind_name()
                        )))
                    }
                },
            };
            let len = new_value.len();
            let now = Utc::now();
            let entry = StateEntry {
                key: key.to_string(),
                value: Value::String(new_value),
                kind: Kind::String,
                created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
                updated_at: now,
                expires_at: None,
                version: existing.map(|e| e.version + 1).unwrap_or(1),
            };
            Ok((len, Some(entry)))
        })
        .await
    }

    async fn list_push(&self, key: &str, value: Value) -> StoreResult<usize> {
        self.read_modify_write(key, |existing| async move {
            let mut list = match &existing {
                None => Vec::new(),
                Some(entry) => match &entry.value {
                    Value::Sequence(items) => items.clone(),
                    other => {
                        return Err(ErrorKind::TypeMismatch(format!(
                            "key {key} holds {} not a list",
                            other.kind_name()
                        )))
                    }
                },
            };
            list.push(value);
            let len = list.len();
            let now = Utc::now();
            let entry = StateEntry {
                key: key.to_string(),
                value: Value::Sequence(list),
                kind: Kind::List,
                created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
                updated_at: now,
                expires_at: None,
                version: existing.map(|e| e.version + 1).unwrap_or(1),
            };
            Ok((len, Some(entry)))
        })
        .await
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<Value>> {
        self.read_modify_write(key, |existing| async move {
            let Some(existing) = existing else {
                return Ok((None, None));
            };
            let mut list = match &existing.value {
                Value::Sequence(items) => items.clone(),
                other => {
                    return Err(ErrorKind::TypeMismatch(format!(
                        "key {key} holds {} not a list",
                        other.kind_name()
                    )))
                }
            };
            let popped = list.pop();
            let now = Utc::now();
            let entry = StateEntry {
                key: key.to_string(),
                value: Value::Sequence(list),
                kind: Kind::List,
                created_at: existing.created_at,
                updated_at: now,
                expires_at: None,
                version: existing.version + 1,
            };
            Ok((popped, Some(entry)))
        })
        .await
    }

    async fn list_length(&self, key: &str) -> StoreResult<usize> {
        match self.fetch_live(key).await? {
            Some(StateEntry {
                value: Value::Sequence(items),
                ..
            }) => Ok(items.len()),
            Some(entry) => Err(ErrorKind::TypeMismatch(format!(
                "key {key} holds {} not a list",
                entry.value.kind_name()
            ))),
            None => Ok(0),
        }
    }

    async fn compare_and_swap(&self, key: &str, old: Value, new: Value) -> StoreResult<bool> {
        let kind = Kind::of(&new)
            .ok_or_else(|| ErrorKind::InvalidValue("cannot store a nil value".to_string()))?;
        self.read_modify_write(key, |existing| async move {
            let matches = match &existing {
                Some(entry) => entry.value.deep_eq(&old),
                None => old == Value::Nil,
            };
            if !matches {
                return Ok((false, None));
            }
            let now = Utc::now();
            let entry = StateEntry {
                key: key.to_string(),
                value: new,
                kind,
                created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
                updated_at: now,
                expires_at: None,
                version: existing.map(|e| e.version + 1).unwrap_or(1),
            };
            Ok((true, Some(entry)))
        })
        .await
    }

    async fn acquire_lock(&self, name: &str, ttl: Duration) -> StoreResult<bool> {
        let deadline = std::time::Instant::now() + ttl;
        loop {
            if self.try_lock(name, ttl).await? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn try_lock(&self, name: &str, ttl: Duration) -> StoreResult<bool> {
        // The guard lives in the `DO UPDATE ... WHERE` clause so the
        // check-and-acquire is one statement: a second caller's INSERT
        // cannot land between this task's read and write the way two
        // separate round-trips could.
        let now = Utc::now();
        let owner = caller_owner();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let result = sqlx::query(
            r#"
            INSERT INTO state_locks (lock_name, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(lock_name) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE state_locks.expires_at <= ? OR state_locks.owner = ?
            "#,
        )
        .bind(name)
        .bind(&owner)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&owner)
        .execute(&self.pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "DELETE FROM state_locks WHERE lock_name = ? AND owner = ? AND expires_at > ?",
        )
        .bind(name)
        .bind(caller_owner())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(ErrorKind::NotHeld(name.to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let now = Utc::now().to_rfc3339();
        let live: i64 = sqlx::query(
            "SELECT COUNT(*) as c FROM state_data WHERE expires_at IS NULL OR expires_at > ?",
        )
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ErrorKind::Io(e.to_string()))?
        .try_get("c")
        .map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
        let total: i64 = sqlx::query("SELECT COUNT(*) as c FROM state_data")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?
            .try_get("c")
            .map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
        let active_locks: i64 = sqlx::query("SELECT COUNT(*) as c FROM state_locks WHERE expires_at > ?")
            .bind(&now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ErrorKind::Io(e.to_string()))?
            .try_get("c")
            .map_err(|e| ErrorKind::Corrupt(e.to_string()))?;
        let storage_bytes = std::fs::metadata(
            self.pool
                .connect_options()
                .get_filename(),
        )
        .map(|m| m.len())
        .unwrap_or(0);
        Ok(StoreStats {
            live_keys: live as u64,
            expired_unswept: (total - live) as u64,
            active_locks: active_locks as u64,
            storage_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("state.db"), false)
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (store, _dir) = temp_store().await;
        store.set("k", Value::from("v"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Value::from("v")));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteStore::open(&path, false).await.unwrap();
            store.set("k", Value::from("v"), None).await.unwrap();
        }
        let reopened = SqliteStore::open(&path, false).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), Some(Value::from("v")));
    }

    #[tokio::test]
    async fn ttl_expiry_hides_key() {
        let (store, _dir) = temp_store().await;
        store
            .set("tmp", Value::from("x"), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists("tmp").await.unwrap());
        assert_eq!(store.get_ttl("tmp").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn increment_rejects_type_mismatch() {
        let (store, _dir) = temp_store().await;
        store.set("k", Value::from("not a number"), None).await.unwrap();
        let result = store.increment("k", 1.0).await;
        assert!(matches!(result, Err(ErrorKind::TypeMismatch(_))));
    }

    #[tokio::test]
    async fn keys_pattern_matches_and_sorts() {
        let (store, _dir) = temp_store().await;
        store.set("task:a", Value::from("1"), None).await.unwrap();
        store.set("task:b", Value::from("2"), None).await.unwrap();
        store.set("other", Value::from("3"), None).await.unwrap();
        let matched = store.keys("task:?").await.unwrap();
        assert_eq!(matched, vec!["task:a".to_string(), "task:b".to_string()]);
    }

    #[tokio::test]
    async fn increment_is_atomic_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            SqliteStore::open(&dir.path().join("state.db"), false)
                .await
                .unwrap(),
        );
        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    store.increment("counter", 1.0).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap(), Some(Value::Number(50.0)));
    }

    #[tokio::test]
    async fn compare_and_swap_contention_resolves_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(
            SqliteStore::open(&dir.path().join("state.db"), false)
                .await
                .unwrap(),
        );
        store.set("k", Value::Number(0.0), None).await.unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .compare_and_swap("k", Value::Number(0.0), Value::from("a"))
                    .await
                    .unwrap()
            })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .compare_and_swap("k", Value::Number(0.0), Value::from("b"))
                    .await
                    .unwrap()
            })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!([a, b].iter().filter(|r| **r).count(), 1);
    }
}
