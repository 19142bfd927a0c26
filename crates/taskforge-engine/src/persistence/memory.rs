//! In-memory store backend, used by tests and as a reference implementation
//! of the serialisation rules every other backend must uphold.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::error::ErrorKind;
use crate::value::Value;

use super::store::{caller_owner, Kind, Store, StateEntry, StoreResult, StoreStats};

struct LockRecord {
    owner: String,
    // Mirrors the `state_locks.acquired_at` column so the in-memory and
    // sqlite backends carry the same shape; not read by this backend.
    #[allow(dead_code)]
    acquired_at: chrono::DateTime<Utc>,
    expires_at: chrono::DateTime<Utc>,
}

/// A `parking_lot::RwLock`-guarded in-process store, backed by a single
/// guarded map rather than per-key locks.
pub struct InMemoryStore {
    data: RwLock<HashMap<String, StateEntry>>,
    locks: RwLock<HashMap<String, LockRecord>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Removes expired entries and locks; returns the number of entries removed.
    pub fn sweep(&self) -> u64 {
        let now = Utc::now();
        let mut removed = 0u64;
        {
            let mut data = self.data.write();
            data.retain(|_, entry| {
                let keep = !entry.is_expired(now);
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        {
            let mut locks = self.locks.write();
            locks.retain(|_, lock| lock.expires_at > now);
        }
        removed
    }

    fn live(&self, key: &str) -> Option<StateEntry> {
        let data = self.data.read();
        let entry = data.get(key)?;
        if entry.is_expired(Utc::now()) {
            None
        } else {
            Some(entry.clone())
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()> {
        let kind = Kind::of(&value).ok_or_else(|| {
            ErrorKind::InvalidValue("cannot store a nil value".to_string())
        })?;
        let now = Utc::now();
        let mut data = self.data.write();
        let version = data.get(key).map(|e| e.version + 1).unwrap_or(1);
        let created_at = data.get(key).map(|e| e.created_at).unwrap_or(now);
        data.insert(
            key.to_string(),
            StateEntry {
                key: key.to_string(),
                value,
                kind,
                created_at,
                updated_at: now,
                expires_at: ttl.map(|d| now + chrono::Duration::from_std(d).unwrap_or_default()),
                version,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.live(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = Utc::now();
        let data = self.data.read();
        let mut matched: Vec<String> = data
            .values()
            .filter(|e| !e.is_expired(now) && glob_match::glob_match(pattern, &e.key))
            .map(|e| e.key.clone())
            .collect();
        matched.sort();
        Ok(matched)
    }

    async fn clear(&self, pattern: &str) -> StoreResult<u64> {
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|key, _| !glob_match::glob_match(pattern, key));
        Ok((before - data.len()) as u64)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut data = self.data.write();
        let entry = data
            .get_mut(key)
            .ok_or_else(|| ErrorKind::not_found(key))?;
        let now = Utc::now();
        entry.expires_at = Some(now + chrono::Duration::from_std(ttl).unwrap_or_default());
        entry.updated_at = now;
        entry.version += 1;
        Ok(())
    }

    async fn get_ttl(&self, key: &str) -> StoreResult<i64> {
        let Some(entry) = self.live(key) else {
            return Ok(-2);
        };
        match entry.expires_at {
            None => Ok(-1),
            Some(exp) => Ok((exp - Utc::now()).num_seconds().max(0)),
        }
    }

    async fn increment(&self, key: &str, delta: f64) -> StoreResult<f64> {
        let mut data = self.data.write();
        let now = Utc::now();
        let new_value = match data.get(key) {
            None => delta,
            Some(entry) if entry.is_expired(now) => delta,
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
        let created_at = data.get(key).map(|e| e.created_at).unwrap_or(now);
        let version = data.get(key).map(|e| e.version + 1).unwrap_or(1);
        data.insert(
            key.to_string(),
            StateEntry {
                key: key.to_string(),
                value: Value::Number(new_value),
                kind: Kind::Number,
                created_at,
                updated_at: now,
                expires_at: None,
                version,
            },
        );
        Ok(new_value)
    }

    async fn append(&self, key: &str, s: &str) -> StoreResult<usize> {
        let mut data = self.data.write();
        let now = Utc::now();
        let new_value = match data.get(key) {
            None => s.to_string(),
            Some(entry) if entry.is_expired(now) => s.to_string(),
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
        let created_at = data.get(key).map(|e| e.created_at).unwrap_or(now);
        let version = data.get(key).map(|e| e.version + 1).unwrap_or(1);
        data.insert(
            key.to_string(),
            StateEntry {
                key: key.to_string(),
                value: Value::String(new_value),
                kind: Kind::String,
                created_at,
                updated_at: now,
                expires_at: None,
                version,
            },
        );
        Ok(len)
    }

    async fn list_push(&self, key: &str, value: Value) -> StoreResult<usize> {
        let mut data = self.data.write();
        let now = Utc::now();
        let mut list = match data.get(key) {
            None => Vec::new(),
            Some(entry) if entry.is_expired(now) => Vec::new(),
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
        let created_at = data.get(key).map(|e| e.created_at).unwrap_or(now);
        let version = data.get(key).map(|e| e.version + 1).unwrap_or(1);
        data.insert(
            key.to_string(),
            StateEntry {
                key: key.to_string(),
                value: Value::Sequence(list),
                kind: Kind::List,
                created_at,
                updated_at: now,
                expires_at: None,
                version,
            },
        );
        Ok(len)
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<Value>> {
        let mut data = self.data.write();
        let now = Utc::now();
        let Some(entry) = data.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            return Ok(None);
        }
        let mut list = match &entry.value {
            Value::Sequence(items) => items.clone(),
            other => {
                return Err(ErrorKind::TypeMismatch(format!(
                    "key {key} holds {} not a list",
                    other.kind_name()
                )))
            }
        };
        let popped = list.pop();
        let created_at = entry.created_at;
        let version = entry.version + 1;
        data.insert(
            key.to_string(),
            StateEntry {
                key: key.to_string(),
                value: Value::Sequence(list),
                kind: Kind::List,
                created_at,
                updated_at: now,
                expires_at: None,
                version,
            },
        );
        Ok(popped)
    }

    async fn list_length(&self, key: &str) -> StoreResult<usize> {
        match self.live(key) {
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
        let mut data = self.data.write();
        let now = Utc::now();
        let matches = match data.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.value.deep_eq(&old),
            _ => old == Value::Nil,
        };
        if !matches {
            return Ok(false);
        }
        let created_at = data.get(key).map(|e| e.created_at).unwrap_or(now);
        let version = data.get(key).map(|e| e.version + 1).unwrap_or(1);
        data.insert(
            key.to_string(),
            StateEntry {
                key: key.to_string(),
                value: new,
                kind,
                created_at,
                updated_at: now,
                expires_at: None,
                version,
            },
        );
        Ok(true)
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
        let owner = caller_owner();
        let now = Utc::now();
        let mut locks = self.locks.write();
        if let Some(existing) = locks.get(name) {
            if existing.expires_at > now && existing.owner != owner {
                return Ok(false);
            }
        }
        locks.insert(
            name.to_string(),
            LockRecord {
                owner,
                acquired_at: now,
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, name: &str) -> StoreResult<()> {
        let owner = caller_owner();
        let now = Utc::now();
        let mut locks = self.locks.write();
        match locks.get(name) {
            Some(lock) if lock.expires_at > now && lock.owner == owner => {
                locks.remove(name);
                Ok(())
            }
            _ => Err(ErrorKind::NotHeld(name.to_string())),
        }
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let now = Utc::now();
        let data = self.data.read();
        let locks = self.locks.read();
        let live_keys = data.values().filter(|e| !e.is_expired(now)).count() as u64;
        let expired_unswept = data.len() as u64 - live_keys;
        Ok(StoreStats {
            live_keys,
            expired_unswept,
            active_locks: locks.values().filter(|l| l.expires_at > now).count() as u64,
            storage_bytes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::with_lock;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryStore::new();
        store.set("k", Value::from("v"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Value::from("v")));
    }

    #[tokio::test]
    async fn delete_clears_existence() {
        let store = InMemoryStore::new();
        store.set("k", Value::from("v"), None).await.unwrap();
        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn increment_is_atomic_under_concurrency() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("counter", 1.0).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(store.get("counter").await.unwrap(), Some(Value::Number(50.0)));
    }

    #[tokio::test]
    async fn second_lock_acquire_fails_while_held() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        assert!(store.try_lock("L", Duration::from_secs(5)).await.unwrap());

        let other = store.clone();
        let acquired_by_other = tokio::spawn(async move {
            other.try_lock("L", Duration::from_secs(5)).await.unwrap()
        })
        .await
        .unwrap();
        assert!(!acquired_by_other);
    }

    #[tokio::test]
    async fn ttl_expiry_hides_key() {
        let store = InMemoryStore::new();
        store
            .set("tmp", Value::from("x"), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.exists("tmp").await.unwrap());
        assert_eq!(store.get_ttl("tmp").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn compare_and_swap_contention_resolves_once() {
        let store = std::sync::Arc::new(InMemoryStore::new());
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
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        let store = InMemoryStore::new();
        let result: StoreResult<()> = with_lock(&store, "L", Duration::from_secs(5), || async {
            Err(ErrorKind::Transient("boom".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert!(store.try_lock("L", Duration::from_secs(5)).await.unwrap());
    }
}
