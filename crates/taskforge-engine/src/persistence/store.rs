//! The store trait and its shared value types.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ErrorKind;
use crate::value::Value;

/// Alias used by every store backend so call sites read the same as the
/// rest of the crate.
pub type StoreResult<T> = Result<T, ErrorKind>;

/// Identifies the logical caller for lock ownership, scoped to the current
/// async task rather than the store instance: two `tokio::spawn`ed tasks
/// sharing one `Arc<dyn Store>` must be treated as distinct lock owners, or
/// `acquire_lock`/`try_lock` would never block a second caller routed
/// through the same store. Falls back to the OS thread id when called
/// outside a spawned task (e.g. directly inside a `#[tokio::main]`/
/// `#[tokio::test]` body), which `tokio::task::id()` does not cover.
pub fn caller_owner() -> String {
    match tokio::task::try_id() {
        Some(id) => format!("task:{id:?}"),
        None => format!("thread:{:?}", std::thread::current().id()),
    }
}

/// The discriminated kind of a stored entry, tracked alongside its value so
/// atomic operations can reject a mismatched kind without inspecting the
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    String,
    Number,
    Boolean,
    List,
    Map,
}

impl Kind {
    pub fn of(value: &Value) -> Option<Kind> {
        match value {
            Value::Nil => None,
            Value::String(_) => Some(Kind::String),
            Value::Number(_) => Some(Kind::Number),
            Value::Boolean(_) => Some(Kind::Boolean),
            Value::Sequence(_) => Some(Kind::List),
            Value::Map(_) => Some(Kind::Map),
        }
    }
}

/// A single entry as retained by a store backend.
#[derive(Debug, Clone)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub kind: Kind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl StateEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

/// Snapshot returned by [`Store::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    pub live_keys: u64,
    pub expired_unswept: u64,
    pub active_locks: u64,
    pub storage_bytes: u64,
}

/// The durable key/value substrate backing the `state.*` script bindings.
///
/// Implementations must serialise all atomic operations (`increment`,
/// `append`, `list_push`/`list_pop`, `compare_and_swap`) on a key under a
/// single point so concurrent mutations never interleave. Every writer
/// bumps `version`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Live keys matching `pattern` (`*` any run, `?` one character,
    /// anchored full-match), lexicographically ordered.
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Removes matching live and expired entries, returning the count removed.
    async fn clear(&self, pattern: &str) -> StoreResult<u64>;

    async fn set_ttl(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Remaining seconds; `-1` means no expiry set, `-2` means absent.
    async fn get_ttl(&self, key: &str) -> StoreResult<i64>;

    /// Atomic; absent key treated as `0`. Fails [`ErrorKind::TypeMismatch`]
    /// if the existing value is not a number.
    async fn increment(&self, key: &str, delta: f64) -> StoreResult<f64>;

    /// Atomic; absent key treated as `""`. Returns the new length.
    async fn append(&self, key: &str, s: &str) -> StoreResult<usize>;

    /// Atomic append to a list; absent key treated as an empty list.
    async fn list_push(&self, key: &str, value: Value) -> StoreResult<usize>;

    /// Atomic remove-last; returns `None` if the list is empty or absent.
    async fn list_pop(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn list_length(&self, key: &str) -> StoreResult<usize>;

    /// Deep-equality compare-and-swap.
    async fn compare_and_swap(&self, key: &str, old: Value, new: Value) -> StoreResult<bool>;

    /// Blocks polling for up to `ttl` waiting for the lock to free; the
    /// acquired lock itself then also expires after `ttl`.
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> StoreResult<bool>;

    /// Non-blocking variant of [`Store::acquire_lock`].
    async fn try_lock(&self, name: &str, ttl: Duration) -> StoreResult<bool>;

    /// Fails [`ErrorKind::NotHeld`] unless this store instance is the
    /// recorded, non-expired owner.
    async fn release_lock(&self, name: &str) -> StoreResult<()>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}

/// Acquires `name`, runs `f`, and releases on every exit path, including
/// when `f` returns an error.
pub async fn with_lock<S, F, Fut, T>(store: &S, name: &str, ttl: Duration, f: F) -> StoreResult<T>
where
    S: Store + ?Sized,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    if !store.acquire_lock(name, ttl).await? {
        return Err(ErrorKind::Busy(name.to_string()));
    }
    let result = f().await;
    if let Err(release_err) = store.release_lock(name).await {
        tracing::warn!(lock = name, error = %release_err, "failed to release lock after with_lock body");
    }
    result
}
