//! The persistent state subsystem backing the `state.*` script bindings.

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use store::{with_lock, Kind, StateEntry, Store, StoreResult, StoreStats};

/// Store operations produce the crate-wide [`crate::error::ErrorKind`]
/// directly; this alias exists for call sites that read more naturally
/// spelling out `StoreError`.
pub type StoreError = crate::error::ErrorKind;
