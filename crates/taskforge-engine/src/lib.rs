//! Embedded-script-driven workflow model, scheduler, persistent state store,
//! and agent delegation fabric.
//!
//! A script (Lua, run via `mlua`) declares a catalogue of workflows and
//! tasks; the executor runs them in dependency order against a durable
//! key/value store and an agent delegation fabric, emitting traces and
//! metrics as it goes.

pub mod delegation;
pub mod engine;
pub mod error;
pub mod observability;
pub mod persistence;
pub mod reliability;
pub mod script;
pub mod value;

/// Re-exports for the common entry points.
pub mod prelude {
    pub use crate::delegation::{AgentClient, AgentError, DelegationFabric};
    pub use crate::engine::{Catalogue, Executor, ExecutorConfig, Task, TaskOutcome, Workflow};
    pub use crate::error::{ErrorKind, Result};
    pub use crate::observability::Observability;
    pub use crate::persistence::{Store, StoreError};
    pub use crate::script::parser::WorkflowParser;
    pub use crate::value::Value;
}

pub use error::{ErrorKind, Result};
pub use value::Value;
