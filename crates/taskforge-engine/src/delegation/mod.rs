//! The agent delegation fabric: routes a callable unit to a named target
//! and surfaces a structured result or error.

pub mod fabric;

pub use fabric::{AgentClient, AgentError, DelegationFabric};
