//! The workflow catalogue model and the scheduler that executes it.

pub mod executor;
pub mod model;

pub use executor::{EchoLocalExecutor, Executor, ExecutorConfig, LocalExecutor, RunReport};
pub use model::{Catalogue, Task, TaskOutcome, TaskStatus, Workflow};
