//! The closed error taxonomy shared by every component.
//!
//! Every component-local error type converts into [`ErrorKind`] at its
//! boundary via `From`.

/// The closed set of error kinds a script or operator can observe.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    /// Script produced a structurally invalid workflow.
    #[error("malformed workflow: {0}")]
    Malformed(String),

    /// Two workflows or tasks share a name in one context.
    #[error("duplicate name: {0}")]
    DuplicateName(String),

    /// Requested workflow not in the catalogue.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Delegation target not registered.
    #[error("unknown delegation target: {0}")]
    UnknownTarget(String),

    /// Transport error contacting a target.
    #[error("target unreachable: {0}")]
    Unreachable(String),

    /// Target reported a non-zero result with detail.
    #[error("remote execution failed: {0}")]
    RemoteFailed(String),

    /// A per-operation deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// External cancellation received.
    #[error("cancelled")]
    Cancelled,

    /// Store key absent where presence required.
    #[error("not found: {0}")]
    NotFound(String),

    /// Atomic op applied to wrong-kind value.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Lock release attempted by non-owner.
    #[error("lock not held: {0}")]
    NotHeld(String),

    /// Lock acquisition timed out.
    #[error("lock busy: {0}")]
    Busy(String),

    /// Value not serialisable by the Value Bridge.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Workflow working directory could not be provisioned.
    #[error("workdir creation failed: {0}")]
    WorkdirCreate(String),

    /// Store-level I/O failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Store-level integrity failure.
    #[error("storage corrupt: {0}")]
    Corrupt(String),

    /// External operation refused at OS/agent boundary.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Catch-all retryable internal error.
    #[error("transient error: {0}")]
    Transient(String),
}

impl ErrorKind {
    /// Whether the scheduler's retry loop should retry an attempt that
    /// failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Unreachable(_) | ErrorKind::DeadlineExceeded | ErrorKind::Transient(_)
        )
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        ErrorKind::NotFound(key.into())
    }

    pub fn unknown_workflow(name: impl Into<String>) -> Self {
        ErrorKind::UnknownWorkflow(name.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ErrorKind>;
