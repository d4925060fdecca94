/// Shared error type used across all gambit crates.
///
/// Variants follow the runtime's semantic error kinds rather than the
/// originating module: validation, permission, guardrail, policy,
/// cancellation, and model-protocol violations each get their own arm so
/// callers can branch on the kind without string matching.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    HostUnsupported(HostUnsupported),

    /// Trust-boundary violation (e.g. a workspace import map remapping the
    /// reserved schema namespace).
    #[error("trust boundary violation: {0}")]
    Policy(String),

    #[error("{0}")]
    Guardrail(Guardrail),

    /// The run was aborted through its cancellation signal. Distinct from
    /// timeouts and operational failures; test with [`is_run_canceled`].
    #[error("run canceled")]
    Canceled,

    /// Fatal model contract violation (e.g. `tool_calls` finish reason with
    /// no tool calls attached).
    #[error("model protocol violation: {0}")]
    Protocol(String),

    #[error("worker bridge: {0}")]
    Worker(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Host capabilities the runtime depends on but cannot provide itself.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostUnsupported {
    #[error("worker_sandbox_unsupported_host")]
    WorkerSandbox,

    /// The sandbox bridge predates signal support; a run that supplies both
    /// a worker sandbox and a cancellation signal is refused at entry.
    #[error("worker_sandbox_signal_unsupported")]
    WorkerSandboxSignal,

    #[error("exec_unsupported_host")]
    Exec,
}

/// Guardrail exhaustion.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guardrail {
    #[error("Timeout exceeded")]
    Timeout,

    #[error("Max depth {0} exceeded")]
    MaxDepth(u32),

    #[error("Max passes exceeded without completing")]
    MaxPasses,
}

/// True when the error represents cooperative cancellation rather than an
/// operational failure.
pub fn is_run_canceled(err: &RunError) -> bool {
    matches!(err, RunError::Canceled)
}

pub type Result<T> = std::result::Result<T, RunError>;
