use crate::task::ErrorClass;
use thiserror::Error;

/// A convenience `Result` alias using [`SwitchboardError`].
pub type SwitchboardResult<T> = Result<T, SwitchboardError>;

/// Top-level error type for the Switchboard orchestration core.
///
/// Each variant corresponds to a subsystem (or a failure class) that can
/// produce errors. Callers of the supervisor never see these directly: they
/// are folded into a failed `TaskResult` carrying an [`ErrorClass`].
#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// An event was published to a bus bound to a different tenant.
    #[error("Tenant mismatch: bus is bound to '{expected}', event belongs to '{actual}'")]
    TenantMismatch {
        /// Tenant the bus is bound to.
        expected: String,
        /// Tenant carried by the rejected event.
        actual: String,
    },

    /// An event violates its own invariants or cannot be decoded.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// The durable log transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A registry operation was rejected (duplicate id, backup cycle, ...).
    #[error("Registry error: {0}")]
    Registry(String),

    /// No worker with this id is known.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// A worker was asked to run a task type it does not implement.
    #[error("Worker '{worker_id}' does not handle task type '{task_type}'")]
    UnknownTaskType {
        /// Worker that refused the task.
        worker_id: String,
        /// The unrecognised task type.
        task_type: String,
    },

    /// A worker failed while executing a task.
    #[error("Worker error: {0}")]
    Worker(String),

    /// No worker could be selected for a task.
    #[error("Routing error: {0}")]
    Routing(String),

    /// A handoff payload failed validation.
    #[error("Handoff rejected: {}", reasons.join("; "))]
    HandoffRejected {
        /// Every reason the validator produced, in stage order.
        reasons: Vec<String>,
    },

    /// Context compilation or a context store failed.
    #[error("Context error: {0}")]
    Context(String),

    /// The completion service failed or returned unusable output.
    #[error("Completion error: {0}")]
    Completion(String),

    /// An outbound HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// An operation exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The task (or subtask) was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchboardError {
    /// Whether this is a transient infrastructure error worth retrying.
    ///
    /// Covers transport failures, timeouts, and HTTP rate-limit / server
    /// errors. Client errors (HTTP 400) are never retryable.
    pub fn is_transient(&self) -> bool {
        match self {
            SwitchboardError::Transport(_) | SwitchboardError::Timeout(_) => true,
            SwitchboardError::Io(_) => true,
            SwitchboardError::Http(msg) | SwitchboardError::Completion(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("400") {
                    return false;
                }
                lower.contains("429")
                    || lower.contains("timeout")
                    || lower.contains("timed out")
                    || lower.contains("500")
                    || lower.contains("502")
                    || lower.contains("503")
                    || lower.contains("504")
                    || lower.contains("connection")
            }
            _ => false,
        }
    }

    /// Failure classification reported on a failed task result.
    pub fn class(&self) -> ErrorClass {
        match self {
            SwitchboardError::UnknownTaskType { .. } => ErrorClass::UnknownTaskType,
            SwitchboardError::Worker(_) | SwitchboardError::WorkerNotFound(_) => {
                ErrorClass::WorkerFailure
            }
            SwitchboardError::Routing(_) => ErrorClass::RoutingFailed,
            SwitchboardError::HandoffRejected { .. } => ErrorClass::HandoffRejected,
            SwitchboardError::Cancelled(_) => ErrorClass::Cancelled,
            SwitchboardError::Timeout(_) => ErrorClass::Timeout,
            SwitchboardError::TenantMismatch { .. } => ErrorClass::TenantViolation,
            SwitchboardError::Transport(_)
            | SwitchboardError::Http(_)
            | SwitchboardError::Completion(_)
            | SwitchboardError::Io(_) => ErrorClass::Infrastructure,
            SwitchboardError::InvalidEvent(_)
            | SwitchboardError::Registry(_)
            | SwitchboardError::Context(_)
            | SwitchboardError::Config(_)
            | SwitchboardError::Json(_) => ErrorClass::Internal,
        }
    }
}
