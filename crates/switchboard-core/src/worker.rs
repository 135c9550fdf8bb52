use crate::context::WorkingContext;
use crate::error::SwitchboardResult;
use crate::task::{Task, TaskResult};
use async_trait::async_trait;

/// Worker id reserved for the supervisor in call chains and handoffs.
pub const SUPERVISOR_ID: &str = "supervisor";

/// The pluggable business-logic boundary.
///
/// Every worker is invoked through this single method regardless of how it
/// is implemented (in-process, remote, sandboxed). Workers should return
/// `Err(SwitchboardError::UnknownTaskType { .. })` for task types they do
/// not handle, and a `TaskResult::partial` for soft internal failures.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable worker id, matching its registry entry.
    fn id(&self) -> &str;

    /// Execute a task against a compiled working context.
    async fn execute(&self, task: &Task, context: &WorkingContext) -> SwitchboardResult<TaskResult>;
}
