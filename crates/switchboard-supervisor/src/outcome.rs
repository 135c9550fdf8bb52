use crate::state::{TaskState, Transition};
use switchboard_core::{ErrorClass, Task, TaskResult, TenantId};
use switchboard_handoff::ValidationOutcome;
use switchboard_router::RoutingDecision;
use uuid::Uuid;

/// What happened to one subtask (or to the whole task when it was not
/// decomposed).
#[derive(Debug, Clone)]
pub struct SubtaskReport {
    /// Position in the plan.
    pub index: usize,
    /// Child task id.
    pub task_id: Uuid,
    /// Task type.
    pub task_type: String,
    /// Plan indices this subtask waited for.
    pub depends_on: Vec<usize>,
    /// Routing decision, when routing succeeded.
    pub routing: Option<RoutingDecision>,
    /// Workers that executed this subtask, in order: the routed worker and
    /// at most one backup.
    pub attempts: Vec<String>,
    /// Validation of the handoff carrying the worker result, when one was checked.
    pub handoff: Option<ValidationOutcome>,
    /// Final result.
    pub result: TaskResult,
}

impl SubtaskReport {
    pub(crate) fn new(index: usize, task: &Task, depends_on: &[usize]) -> Self {
        Self {
            index,
            task_id: task.id,
            task_type: task.task_type.clone(),
            depends_on: depends_on.to_vec(),
            routing: None,
            attempts: Vec::new(),
            handoff: None,
            result: TaskResult::failure(ErrorClass::Internal, "not executed"),
        }
    }

    /// Worker whose result this report carries.
    pub fn worker_id(&self) -> Option<&str> {
        self.attempts.last().map(String::as_str)
    }

    /// Whether the final result is not an error.
    pub fn succeeded(&self) -> bool {
        !self.result.is_error()
    }

    /// Whether a backup ran.
    pub fn failed_over(&self) -> bool {
        self.attempts.len() > 1
    }
}

/// Final outcome of a supervised task. Failures are carried in `result`;
/// the supervisor never returns an error to its caller.
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    /// Top-level task id.
    pub task_id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Terminal state.
    pub state: TaskState,
    /// Final result.
    pub result: TaskResult,
    /// One report per executed subtask.
    pub subtasks: Vec<SubtaskReport>,
    /// A synthesis step merged more than one subtask result.
    pub synthesized: bool,
    /// State history.
    pub transitions: Vec<Transition>,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

impl SupervisorOutcome {
    /// Whether the task reached `Done`.
    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }

    /// States visited, in order.
    pub fn states(&self) -> Vec<TaskState> {
        self.transitions.iter().map(|t| t.state).collect()
    }

    /// Text for the session history: the merged response, the worker's own
    /// summary, or the failure message.
    pub fn response_text(&self) -> String {
        response_text(&self.result)
    }
}

pub(crate) fn response_text(result: &TaskResult) -> String {
    if let Some(failure) = &result.error {
        return format!("failed ({}): {}", failure.class, failure.message);
    }
    for key in ["response", "summary", "message"] {
        if let Some(text) = result.data.get(key).and_then(|v| v.as_str()) {
            return text.to_string();
        }
    }
    match &result.data {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
