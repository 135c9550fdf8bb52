use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle state of one supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, nothing done yet.
    Received,
    /// Working context built.
    ContextCompiled,
    /// Split into several subtasks.
    Decomposed,
    /// Kept as one task.
    Single,
    /// Workers selected for the current wave.
    Routed,
    /// Workers running.
    Executing,
    /// Checking results before passing them on.
    HandoffValidating,
    /// Merging subtask results.
    Synthesizing,
    /// A single result is used as is.
    DirectResult,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// Stopped by the caller.
    Cancelled,
}

impl TaskState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }

    /// Whether `next` may follow `self`. Any live state may fail or be
    /// cancelled; validation loops back to routing for the next wave.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Received, ContextCompiled)
                | (ContextCompiled, Decomposed | Single)
                | (Decomposed | Single, Routed)
                | (Routed, Executing)
                | (Executing, HandoffValidating)
                | (HandoffValidating, Routed | Synthesizing | DirectResult)
                | (Synthesizing | DirectResult, Done)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Received => "received",
            TaskState::ContextCompiled => "context_compiled",
            TaskState::Decomposed => "decomposed",
            TaskState::Single => "single",
            TaskState::Routed => "routed",
            TaskState::Executing => "executing",
            TaskState::HandoffValidating => "handoff_validating",
            TaskState::Synthesizing => "synthesizing",
            TaskState::DirectResult => "direct_result",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// State entered.
    pub state: TaskState,
    /// When.
    pub at: DateTime<Utc>,
    /// Optional note, such as a failure reason.
    #[serde(default)]
    pub detail: Option<String>,
}

/// Ordered record of a task's state transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTrace {
    /// Traced task.
    pub task_id: Uuid,
    transitions: Vec<Transition>,
}

impl TaskTrace {
    /// Start a trace in [`TaskState::Received`].
    pub fn new(task_id: Uuid) -> Self {
        info!(task_id = %task_id, state = %TaskState::Received, "Task state");
        Self {
            task_id,
            transitions: vec![Transition {
                state: TaskState::Received,
                at: Utc::now(),
                detail: None,
            }],
        }
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.transitions
            .last()
            .map_or(TaskState::Received, |t| t.state)
    }

    /// Move to `next`. Illegal transitions are refused and logged; the
    /// trace keeps its current state.
    pub fn advance(&mut self, next: TaskState, detail: Option<String>) -> bool {
        let from = self.state();
        if !from.can_transition_to(next) {
            warn!(task_id = %self.task_id, %from, to = %next, "Refused illegal state transition");
            return false;
        }
        info!(
            task_id = %self.task_id,
            %from,
            to = %next,
            detail = detail.as_deref().unwrap_or(""),
            "Task state"
        );
        self.transitions.push(Transition {
            state: next,
            at: Utc::now(),
            detail,
        });
        true
    }

    /// All transitions, oldest first.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// States visited, in order.
    pub fn states(&self) -> Vec<TaskState> {
        self.transitions.iter().map(|t| t.state).collect()
    }
}
