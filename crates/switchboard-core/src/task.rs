use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of business work submitted to the supervisor or handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique per task; subtasks get their own.
    pub id: Uuid,
    /// Discriminator used by deterministic routing rules and by workers.
    pub task_type: String,
    /// Natural-language request. May be empty for purely structured tasks.
    #[serde(default)]
    pub instruction: String,
    /// Free-form structured parameters.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Owner of the task and of everything it produces.
    pub tenant_id: TenantId,
    /// Explicit target worker; bypasses routing when set.
    #[serde(default)]
    pub target_worker_id: Option<String>,
    /// Parent task id if this is a subtask produced by decomposition.
    #[serde(default)]
    pub parent_task: Option<Uuid>,
}

impl Task {
    /// A task with a fresh id and no instruction or params.
    pub fn new(tenant_id: TenantId, task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            instruction: String::new(),
            params: serde_json::Map::new(),
            tenant_id,
            target_worker_id: None,
            parent_task: None,
        }
    }

    /// Set the natural-language request.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Add one structured parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Pin the task to a worker, skipping rule and model routing.
    pub fn with_target(mut self, worker_id: impl Into<String>) -> Self {
        self.target_worker_id = Some(worker_id.into());
        self
    }

    /// Look up a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Derive a subtask that inherits tenant and parent linkage.
    pub fn subtask(&self, task_type: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            instruction: instruction.into(),
            params: serde_json::Map::new(),
            tenant_id: self.tenant_id.clone(),
            target_worker_id: None,
            parent_task: Some(self.id),
        }
    }
}

/// Outcome status of a task or subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// Completed as asked.
    Success,
    /// Usable, but some part is missing.
    Partial,
    /// Failed; see the attached [`TaskFailure`].
    Error,
}

/// Classification of a failure, distinct from the raw error that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// A worker was given a task type it does not implement.
    UnknownTaskType,
    /// A worker (and its backup, if any) failed.
    WorkerFailure,
    /// No worker could be chosen; routing failed closed.
    RoutingFailed,
    /// The result was rejected by the handoff protocol.
    HandoffRejected,
    /// A dependency of this subtask failed, so it never ran.
    DependencyFailed,
    /// Bus, store or completion-service outage beyond its retry budget.
    Infrastructure,
    /// A worker or model call ran out of time.
    Timeout,
    /// Cancelled by the caller.
    Cancelled,
    /// Data crossed or tried to cross a tenant boundary.
    TenantViolation,
    /// A bug or an unexpected state.
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::UnknownTaskType => "unknown_task_type",
            ErrorClass::WorkerFailure => "worker_failure",
            ErrorClass::RoutingFailed => "routing_failed",
            ErrorClass::HandoffRejected => "handoff_rejected",
            ErrorClass::DependencyFailed => "dependency_failed",
            ErrorClass::Infrastructure => "infrastructure",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::TenantViolation => "tenant_violation",
            ErrorClass::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Failure details attached to an error result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// What kind of failure this was.
    pub class: ErrorClass,
    /// Human-readable cause.
    pub message: String,
}

/// The result envelope returned by workers and by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Whether the work succeeded.
    pub status: ResultStatus,
    /// Structured payload; `null` on failure.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Confidence indicator in `[0, 1]`.
    pub confidence: f32,
    /// Set exactly when `status` is `Error`.
    #[serde(default)]
    pub error: Option<TaskFailure>,
}

impl TaskResult {
    /// A fully successful result.
    pub fn success(data: serde_json::Value, confidence: f32) -> Self {
        Self {
            status: ResultStatus::Success,
            data,
            confidence: confidence.clamp(0.0, 1.0),
            error: None,
        }
    }

    /// A result that is usable but incomplete.
    pub fn partial(data: serde_json::Value, confidence: f32) -> Self {
        Self {
            status: ResultStatus::Partial,
            data,
            confidence: confidence.clamp(0.0, 1.0),
            error: None,
        }
    }

    /// A structured failure.
    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            data: serde_json::Value::Null,
            confidence: 0.0,
            error: Some(TaskFailure {
                class,
                message: message.into(),
            }),
        }
    }

    /// Whether this result is a failure.
    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }

    /// The failure class, if this is an error result.
    pub fn error_class(&self) -> Option<ErrorClass> {
        self.error.as_ref().map(|e| e.class)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new(tenant(), "send_email")
            .with_instruction("send a status email")
            .with_param("to", serde_json::json!("ops@example.com"))
            .with_target("mailer");
        assert_eq!(task.task_type, "send_email");
        assert_eq!(task.param_str("to"), Some("ops@example.com"));
        assert_eq!(task.target_worker_id.as_deref(), Some("mailer"));
        assert!(task.parent_task.is_none());
    }

    #[test]
    fn test_subtask_inherits_tenant_and_parent() {
        let parent = Task::new(tenant(), "composite");
        let child = parent.subtask("send", "send the deck");
        assert_eq!(child.tenant_id, parent.tenant_id);
        assert_eq!(child.parent_task, Some(parent.id));
        assert_ne!(child.id, parent.id);
        assert!(child.target_worker_id.is_none());
    }

    #[test]
    fn test_result_confidence_clamped() {
        let r = TaskResult::success(serde_json::json!({}), 1.7);
        assert_eq!(r.confidence, 1.0);
        let r = TaskResult::partial(serde_json::json!({}), -0.2);
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn test_failure_result() {
        let r = TaskResult::failure(ErrorClass::RoutingFailed, "no worker");
        assert!(r.is_error());
        assert_eq!(r.error_class(), Some(ErrorClass::RoutingFailed));
        assert_eq!(r.confidence, 0.0);
    }

    #[test]
    fn test_result_status_serialization() {
        let json = serde_json::to_string(&ResultStatus::Partial).unwrap();
        assert_eq!(json, "\"partial\"");
        let class = serde_json::to_string(&ErrorClass::HandoffRejected).unwrap();
        assert_eq!(class, "\"handoff_rejected\"");
    }
}
