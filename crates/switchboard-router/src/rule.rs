use std::fmt;
use std::sync::Arc;
use switchboard_core::{RuleConfig, SwitchboardError, SwitchboardResult, Task};

/// Pure predicate over task fields.
pub type TaskPredicate = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// A deterministic routing rule. Rules are evaluated in order and the first
/// match wins.
#[derive(Clone)]
pub struct RoutingRule {
    /// Rule name, for logs and decisions.
    pub name: String,
    /// Worker the rule routes to.
    pub worker_id: String,
    predicate: TaskPredicate,
}

impl RoutingRule {
    /// Rule from an arbitrary predicate.
    pub fn new(
        name: impl Into<String>,
        worker_id: impl Into<String>,
        predicate: impl Fn(&Task) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            worker_id: worker_id.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Match on `task.task_type`.
    pub fn for_task_type(task_type: impl Into<String>, worker_id: impl Into<String>) -> Self {
        let task_type = task_type.into();
        let name = format!("task_type={task_type}");
        Self::new(name, worker_id, move |task| task.task_type == task_type)
    }

    /// Match when a parameter equals a value.
    pub fn when_param(
        param: impl Into<String>,
        equals: serde_json::Value,
        worker_id: impl Into<String>,
    ) -> Self {
        let param = param.into();
        let name = format!("{param}={equals}");
        Self::new(name, worker_id, move |task| task.params.get(&param) == Some(&equals))
    }

    /// Build a rule from configuration. Every condition that is set must
    /// match; a parameter without `equals` only has to be present.
    pub fn from_config(config: &RuleConfig) -> SwitchboardResult<Self> {
        if config.worker_id.trim().is_empty() {
            return Err(SwitchboardError::Config("routing rule has an empty worker_id".into()));
        }
        if config.task_type.is_none() && config.param.is_none() {
            return Err(SwitchboardError::Config(format!(
                "routing rule for '{}' has no condition",
                config.worker_id
            )));
        }

        let task_type = config.task_type.clone();
        let param = config.param.clone();
        let equals = config.equals.clone();
        let name = config.name.clone().unwrap_or_else(|| {
            let mut parts = Vec::new();
            if let Some(t) = &task_type {
                parts.push(format!("task_type={t}"));
            }
            if let Some(p) = &param {
                match &equals {
                    Some(v) => parts.push(format!("{p}={v}")),
                    None => parts.push(format!("has {p}")),
                }
            }
            parts.join(" & ")
        });

        Ok(Self::new(name, config.worker_id.clone(), move |task| {
            if let Some(t) = &task_type {
                if &task.task_type != t {
                    return false;
                }
            }
            if let Some(p) = &param {
                match (task.params.get(p), &equals) {
                    (None, _) => return false,
                    (Some(actual), Some(expected)) if actual != expected => return false,
                    _ => {}
                }
            }
            true
        }))
    }

    /// Whether the rule applies to `task`.
    pub fn matches(&self, task: &Task) -> bool {
        (self.predicate)(task)
    }
}

impl fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRule")
            .field("name", &self.name)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}
