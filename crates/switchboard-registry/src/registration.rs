use serde::{Deserialize, Serialize};

/// Operational status of a registered worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Ready for work.
    #[default]
    Idle,
    /// Executing at least one task.
    Busy,
    /// Last execution failed.
    Error,
    /// Taken out of service; never selected.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Descriptor for one worker. Metadata only; live instances live in
/// [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    /// Unique id, trimmed on registration.
    pub worker_id: String,
    /// Display name.
    pub name: String,
    /// Free text shown to the model-assisted router.
    pub description: String,
    /// Ordered capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Worker to fail over to. Never the same worker.
    #[serde(default)]
    pub backup_worker_id: Option<String>,
    /// Free-form discovery tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Concurrency limit applied in the pool.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Fields a handoff payload must carry before this worker accepts it.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Current status.
    #[serde(default)]
    pub status: AgentStatus,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

impl AgentRegistration {
    /// Idle registration with no capabilities or backup.
    pub fn new(
        worker_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            name: name.into(),
            description: description.into(),
            capabilities: Vec::new(),
            backup_worker_id: None,
            tags: Vec::new(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            required_fields: Vec::new(),
            status: AgentStatus::Idle,
        }
    }

    /// Set the capability tags.
    pub fn with_capabilities(mut self, caps: &[&str]) -> Self {
        self.capabilities = caps.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Set the failover worker.
    pub fn with_backup(mut self, worker_id: impl Into<String>) -> Self {
        self.backup_worker_id = Some(worker_id.into());
        self
    }

    /// Set the discovery tags.
    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| (*t).to_string()).collect();
        self
    }

    /// Set the concurrency limit.
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n.max(1);
        self
    }

    /// Fields a handoff to this worker must carry.
    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    /// Whether the worker advertises `tag`.
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    /// Routing-facing view.
    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            worker_id: self.worker_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// The routing-facing view of a worker: no internal fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSummary {
    /// Worker id.
    pub worker_id: String,
    /// Display name.
    pub name: String,
    /// Free text for the router.
    pub description: String,
    /// Capability tags.
    pub capabilities: Vec<String>,
}

impl WorkerSummary {
    /// One catalog line for a model prompt.
    pub fn render(&self) -> String {
        if self.capabilities.is_empty() {
            format!("- {} ({}): {}", self.worker_id, self.name, self.description)
        } else {
            format!(
                "- {} ({}): {} [capabilities: {}]",
                self.worker_id,
                self.name,
                self.description,
                self.capabilities.join(", ")
            )
        }
    }
}

/// Render a worker catalog, one worker per line.
pub fn render_catalog(summaries: &[WorkerSummary]) -> String {
    summaries
        .iter()
        .map(WorkerSummary::render)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_capabilities() {
        let reg = AgentRegistration::new("crm", "CRM Agent", "Updates deals")
            .with_capabilities(&["crm_update", "deal_lookup"])
            .with_backup("crm-lite")
            .with_max_concurrent(0);
        assert!(reg.has_capability("deal_lookup"));
        assert!(!reg.has_capability("email"));
        assert_eq!(reg.backup_worker_id.as_deref(), Some("crm-lite"));
        assert_eq!(reg.max_concurrent_tasks, 1);
    }

    #[test]
    fn test_catalog_render() {
        let a = AgentRegistration::new("mailer", "Mailer", "Sends email").with_capabilities(&["email"]);
        let b = AgentRegistration::new("notes", "Notes", "Writes notes");
        let text = render_catalog(&[a.summary(), b.summary()]);
        assert_eq!(
            text,
            "- mailer (Mailer): Sends email [capabilities: email]\n- notes (Notes): Writes notes"
        );
    }

    #[test]
    fn test_registration_deserialize_defaults() {
        let reg: AgentRegistration = serde_json::from_str(
            r#"{"worker_id":"w","name":"W","description":"d"}"#,
        )
        .unwrap();
        assert_eq!(reg.status, AgentStatus::Idle);
        assert_eq!(reg.max_concurrent_tasks, 4);
        assert!(reg.required_fields.is_empty());
    }
}
