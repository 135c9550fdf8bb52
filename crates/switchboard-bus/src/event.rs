use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::{SwitchboardError, SwitchboardResult, TenantId};
use uuid::Uuid;

/// Current event schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Event kind constants following the format `<category>.<action>`.
pub struct EventKind;

impl EventKind {
    // Task lifecycle
    /// A task entered the supervisor.
    pub const TASK_RECEIVED: &str = "task.received";
    /// A (sub)task was assigned a worker.
    pub const TASK_ROUTED: &str = "task.routed";
    /// The supervisor produced a final result.
    pub const TASK_COMPLETED: &str = "task.completed";
    /// The supervisor gave up on a task.
    pub const TASK_FAILED: &str = "task.failed";
    /// The caller cancelled a task.
    pub const TASK_CANCELLED: &str = "task.cancelled";

    // Handoffs
    /// A worker asked to hand work to another.
    pub const HANDOFF_REQUESTED: &str = "handoff.requested";
    /// A handoff passed validation.
    pub const HANDOFF_ACCEPTED: &str = "handoff.accepted";
    /// A handoff failed validation.
    pub const HANDOFF_REJECTED: &str = "handoff.rejected";

    // Workers
    /// A worker attempt failed.
    pub const WORKER_FAILED: &str = "worker.failed";
    /// Work moved to a backup worker.
    pub const WORKER_FAILOVER: &str = "worker.failover";
    /// A worker's registry status changed.
    pub const WORKER_STATUS_CHANGED: &str = "worker.status_changed";
}

/// Delivery priority hint carried by an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Ahead of normal traffic.
    High,
    /// Needs attention now.
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(SwitchboardError::InvalidEvent(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Reference to a payload too large to travel inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    /// Storage location (object key, URL, file path).
    pub uri: String,
    /// MIME type, when known.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Size of the referenced payload.
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// An immutable record of a cross-worker occurrence.
///
/// Construct with [`Event::new`] and the `with_*` builders, then publish it.
/// Once published an event is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: Uuid,
    /// Envelope version; bumped on incompatible changes.
    pub schema_version: u32,
    /// One of the [`EventKind`] constants, or a custom kind.
    pub kind: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Owning tenant; must match the bus it is published on.
    pub tenant_id: TenantId,
    /// Delivery priority hint.
    pub priority: Priority,
    /// Worker that emitted the event.
    pub source_worker_id: String,
    /// Worker ids that produced this event, oldest first.
    pub call_chain: Vec<String>,
    /// Inline body.
    pub payload: serde_json::Value,
    /// Out-of-line bodies.
    pub payload_refs: Vec<PayloadRef>,
    /// Groups the events of one request.
    pub correlation_id: Option<String>,
    /// Event this one was caused by.
    pub parent_event_id: Option<Uuid>,
}

impl Event {
    /// Create an event whose call chain is just its source worker.
    pub fn new(
        tenant_id: TenantId,
        kind: impl Into<String>,
        source_worker_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let source = source_worker_id.into();
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            kind: kind.into(),
            created_at: Utc::now(),
            tenant_id,
            priority: Priority::Normal,
            call_chain: vec![source.clone()],
            source_worker_id: source,
            payload,
            payload_refs: Vec::new(),
            correlation_id: None,
            parent_event_id: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the call chain. The source worker must still appear in it.
    pub fn with_call_chain(mut self, chain: Vec<String>) -> Self {
        self.call_chain = chain;
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Link to a causing event, inheriting its correlation id when none is set.
    pub fn with_parent(mut self, parent: &Event) -> Self {
        self.parent_event_id = Some(parent.id);
        if self.correlation_id.is_none() {
            self.correlation_id = parent.correlation_id.clone();
        }
        self
    }

    /// Attach a reference to an out-of-line payload.
    pub fn with_payload_ref(mut self, payload_ref: PayloadRef) -> Self {
        self.payload_refs.push(payload_ref);
        self
    }

    /// Check the event's own invariants.
    pub fn validate(&self) -> SwitchboardResult<()> {
        if self.kind.trim().is_empty() {
            return Err(SwitchboardError::InvalidEvent("event kind is empty".into()));
        }
        if self.source_worker_id.trim().is_empty() {
            return Err(SwitchboardError::InvalidEvent(
                "source worker id is empty".into(),
            ));
        }
        if !self.call_chain.iter().any(|w| w == &self.source_worker_id) {
            return Err(SwitchboardError::InvalidEvent(format!(
                "source worker '{}' is not in call chain [{}]",
                self.source_worker_id,
                self.call_chain.join(", ")
            )));
        }
        Ok(())
    }
}
