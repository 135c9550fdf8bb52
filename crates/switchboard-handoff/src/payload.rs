use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::TenantId;
use uuid::Uuid;

/// Structured data passed from one worker (or the supervisor) to another.
///
/// Invariants checked by the structural stage: the source is already in
/// `call_chain`, the target is not, and the chain holds no duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffPayload {
    /// Handoff id.
    pub id: Uuid,
    /// Raw tenant id; validated rather than trusted.
    pub tenant_id: String,
    /// Worker handing the data over.
    pub source_worker_id: String,
    /// Worker receiving it.
    pub target_worker_id: String,
    /// Workers that contributed to this data, in causal order.
    pub call_chain: Vec<String>,
    /// Selects the strictness (`critical_business_data`, `status_update`, ...).
    pub handoff_type: String,
    /// The business payload being passed on.
    pub data: serde_json::Value,
    /// Source confidence in `[0, 1]`.
    pub confidence: f32,
    /// Task the handoff belongs to, if any.
    #[serde(default)]
    pub task_id: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl HandoffPayload {
    /// Payload whose call chain starts with the source.
    pub fn new(
        tenant: &TenantId,
        source: impl Into<String>,
        target: impl Into<String>,
        handoff_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let source = source.into();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            call_chain: vec![source.clone()],
            source_worker_id: source,
            target_worker_id: target.into(),
            handoff_type: handoff_type.into(),
            data,
            confidence: 1.0,
            task_id: None,
            created_at: Utc::now(),
        }
    }

    /// Replace the call chain.
    pub fn with_call_chain(mut self, chain: Vec<String>) -> Self {
        self.call_chain = chain;
        self
    }

    /// Set the confidence.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Tie the handoff to a task.
    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Every scalar leaf of `data` as a `path: value` line. These are the
    /// claims the semantic stage checks.
    pub fn claims(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_claims("", &self.data, &mut out);
        out
    }
}

fn collect_claims(path: &str, value: &serde_json::Value, out: &mut Vec<String>) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                collect_claims(&child, v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                collect_claims(&format!("{path}[{i}]"), v, out);
            }
        }
        Value::Null => {}
        Value::String(s) if s.trim().is_empty() => {}
        Value::String(s) => out.push(format!("{path}: {s}")),
        other => out.push(format!("{path}: {other}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_seeds_chain_with_source() {
        let p = HandoffPayload::new(
            &TenantId::new("t1").unwrap(),
            "research",
            "mailer",
            "status_update",
            serde_json::json!({}),
        );
        assert_eq!(p.call_chain, vec!["research".to_string()]);
        assert_eq!(p.tenant_id, "t1");
    }

    #[test]
    fn test_claims_flatten_nested_data() {
        let p = HandoffPayload::new(
            &TenantId::new("t1").unwrap(),
            "crm",
            "supervisor",
            "critical_business_data",
            serde_json::json!({
                "deal": {"stage": "negotiation", "value": 42000},
                "contacts": ["Dana", ""],
                "note": null
            }),
        );
        let mut claims = p.claims();
        claims.sort();
        assert_eq!(
            claims,
            vec![
                "contacts[0]: Dana".to_string(),
                "deal.stage: negotiation".to_string(),
                "deal.value: 42000".to_string(),
            ]
        );
    }
}
