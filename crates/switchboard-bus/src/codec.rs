//! Flat wire format for events.
//!
//! The durable log only stores string-typed fields per entry, so every event
//! is flattened into a `field -> string` map. Scalars are written as-is;
//! nested structures (call chain, payload, payload refs) are JSON-encoded.
//! Fields starting with `_` are delivery metadata owned by the bus and are
//! never part of the event itself.

use crate::event::{Event, PayloadRef};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use switchboard_core::{SwitchboardError, SwitchboardResult, TenantId};
use uuid::Uuid;

/// One transport entry: string keys to string values.
pub type Fields = BTreeMap<String, String>;

/// Retry counter embedded in re-published messages.
pub const RETRY_COUNT_FIELD: &str = "_retry_count";
/// Dead-letter metadata.
pub const DLQ_ERROR_FIELD: &str = "_dlq_error";
/// Retries spent before dead-lettering.
pub const DLQ_RETRY_COUNT_FIELD: &str = "_dlq_retry_count";
/// RFC 3339 failure time.
pub const DLQ_FAILED_AT_FIELD: &str = "_dlq_failed_at";
/// Logical stream the message came from.
pub const DLQ_ORIGINAL_STREAM_FIELD: &str = "_dlq_original_stream";
/// Id the message had on that stream.
pub const DLQ_ORIGINAL_ID_FIELD: &str = "_dlq_original_id";

const METADATA_PREFIX: char = '_';

/// Flatten an event into transport fields.
pub fn encode(event: &Event) -> SwitchboardResult<Fields> {
    let mut fields = Fields::new();
    fields.insert("id".into(), event.id.to_string());
    fields.insert("schema_version".into(), event.schema_version.to_string());
    fields.insert("kind".into(), event.kind.clone());
    fields.insert("created_at".into(), event.created_at.to_rfc3339());
    fields.insert("tenant_id".into(), event.tenant_id.to_string());
    fields.insert("priority".into(), event.priority.to_string());
    fields.insert("source_worker_id".into(), event.source_worker_id.clone());
    fields.insert("call_chain".into(), serde_json::to_string(&event.call_chain)?);
    fields.insert("payload".into(), serde_json::to_string(&event.payload)?);
    fields.insert(
        "payload_refs".into(),
        serde_json::to_string(&event.payload_refs)?,
    );
    if let Some(correlation_id) = &event.correlation_id {
        fields.insert("correlation_id".into(), correlation_id.clone());
    }
    if let Some(parent) = event.parent_event_id {
        fields.insert("parent_event_id".into(), parent.to_string());
    }
    Ok(fields)
}

fn required<'a>(fields: &'a Fields, key: &str) -> SwitchboardResult<&'a str> {
    fields
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| SwitchboardError::InvalidEvent(format!("missing field '{key}'")))
}

fn invalid(key: &str, err: impl std::fmt::Display) -> SwitchboardError {
    SwitchboardError::InvalidEvent(format!("field '{key}': {err}"))
}

/// Rebuild an event from transport fields. Delivery metadata is ignored.
pub fn decode(fields: &Fields) -> SwitchboardResult<Event> {
    let id = Uuid::parse_str(required(fields, "id")?).map_err(|e| invalid("id", e))?;
    let schema_version = required(fields, "schema_version")?
        .parse::<u32>()
        .map_err(|e| invalid("schema_version", e))?;
    let created_at = DateTime::parse_from_rfc3339(required(fields, "created_at")?)
        .map_err(|e| invalid("created_at", e))?
        .with_timezone(&Utc);
    let tenant_id = TenantId::new(required(fields, "tenant_id")?)
        .map_err(|e| invalid("tenant_id", e))?;
    let priority = required(fields, "priority")?.parse()?;
    let call_chain: Vec<String> = serde_json::from_str(required(fields, "call_chain")?)
        .map_err(|e| invalid("call_chain", e))?;
    let payload: serde_json::Value = serde_json::from_str(required(fields, "payload")?)
        .map_err(|e| invalid("payload", e))?;
    let payload_refs: Vec<PayloadRef> = match fields.get("payload_refs") {
        Some(raw) => serde_json::from_str(raw).map_err(|e| invalid("payload_refs", e))?,
        None => Vec::new(),
    };
    let parent_event_id = match fields.get("parent_event_id") {
        Some(raw) => Some(Uuid::parse_str(raw).map_err(|e| invalid("parent_event_id", e))?),
        None => None,
    };

    Ok(Event {
        id,
        schema_version,
        kind: required(fields, "kind")?.to_string(),
        created_at,
        tenant_id,
        priority,
        source_worker_id: required(fields, "source_worker_id")?.to_string(),
        call_chain,
        payload,
        payload_refs,
        correlation_id: fields.get("correlation_id").cloned(),
        parent_event_id,
    })
}

/// Retry count carried by an entry; absent means first delivery.
pub fn retry_count(fields: &Fields) -> u32 {
    fields
        .get(RETRY_COUNT_FIELD)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Remove every bus-owned metadata field (retry counter, DLQ details).
pub fn strip_metadata(fields: &Fields) -> Fields {
    fields
        .iter()
        .filter(|(k, _)| !k.starts_with(METADATA_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event::{EventKind, Priority};
    use serde_json::json;

    fn sample() -> Event {
        Event::new(
            TenantId::new("t1").unwrap(),
            EventKind::HANDOFF_ACCEPTED,
            "crm",
            json!({"deal": {"stage": "won", "amount": 1200}}),
        )
        .with_call_chain(vec!["supervisor".into(), "crm".into()])
        .with_priority(Priority::High)
        .with_payload_ref(PayloadRef {
            uri: "s3://bucket/transcript.txt".into(),
            media_type: Some("text/plain".into()),
            size_bytes: Some(20_480),
        })
    }

    #[test]
    fn test_every_field_is_a_flat_string() {
        let fields = encode(&sample()).unwrap();
        assert_eq!(fields["priority"], "high");
        assert_eq!(fields["call_chain"], r#"["supervisor","crm"]"#);
        assert!(fields["payload"].starts_with('{'));
        assert!(!fields.contains_key("correlation_id"));
    }

    #[test]
    fn test_decode_restores_event() {
        let event = sample().with_correlation_id("c-1");
        let decoded = decode(&encode(&event).unwrap()).unwrap();
        assert_eq!(decoded.id, event.id);
        assert_eq!(decoded.call_chain, event.call_chain);
        assert_eq!(decoded.payload, event.payload);
        assert_eq!(decoded.payload_refs, event.payload_refs);
        assert_eq!(decoded.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(decoded.created_at.timestamp_millis(), event.created_at.timestamp_millis());
    }

    #[test]
    fn test_decode_reports_missing_and_malformed_fields() {
        let mut fields = encode(&sample()).unwrap();
        fields.remove("kind");
        let err = decode(&fields).unwrap_err();
        assert!(err.to_string().contains("'kind'"));

        let mut fields = encode(&sample()).unwrap();
        fields.insert("call_chain".into(), "not json".into());
        assert!(matches!(decode(&fields), Err(SwitchboardError::InvalidEvent(_))));
    }

    #[test]
    fn test_metadata_is_ignored_and_strippable() {
        let mut fields = encode(&sample()).unwrap();
        fields.insert(RETRY_COUNT_FIELD.into(), "2".into());
        fields.insert(DLQ_ERROR_FIELD.into(), "boom".into());
        assert_eq!(retry_count(&fields), 2);
        assert!(decode(&fields).is_ok());

        let clean = strip_metadata(&fields);
        assert_eq!(retry_count(&clean), 0);
        assert!(!clean.contains_key(DLQ_ERROR_FIELD));
        assert_eq!(clean.len(), fields.len() - 2);
    }
}
