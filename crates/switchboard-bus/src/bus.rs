use crate::codec::{self, Fields};
use crate::event::Event;
use crate::transport::{StreamEntry, StreamId, StreamTransport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{BusConfig, SwitchboardError, SwitchboardResult, TenantId};
use tracing::{debug, info, warn};

const DLQ_SUFFIX: &str = "dlq";

/// A message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Transport id, needed to acknowledge.
    pub id: StreamId,
    /// The decoded event.
    pub event: Event,
    /// How many times this message has already been retried.
    pub retry_count: u32,
    fields: Fields,
}

/// What the bus did with a message whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Scheduled for re-publish with an incremented retry counter after `delay`.
    Retried {
        /// Retry number the copy will carry, starting at 1.
        attempt: u32,
        /// Backoff before the copy is published.
        delay: Duration,
    },
    /// Moved to the dead-letter stream.
    DeadLettered {
        /// Id on the dead-letter stream.
        dlq_id: StreamId,
    },
}

/// A dead-lettered message with its failure metadata.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Id on the dead-letter stream.
    pub id: StreamId,
    /// Last handler error.
    pub error: String,
    /// Retries spent before giving up.
    pub retry_count: u32,
    /// When it was dead-lettered.
    pub failed_at: Option<DateTime<Utc>>,
    /// Logical stream it failed on.
    pub original_stream: String,
    /// Its id on that stream.
    pub original_id: Option<StreamId>,
    fields: Fields,
}

impl DeadLetter {
    /// Decode the original event. Fails for messages that were dead-lettered
    /// because they could not be decoded in the first place.
    pub fn event(&self) -> SwitchboardResult<Event> {
        codec::decode(&self.fields)
    }

    fn from_entry(entry: StreamEntry) -> Self {
        let f = &entry.fields;
        Self {
            id: entry.id,
            error: f.get(codec::DLQ_ERROR_FIELD).cloned().unwrap_or_default(),
            retry_count: f
                .get(codec::DLQ_RETRY_COUNT_FIELD)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            failed_at: f
                .get(codec::DLQ_FAILED_AT_FIELD)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|d| d.with_timezone(&Utc)),
            original_stream: f
                .get(codec::DLQ_ORIGINAL_STREAM_FIELD)
                .cloned()
                .unwrap_or_default(),
            original_id: f
                .get(codec::DLQ_ORIGINAL_ID_FIELD)
                .and_then(|v| v.parse().ok()),
            fields: entry.fields,
        }
    }
}

/// A tenant-bound event bus.
///
/// Every stream name is prefixed with the bound tenant (`{tenant}:{stream}`),
/// and publishing an event that belongs to another tenant is rejected before
/// the transport is touched, so no code path can cross tenants.
pub struct EventBus {
    tenant: TenantId,
    transport: Arc<dyn StreamTransport>,
    config: BusConfig,
}

impl EventBus {
    /// A bus bound to one tenant over a shared transport.
    pub fn new(tenant: TenantId, transport: Arc<dyn StreamTransport>, config: BusConfig) -> Self {
        Self {
            tenant,
            transport,
            config,
        }
    }

    /// The tenant this bus is bound to.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Retry and delivery settings.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Physical name of a logical stream.
    pub fn stream_name(&self, stream: &str) -> String {
        self.tenant.scoped(stream)
    }

    /// Physical name of a logical stream's dead-letter stream.
    pub fn dlq_stream_name(&self, stream: &str) -> String {
        format!("{}:{DLQ_SUFFIX}", self.stream_name(stream))
    }

    /// Publish an event to a logical stream.
    pub async fn publish(&self, stream: &str, event: &Event) -> SwitchboardResult<StreamId> {
        if event.tenant_id != self.tenant {
            warn!(
                bound = %self.tenant,
                actual = %event.tenant_id,
                kind = %event.kind,
                "Rejected cross-tenant publish"
            );
            return Err(SwitchboardError::TenantMismatch {
                expected: self.tenant.to_string(),
                actual: event.tenant_id.to_string(),
            });
        }
        event.validate()?;
        let fields = codec::encode(event)?;
        let id = self
            .transport
            .add(&self.stream_name(stream), fields, self.config.stream_max_len)
            .await?;
        debug!(tenant = %self.tenant, stream, id = %id, kind = %event.kind, "Published event");
        Ok(id)
    }

    /// Read the next batch for `consumer` in `group`, creating the group if
    /// needed. Blocks up to the configured timeout.
    ///
    /// Entries that cannot be decoded are dead-lettered and acknowledged
    /// immediately; retrying them cannot succeed.
    pub async fn subscribe(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> SwitchboardResult<Vec<Delivery>> {
        let physical = self.stream_name(stream);
        if self.transport.create_group(&physical, group).await? {
            info!(tenant = %self.tenant, stream, group, "Created consumer group");
        }
        let entries = self
            .transport
            .read_group(
                &physical,
                group,
                consumer,
                self.config.batch_size,
                Duration::from_millis(self.config.block_timeout_ms),
            )
            .await?;
        self.decode_batch(stream, group, entries).await
    }

    /// Mark a delivered message as processed. Returns `false` if it was not pending.
    pub async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        id: StreamId,
    ) -> SwitchboardResult<bool> {
        let n = self
            .transport
            .ack(&self.stream_name(stream), group, &[id])
            .await?;
        Ok(n > 0)
    }

    /// Take over messages left pending by consumers idle longer than the
    /// configured threshold.
    pub async fn reclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> SwitchboardResult<Vec<Delivery>> {
        let entries = self
            .transport
            .claim(
                &self.stream_name(stream),
                group,
                consumer,
                Duration::from_millis(self.config.reclaim_idle_ms),
                self.config.batch_size,
            )
            .await?;
        if !entries.is_empty() {
            info!(
                tenant = %self.tenant,
                stream,
                group,
                consumer,
                count = entries.len(),
                "Reclaimed idle pending messages"
            );
        }
        self.decode_batch(stream, group, entries).await
    }

    /// Apply the retry / dead-letter policy to a message whose handler failed.
    ///
    /// Below the retry limit a re-publish with an incremented counter is
    /// scheduled after an exponential backoff, and this returns immediately so
    /// the caller can keep handling the rest of its batch. The original stays
    /// pending until the copy is on the stream, so a crash during the backoff
    /// leaves it reclaimable. At the limit the message is moved to the
    /// dead-letter stream with its failure metadata and acknowledged.
    pub async fn handle_failure(
        &self,
        stream: &str,
        group: &str,
        delivery: &Delivery,
        error: &str,
    ) -> SwitchboardResult<FailureOutcome> {
        let policy = &self.config.retry;
        if delivery.retry_count < policy.max_retries {
            let delay = Duration::from_millis(policy.delay_ms(delivery.retry_count));
            let attempt = delivery.retry_count + 1;
            warn!(
                tenant = %self.tenant,
                stream,
                id = %delivery.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error,
                "Handler failed, scheduling retry"
            );
            self.schedule_retry(stream, group, delivery, attempt, delay);
            return Ok(FailureOutcome::Retried { attempt, delay });
        }

        let dlq_id = self
            .dead_letter(stream, delivery.id, &delivery.fields, delivery.retry_count, error)
            .await?;
        self.acknowledge(stream, group, delivery.id).await?;
        Ok(FailureOutcome::DeadLettered { dlq_id })
    }

    fn schedule_retry(
        &self,
        stream: &str,
        group: &str,
        delivery: &Delivery,
        attempt: u32,
        delay: Duration,
    ) {
        let mut fields = codec::strip_metadata(&delivery.fields);
        fields.insert(codec::RETRY_COUNT_FIELD.into(), attempt.to_string());
        let transport = self.transport.clone();
        let physical = self.stream_name(stream);
        let group = group.to_string();
        let max_len = self.config.stream_max_len;
        let original = delivery.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match transport.add(&physical, fields, max_len).await {
                Ok(id) => {
                    debug!(stream = %physical, id = %id, original = %original, attempt, "Re-published for retry");
                    if let Err(e) = transport.ack(&physical, &group, &[original]).await {
                        warn!(stream = %physical, id = %original, error = %e, "Failed to acknowledge retried message");
                    }
                }
                Err(e) => {
                    warn!(
                        stream = %physical,
                        id = %original,
                        error = %e,
                        "Retry re-publish failed, message left pending for reclaim"
                    );
                }
            }
        });
    }

    /// Dead-lettered messages of a logical stream, oldest first.
    pub async fn dead_letters(&self, stream: &str) -> SwitchboardResult<Vec<DeadLetter>> {
        let entries = self
            .transport
            .range(&self.dlq_stream_name(stream), None)
            .await?;
        Ok(entries.into_iter().map(DeadLetter::from_entry).collect())
    }

    /// Re-publish a dead-lettered message to its original stream with the
    /// dead-letter metadata stripped and the retry counter reset, then remove
    /// it from the dead-letter stream.
    pub async fn replay_dead_letter(
        &self,
        stream: &str,
        dlq_id: StreamId,
    ) -> SwitchboardResult<StreamId> {
        let dlq = self.dlq_stream_name(stream);
        let letter = self
            .dead_letters(stream)
            .await?
            .into_iter()
            .find(|l| l.id == dlq_id)
            .ok_or_else(|| {
                SwitchboardError::Transport(format!("dead letter {dlq_id} not found in '{dlq}'"))
            })?;

        let event = letter.event()?;
        if event.tenant_id != self.tenant {
            return Err(SwitchboardError::TenantMismatch {
                expected: self.tenant.to_string(),
                actual: event.tenant_id.to_string(),
            });
        }

        let fields = codec::strip_metadata(&letter.fields);
        let id = self
            .transport
            .add(&self.stream_name(stream), fields, self.config.stream_max_len)
            .await?;
        self.transport.delete(&dlq, &[dlq_id]).await?;
        info!(tenant = %self.tenant, stream, dlq_id = %dlq_id, id = %id, "Replayed dead letter");
        Ok(id)
    }

    async fn dead_letter(
        &self,
        stream: &str,
        original_id: StreamId,
        fields: &Fields,
        retry_count: u32,
        error: &str,
    ) -> SwitchboardResult<StreamId> {
        let mut fields = codec::strip_metadata(fields);
        fields.insert(codec::DLQ_ERROR_FIELD.into(), error.to_string());
        fields.insert(codec::DLQ_RETRY_COUNT_FIELD.into(), retry_count.to_string());
        fields.insert(codec::DLQ_FAILED_AT_FIELD.into(), Utc::now().to_rfc3339());
        fields.insert(codec::DLQ_ORIGINAL_STREAM_FIELD.into(), stream.to_string());
        fields.insert(codec::DLQ_ORIGINAL_ID_FIELD.into(), original_id.to_string());
        let dlq_id = self
            .transport
            .add(&self.dlq_stream_name(stream), fields, None)
            .await?;
        warn!(
            tenant = %self.tenant,
            stream,
            id = %original_id,
            dlq_id = %dlq_id,
            retry_count,
            error,
            "Message moved to dead-letter stream"
        );
        Ok(dlq_id)
    }

    async fn decode_batch(
        &self,
        stream: &str,
        group: &str,
        entries: Vec<StreamEntry>,
    ) -> SwitchboardResult<Vec<Delivery>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match codec::decode(&entry.fields) {
                Ok(event) => out.push(Delivery {
                    id: entry.id,
                    retry_count: codec::retry_count(&entry.fields),
                    event,
                    fields: entry.fields,
                }),
                Err(e) => {
                    let retries = codec::retry_count(&entry.fields);
                    self.dead_letter(stream, entry.id, &entry.fields, retries, &e.to_string())
                        .await?;
                    self.acknowledge(stream, group, entry.id).await?;
                }
            }
        }
        Ok(out)
    }
}
