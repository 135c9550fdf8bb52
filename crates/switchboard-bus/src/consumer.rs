use crate::bus::{Delivery, EventBus, FailureOutcome};
use crate::event::Event;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::SwitchboardResult;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after a transport error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Processes events delivered to a consumer group.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. An error triggers the retry policy.
    async fn handle(&self, event: &Event) -> SwitchboardResult<()>;
}

/// Counters for one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Handled and acknowledged.
    pub handled: usize,
    /// Scheduled for retry.
    pub retried: usize,
    /// Moved to the dead-letter stream.
    pub dead_lettered: usize,
}

impl ConsumerStats {
    fn merge(&mut self, other: ConsumerStats) {
        self.handled += other.handled;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

/// A consumer-group member: reclaim idle messages, read a batch, hand each
/// event to the handler, then acknowledge or apply the retry policy.
pub struct BusConsumer {
    bus: Arc<EventBus>,
    stream: String,
    group: String,
    consumer: String,
    handler: Arc<dyn EventHandler>,
}

impl BusConsumer {
    /// A consumer named `consumer` in `group` on a logical stream.
    pub fn new(
        bus: Arc<EventBus>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            bus,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            handler,
        }
    }

    /// One pass: reclaimed messages first, then one fresh batch.
    pub async fn run_once(&self) -> SwitchboardResult<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        let reclaimed = self
            .bus
            .reclaim(&self.stream, &self.group, &self.consumer)
            .await;
        // The group may not exist yet on the very first pass.
        if let Ok(batch) = reclaimed {
            stats.merge(self.process(batch).await?);
        }
        let batch = self
            .bus
            .subscribe(&self.stream, &self.group, &self.consumer)
            .await?;
        stats.merge(self.process(batch).await?);
        Ok(stats)
    }

    /// Poll until `cancel` fires. Transport errors are logged and retried.
    pub async fn run(&self, cancel: CancellationToken) -> ConsumerStats {
        let mut total = ConsumerStats::default();
        info!(
            tenant = %self.bus.tenant(),
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer,
            "Consumer started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.run_once() => match result {
                    Ok(stats) => total.merge(stats),
                    Err(e) => {
                        error!(stream = %self.stream, group = %self.group, error = %e, "Consumer pass failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                },
            }
        }
        info!(
            stream = %self.stream,
            group = %self.group,
            handled = total.handled,
            dead_lettered = total.dead_lettered,
            "Consumer stopped"
        );
        total
    }

    async fn process(&self, batch: Vec<Delivery>) -> SwitchboardResult<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        for delivery in batch {
            match self.handler.handle(&delivery.event).await {
                Ok(()) => {
                    self.bus
                        .acknowledge(&self.stream, &self.group, delivery.id)
                        .await?;
                    debug!(id = %delivery.id, kind = %delivery.event.kind, "Handled event");
                    stats.handled += 1;
                }
                Err(e) => {
                    let outcome = self
                        .bus
                        .handle_failure(&self.stream, &self.group, &delivery, &e.to_string())
                        .await?;
                    match outcome {
                        FailureOutcome::Retried { .. } => stats.retried += 1,
                        FailureOutcome::DeadLettered { .. } => stats.dead_lettered += 1,
                    }
                }
            }
        }
        Ok(stats)
    }
}
