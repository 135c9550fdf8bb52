use crate::codec::Fields;
use crate::transport::{
    InMemoryStreamTransport, LogOp, PendingEntry, StreamEntry, StreamId, StreamLog,
    StreamTransport,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tracing::info;

/// Stream transport that journals every mutation to a JSONL file.
///
/// Opening an existing journal replays it, so published entries, consumer
/// groups and pending (delivered but unacknowledged) messages survive a
/// restart. Pending messages of a crashed consumer become reclaimable.
///
/// The journal is compacted to a snapshot of the live state as it grows, so
/// its size follows the streams' `max_len` caps rather than their history.
pub struct FileStreamTransport {
    inner: InMemoryStreamTransport,
}

impl FileStreamTransport {
    /// Open (or create) a journal at `path`.
    pub async fn open(path: PathBuf) -> SwitchboardResult<Self> {
        let mut log = StreamLog::default();
        let mut lines = 0usize;

        if path.exists() {
            let data = tokio::fs::read_to_string(&path).await.map_err(|e| {
                SwitchboardError::Transport(format!("failed to read journal: {e}"))
            })?;
            for line in data.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let op: LogOp = serde_json::from_str(line).map_err(|e| {
                    SwitchboardError::Transport(format!("invalid journal entry: {e}"))
                })?;
                log.apply(&op);
                lines += 1;
            }
            info!(path = %path.display(), ops = lines, "Replayed stream journal");
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SwitchboardError::Transport(format!("failed to create journal dir: {e}"))
            })?;
        }

        Ok(Self {
            inner: InMemoryStreamTransport::with_journal(log, path, lines),
        })
    }
}

#[async_trait]
impl StreamTransport for FileStreamTransport {
    async fn add(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> SwitchboardResult<StreamId> {
        self.inner.add(stream, fields, max_len).await
    }

    async fn create_group(&self, stream: &str, group: &str) -> SwitchboardResult<bool> {
        self.inner.create_group(stream, group).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> SwitchboardResult<Vec<StreamEntry>> {
        self.inner
            .read_group(stream, group, consumer, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> SwitchboardResult<usize> {
        self.inner.ack(stream, group, ids).await
    }

    async fn pending(&self, stream: &str, group: &str) -> SwitchboardResult<Vec<PendingEntry>> {
        self.inner.pending(stream, group).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SwitchboardResult<Vec<StreamEntry>> {
        self.inner
            .claim(stream, group, consumer, min_idle, count)
            .await
    }

    async fn range(&self, stream: &str, count: Option<usize>) -> SwitchboardResult<Vec<StreamEntry>> {
        self.inner.range(stream, count).await
    }

    async fn delete(&self, stream: &str, ids: &[StreamId]) -> SwitchboardResult<usize> {
        self.inner.delete(stream, ids).await
    }

    async fn len(&self, stream: &str) -> SwitchboardResult<usize> {
        self.inner.len(stream).await
    }
}
