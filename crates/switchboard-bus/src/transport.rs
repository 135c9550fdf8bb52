//! Append-only stream log with consumer groups.
//!
//! [`StreamTransport`] is the narrow interface the [`EventBus`](crate::EventBus)
//! needs from a durable log: append with approximate length capping, consumer
//! groups with at-least-once delivery, a pending list per group, and idle
//! reclaim. Every mutation is expressed as a [`LogOp`] so that a journaling
//! transport can replay the exact same state after a restart.

use crate::codec::Fields;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use switchboard_core::{SwitchboardError, SwitchboardResult};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Poll interval while a blocking read waits for new entries.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Journal lines tolerated beyond twice the live state before compaction.
const COMPACT_SLACK: usize = 64;

/// Entry id: `<millis>-<seq>`, strictly increasing within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    /// Milliseconds since the epoch at append time.
    pub ms: u64,
    /// Sequence within the millisecond.
    pub seq: u64,
}

impl StreamId {
    /// The smallest id strictly greater than `last` at wall-clock `now_ms`.
    pub fn next_after(last: Option<StreamId>, now_ms: u64) -> StreamId {
        match last {
            Some(last) if now_ms <= last.ms => StreamId {
                ms: last.ms,
                seq: last.seq + 1,
            },
            _ => StreamId { ms: now_ms, seq: 0 },
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl std::str::FromStr for StreamId {
    type Err = SwitchboardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SwitchboardError::InvalidEvent(format!("malformed stream id '{s}'"));
        let (ms, seq) = s.split_once('-').ok_or_else(bad)?;
        Ok(StreamId {
            ms: ms.parse().map_err(|_| bad())?,
            seq: seq.parse().map_err(|_| bad())?,
        })
    }
}

/// One stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    /// Entry id.
    pub id: StreamId,
    /// Encoded body.
    pub fields: Fields,
}

/// A delivered but unacknowledged entry in a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    /// Entry id.
    pub id: StreamId,
    /// Consumer currently holding the entry.
    pub consumer: String,
    /// Time since last delivery.
    pub idle: Duration,
    /// How many times it was delivered.
    pub delivery_count: u32,
}

/// Durable log transport used by the event bus.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append an entry, creating the stream if needed. When `max_len` is set,
    /// the oldest entries are trimmed so that about `max_len` remain.
    async fn add(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> SwitchboardResult<StreamId>;

    /// Create a consumer group reading from the start of the stream.
    /// Returns `false` if the group already existed.
    async fn create_group(&self, stream: &str, group: &str) -> SwitchboardResult<bool>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting up
    /// to `block` for at least one to arrive.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> SwitchboardResult<Vec<StreamEntry>>;

    /// Remove entries from the group's pending list. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> SwitchboardResult<usize>;

    /// The group's pending list, oldest first.
    async fn pending(&self, stream: &str, group: &str) -> SwitchboardResult<Vec<PendingEntry>>;

    /// Re-assign up to `count` pending entries idle for at least `min_idle`
    /// to `consumer` and return them.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SwitchboardResult<Vec<StreamEntry>>;

    /// Entries in id order, optionally limited to the first `count`.
    async fn range(&self, stream: &str, count: Option<usize>) -> SwitchboardResult<Vec<StreamEntry>>;

    /// Delete entries by id. Returns how many existed.
    async fn delete(&self, stream: &str, ids: &[StreamId]) -> SwitchboardResult<usize>;

    /// Number of entries currently stored.
    async fn len(&self, stream: &str) -> SwitchboardResult<usize>;
}

/// A single state mutation of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogOp {
    Add {
        stream: String,
        id: StreamId,
        fields: Fields,
        max_len: Option<usize>,
    },
    CreateGroup {
        stream: String,
        group: String,
    },
    /// Hand entries to a consumer (first delivery or reclaim).
    Deliver {
        stream: String,
        group: String,
        consumer: String,
        ids: Vec<StreamId>,
        at_ms: u64,
    },
    Ack {
        stream: String,
        group: String,
        ids: Vec<StreamId>,
    },
    Delete {
        stream: String,
        ids: Vec<StreamId>,
    },
    /// Compaction: restore a stream's id cursor, which may be ahead of its
    /// surviving entries.
    Seed {
        stream: String,
        last_id: Option<StreamId>,
    },
    /// Compaction: restore a consumer group with its pending list.
    SeedGroup {
        stream: String,
        group: String,
        last_delivered: Option<StreamId>,
        pending: Vec<PendingSnapshot>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PendingSnapshot {
    id: StreamId,
    consumer: String,
    delivered_at_ms: u64,
    delivery_count: u32,
}

#[derive(Debug, Clone)]
struct PendingInfo {
    consumer: String,
    delivered_at_ms: u64,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: Option<StreamId>,
    pending: BTreeMap<StreamId, PendingInfo>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<StreamId, Fields>,
    last_id: Option<StreamId>,
    groups: HashMap<String, GroupState>,
}

/// Deterministic in-memory state of every stream.
#[derive(Debug, Default)]
pub(crate) struct StreamLog {
    streams: HashMap<String, StreamState>,
}

fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

fn no_group(stream: &str, group: &str) -> SwitchboardError {
    SwitchboardError::Transport(format!(
        "consumer group '{group}' does not exist on stream '{stream}'"
    ))
}

impl StreamLog {
    pub(crate) fn apply(&mut self, op: &LogOp) {
        match op {
            LogOp::Add {
                stream,
                id,
                fields,
                max_len,
            } => {
                let state = self.streams.entry(stream.clone()).or_default();
                state.entries.insert(*id, fields.clone());
                state.last_id = Some(state.last_id.map_or(*id, |last| last.max(*id)));
                if let Some(max_len) = max_len {
                    while state.entries.len() > *max_len {
                        state.entries.pop_first();
                    }
                }
            }
            LogOp::CreateGroup { stream, group } => {
                let state = self.streams.entry(stream.clone()).or_default();
                state.groups.entry(group.clone()).or_default();
            }
            LogOp::Deliver {
                stream,
                group,
                consumer,
                ids,
                at_ms,
            } => {
                let Some(g) = self
                    .streams
                    .get_mut(stream)
                    .and_then(|s| s.groups.get_mut(group))
                else {
                    return;
                };
                for id in ids {
                    match g.pending.get_mut(id) {
                        Some(info) => {
                            info.consumer = consumer.clone();
                            info.delivered_at_ms = *at_ms;
                            info.delivery_count += 1;
                        }
                        None => {
                            g.pending.insert(
                                *id,
                                PendingInfo {
                                    consumer: consumer.clone(),
                                    delivered_at_ms: *at_ms,
                                    delivery_count: 1,
                                },
                            );
                            g.last_delivered = Some(g.last_delivered.map_or(*id, |l| l.max(*id)));
                        }
                    }
                }
            }
            LogOp::Ack { stream, group, ids } => {
                if let Some(g) = self
                    .streams
                    .get_mut(stream)
                    .and_then(|s| s.groups.get_mut(group))
                {
                    for id in ids {
                        g.pending.remove(id);
                    }
                }
            }
            LogOp::Delete { stream, ids } => {
                if let Some(state) = self.streams.get_mut(stream) {
                    for id in ids {
                        state.entries.remove(id);
                    }
                }
            }
            LogOp::Seed { stream, last_id } => {
                let state = self.streams.entry(stream.clone()).or_default();
                state.last_id = state.last_id.max(*last_id);
            }
            LogOp::SeedGroup {
                stream,
                group,
                last_delivered,
                pending,
            } => {
                let state = self.streams.entry(stream.clone()).or_default();
                let pending = pending
                    .iter()
                    .map(|p| {
                        (
                            p.id,
                            PendingInfo {
                                consumer: p.consumer.clone(),
                                delivered_at_ms: p.delivered_at_ms,
                                delivery_count: p.delivery_count,
                            },
                        )
                    })
                    .collect();
                state.groups.insert(
                    group.clone(),
                    GroupState {
                        last_delivered: *last_delivered,
                        pending,
                    },
                );
            }
        }
    }

    /// Number of ops [`snapshot`](Self::snapshot) would produce.
    fn snapshot_len(&self) -> usize {
        self.streams
            .values()
            .map(|s| 1 + s.entries.len() + s.groups.len())
            .sum()
    }

    /// The shortest op sequence that rebuilds the current state.
    pub(crate) fn snapshot(&self) -> Vec<LogOp> {
        let mut names: Vec<&String> = self.streams.keys().collect();
        names.sort();
        let mut ops = Vec::with_capacity(self.snapshot_len());
        for name in names {
            let state = &self.streams[name];
            ops.push(LogOp::Seed {
                stream: name.clone(),
                last_id: state.last_id,
            });
            ops.extend(state.entries.iter().map(|(id, fields)| LogOp::Add {
                stream: name.clone(),
                id: *id,
                fields: fields.clone(),
                max_len: None,
            }));
            let mut groups: Vec<(&String, &GroupState)> = state.groups.iter().collect();
            groups.sort_by(|a, b| a.0.cmp(b.0));
            ops.extend(groups.into_iter().map(|(group, g)| LogOp::SeedGroup {
                stream: name.clone(),
                group: group.clone(),
                last_delivered: g.last_delivered,
                pending: g
                    .pending
                    .iter()
                    .map(|(id, info)| PendingSnapshot {
                        id: *id,
                        consumer: info.consumer.clone(),
                        delivered_at_ms: info.delivered_at_ms,
                        delivery_count: info.delivery_count,
                    })
                    .collect(),
            }));
        }
        ops
    }

    fn next_id(&self, stream: &str) -> StreamId {
        let last = self.streams.get(stream).and_then(|s| s.last_id);
        StreamId::next_after(last, now_ms())
    }

    fn has_group(&self, stream: &str, group: &str) -> bool {
        self.streams
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    fn undelivered(&self, stream: &str, group: &str, count: usize) -> SwitchboardResult<Vec<StreamEntry>> {
        let state = self
            .streams
            .get(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = state.groups.get(group).ok_or_else(|| no_group(stream, group))?;
        let entries = state
            .entries
            .iter()
            .filter(|(id, _)| g.last_delivered.map_or(true, |last| **id > last))
            .take(count)
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect();
        Ok(entries)
    }

    fn pending(&self, stream: &str, group: &str) -> SwitchboardResult<Vec<PendingEntry>> {
        let g = self
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        let now = now_ms();
        Ok(g.pending
            .iter()
            .map(|(id, info)| PendingEntry {
                id: *id,
                consumer: info.consumer.clone(),
                idle: Duration::from_millis(now.saturating_sub(info.delivered_at_ms)),
                delivery_count: info.delivery_count,
            })
            .collect())
    }

    fn entry(&self, stream: &str, id: StreamId) -> Option<StreamEntry> {
        self.streams
            .get(stream)
            .and_then(|s| s.entries.get(&id))
            .map(|fields| StreamEntry {
                id,
                fields: fields.clone(),
            })
    }
}

/// Process-local transport. Optionally journals every mutation to a file
/// (see [`FileStreamTransport`](crate::FileStreamTransport)).
pub struct InMemoryStreamTransport {
    log: Mutex<StreamLog>,
    notify: Notify,
    journal: Option<Journal>,
}

struct Journal {
    path: PathBuf,
    /// Lines currently in the file.
    lines: AtomicUsize,
}

impl InMemoryStreamTransport {
    /// An empty, non-durable log.
    pub fn new() -> Self {
        Self {
            log: Mutex::new(StreamLog::default()),
            notify: Notify::new(),
            journal: None,
        }
    }

    pub(crate) fn with_journal(log: StreamLog, path: PathBuf, lines: usize) -> Self {
        Self {
            log: Mutex::new(log),
            notify: Notify::new(),
            journal: Some(Journal {
                path,
                lines: AtomicUsize::new(lines),
            }),
        }
    }

    /// Journal (if any) then apply. Callers hold the log lock so journal
    /// order matches application order.
    ///
    /// Once the journal holds more than twice the lines a snapshot of the
    /// live state would need, it is rewritten from that snapshot. Trimmed,
    /// deleted and acknowledged history therefore never accumulates on disk.
    async fn commit(&self, log: &mut StreamLog, op: LogOp) -> SwitchboardResult<()> {
        let Some(journal) = &self.journal else {
            log.apply(&op);
            return Ok(());
        };
        append_journal(&journal.path, &op).await?;
        log.apply(&op);

        let lines = journal.lines.fetch_add(1, Ordering::Relaxed) + 1;
        if lines > 2 * log.snapshot_len() + COMPACT_SLACK {
            let kept = compact_journal(&journal.path, log).await?;
            debug!(path = %journal.path.display(), before = lines, after = kept, "Compacted stream journal");
            journal.lines.store(kept, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Default for InMemoryStreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a snapshot next to the journal, then atomically replace it.
async fn compact_journal(path: &Path, log: &StreamLog) -> SwitchboardResult<usize> {
    let ops = log.snapshot();
    let mut body = String::new();
    for op in &ops {
        body.push_str(&serde_json::to_string(op)?);
        body.push('\n');
    }
    let tmp = path.with_extension("compacting");
    tokio::fs::write(&tmp, body)
        .await
        .map_err(|e| SwitchboardError::Transport(format!("failed to write journal snapshot: {e}")))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SwitchboardError::Transport(format!("failed to replace journal: {e}")))?;
    Ok(ops.len())
}

async fn append_journal(path: &Path, op: &LogOp) -> SwitchboardResult<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| SwitchboardError::Transport(format!("failed to open journal: {e}")))?;
    let mut line = serde_json::to_string(op)?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| SwitchboardError::Transport(format!("failed to write journal: {e}")))?;
    file.flush()
        .await
        .map_err(|e| SwitchboardError::Transport(format!("failed to flush journal: {e}")))?;
    Ok(())
}

#[async_trait]
impl StreamTransport for InMemoryStreamTransport {
    async fn add(
        &self,
        stream: &str,
        fields: Fields,
        max_len: Option<usize>,
    ) -> SwitchboardResult<StreamId> {
        let mut log = self.log.lock().await;
        let id = log.next_id(stream);
        self.commit(
            &mut log,
            LogOp::Add {
                stream: stream.to_string(),
                id,
                fields,
                max_len,
            },
        )
        .await?;
        drop(log);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> SwitchboardResult<bool> {
        let mut log = self.log.lock().await;
        if log.has_group(stream, group) {
            return Ok(false);
        }
        self.commit(
            &mut log,
            LogOp::CreateGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            },
        )
        .await?;
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> SwitchboardResult<Vec<StreamEntry>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            {
                let mut log = self.log.lock().await;
                let entries = log.undelivered(stream, group, count)?;
                if !entries.is_empty() {
                    let op = LogOp::Deliver {
                        stream: stream.to_string(),
                        group: group.to_string(),
                        consumer: consumer.to_string(),
                        ids: entries.iter().map(|e| e.id).collect(),
                        at_ms: now_ms(),
                    };
                    self.commit(&mut log, op).await?;
                    return Ok(entries);
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = (deadline - now).min(READ_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> SwitchboardResult<usize> {
        let mut log = self.log.lock().await;
        let pending: Vec<StreamId> = log
            .pending(stream, group)?
            .into_iter()
            .map(|p| p.id)
            .filter(|id| ids.contains(id))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let n = pending.len();
        self.commit(
            &mut log,
            LogOp::Ack {
                stream: stream.to_string(),
                group: group.to_string(),
                ids: pending,
            },
        )
        .await?;
        Ok(n)
    }

    async fn pending(&self, stream: &str, group: &str) -> SwitchboardResult<Vec<PendingEntry>> {
        self.log.lock().await.pending(stream, group)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> SwitchboardResult<Vec<StreamEntry>> {
        let mut log = self.log.lock().await;
        let idle: Vec<StreamId> = log
            .pending(stream, group)?
            .into_iter()
            .filter(|p| p.idle >= min_idle)
            .map(|p| p.id)
            .collect();

        // Entries trimmed or deleted while pending can never be processed.
        let (live, gone): (Vec<StreamId>, Vec<StreamId>) = idle
            .into_iter()
            .partition(|id| log.entry(stream, *id).is_some());
        if !gone.is_empty() {
            self.commit(
                &mut log,
                LogOp::Ack {
                    stream: stream.to_string(),
                    group: group.to_string(),
                    ids: gone,
                },
            )
            .await?;
        }

        let ids: Vec<StreamId> = live.into_iter().take(count).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<StreamEntry> = ids.iter().filter_map(|id| log.entry(stream, *id)).collect();
        self.commit(
            &mut log,
            LogOp::Deliver {
                stream: stream.to_string(),
                group: group.to_string(),
                consumer: consumer.to_string(),
                ids,
                at_ms: now_ms(),
            },
        )
        .await?;
        Ok(entries)
    }

    async fn range(&self, stream: &str, count: Option<usize>) -> SwitchboardResult<Vec<StreamEntry>> {
        let log = self.log.lock().await;
        let Some(state) = log.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect())
    }

    async fn delete(&self, stream: &str, ids: &[StreamId]) -> SwitchboardResult<usize> {
        let mut log = self.log.lock().await;
        let existing: Vec<StreamId> = ids
            .iter()
            .copied()
            .filter(|id| log.entry(stream, *id).is_some())
            .collect();
        if existing.is_empty() {
            return Ok(0);
        }
        let n = existing.len();
        self.commit(
            &mut log,
            LogOp::Delete {
                stream: stream.to_string(),
                ids: existing,
            },
        )
        .await?;
        Ok(n)
    }

    async fn len(&self, stream: &str) -> SwitchboardResult<usize> {
        Ok(self
            .log
            .lock()
            .await
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn fields(n: u32) -> Fields {
        Fields::from([("n".to_string(), n.to_string())])
    }

    #[test]
    fn test_stream_id_ordering_and_parse() {
        let a = StreamId::next_after(None, 100);
        let b = StreamId::next_after(Some(a), 100);
        let c = StreamId::next_after(Some(b), 90);
        assert!(a < b && b < c);
        assert_eq!(c.to_string(), "100-2");
        assert_eq!("100-2".parse::<StreamId>().unwrap(), c);
        assert!("abc".parse::<StreamId>().is_err());
    }

    #[tokio::test]
    async fn test_group_delivers_each_entry_once() {
        let t = InMemoryStreamTransport::new();
        t.add("s", fields(1), None).await.unwrap();
        t.add("s", fields(2), None).await.unwrap();
        assert!(t.create_group("s", "g").await.unwrap());
        assert!(!t.create_group("s", "g").await.unwrap());

        let first = t.read_group("s", "g", "c1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 2);
        let again = t.read_group("s", "g", "c2", 10, Duration::ZERO).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(t.pending("s", "g").await.unwrap().len(), 2);

        assert_eq!(t.ack("s", "g", &[first[0].id]).await.unwrap(), 1);
        assert_eq!(t.ack("s", "g", &[first[0].id]).await.unwrap(), 0);
        assert_eq!(t.pending("s", "g").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_groups_are_independent() {
        let t = InMemoryStreamTransport::new();
        t.add("s", fields(1), None).await.unwrap();
        t.create_group("s", "a").await.unwrap();
        t.create_group("s", "b").await.unwrap();
        assert_eq!(t.read_group("s", "a", "c", 10, Duration::ZERO).await.unwrap().len(), 1);
        assert_eq!(t.read_group("s", "b", "c", 10, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_unknown_group_fails() {
        let t = InMemoryStreamTransport::new();
        let err = t.read_group("s", "g", "c", 1, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::Transport(_)));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_add() {
        let t = std::sync::Arc::new(InMemoryStreamTransport::new());
        t.create_group("s", "g").await.unwrap();
        let reader = {
            let t = t.clone();
            tokio::spawn(async move { t.read_group("s", "g", "c", 1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.add("s", fields(7), None).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].fields["n"], "7");
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let t = InMemoryStreamTransport::new();
        t.create_group("s", "g").await.unwrap();
        let got = t.read_group("s", "g", "c", 1, Duration::from_millis(30)).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_max_len_trims_oldest() {
        let t = InMemoryStreamTransport::new();
        for n in 0..5 {
            t.add("s", fields(n), Some(3)).await.unwrap();
        }
        let all = t.range("s", None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].fields["n"], "2");
    }

    #[tokio::test]
    async fn test_claim_reassigns_idle_entries() {
        let t = InMemoryStreamTransport::new();
        t.add("s", fields(1), None).await.unwrap();
        t.create_group("s", "g").await.unwrap();
        t.read_group("s", "g", "dead", 10, Duration::ZERO).await.unwrap();

        let none = t.claim("s", "g", "live", Duration::from_secs(3600), 10).await.unwrap();
        assert!(none.is_empty());

        let claimed = t.claim("s", "g", "live", Duration::ZERO, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let pending = t.pending("s", "g").await.unwrap();
        assert_eq!(pending[0].consumer, "live");
        assert_eq!(pending[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn test_claim_drops_deleted_entries() {
        let t = InMemoryStreamTransport::new();
        let id = t.add("s", fields(1), None).await.unwrap();
        t.create_group("s", "g").await.unwrap();
        t.read_group("s", "g", "c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(t.delete("s", &[id]).await.unwrap(), 1);
        assert!(t.claim("s", "g", "c2", Duration::ZERO, 10).await.unwrap().is_empty());
        assert!(t.pending("s", "g").await.unwrap().is_empty());
        assert_eq!(t.len("s").await.unwrap(), 0);
    }
}
