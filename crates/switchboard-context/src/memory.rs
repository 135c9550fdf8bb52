use crate::embedding::cosine_similarity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use switchboard_core::{SwitchboardError, SwitchboardResult, TenantId};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// One durable fact in a tenant's long-term memory.
///
/// Entries are never edited in place. A newer entry with the same `subject`
/// supersedes older ones at query time; the older ones stay stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// What the fact is about; a newer entry with the same subject supersedes older ones.
    pub subject: String,
    /// The remembered text.
    pub content: String,
    /// Vector of `content`.
    pub embedding: Vec<f32>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
    /// Free-form annotations.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MemoryEntry {
    /// New entry stamped with a fresh id and the current time.
    pub fn new(
        tenant_id: TenantId,
        subject: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            subject: subject.into(),
            content: content.into(),
            embedding,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    fn subject_key(&self) -> Option<String> {
        let key = self.subject.trim().to_lowercase();
        (!key.is_empty()).then_some(key)
    }
}

/// A search hit with its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    /// The matching entry.
    pub entry: MemoryEntry,
    /// Cosine similarity to the query.
    pub score: f32,
}

/// Tenant-partitioned vector store with cosine top-k retrieval.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store an entry.
    async fn insert(&self, entry: MemoryEntry) -> SwitchboardResult<()>;

    /// Top-k current (non-superseded) entries of one tenant, best first.
    async fn search(
        &self,
        tenant: &TenantId,
        query_embedding: &[f32],
        top_k: usize,
    ) -> SwitchboardResult<Vec<ScoredMemory>>;

    /// Every stored entry of one tenant, including superseded ones, in
    /// insertion order.
    async fn list(&self, tenant: &TenantId) -> SwitchboardResult<Vec<MemoryEntry>>;

    /// Number of stored entries for a tenant, superseded ones included.
    async fn count(&self, tenant: &TenantId) -> SwitchboardResult<usize>;
}

/// Drop entries superseded by a newer entry with the same subject.
fn current_entries(entries: &[MemoryEntry]) -> Vec<&MemoryEntry> {
    let mut latest: HashMap<String, usize> = HashMap::new();
    for (i, entry) in entries.iter().enumerate() {
        if let Some(key) = entry.subject_key() {
            match latest.get(&key) {
                Some(&j) if entries[j].created_at > entry.created_at => {}
                _ => {
                    latest.insert(key, i);
                }
            }
        }
    }
    entries
        .iter()
        .enumerate()
        .filter(|(i, e)| match e.subject_key() {
            Some(key) => latest.get(&key) == Some(i),
            None => true,
        })
        .map(|(_, e)| e)
        .collect()
}

/// Brute-force in-memory store.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    partitions: RwLock<HashMap<TenantId, Vec<MemoryEntry>>>,
}

impl InMemoryMemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn insert(&self, entry: MemoryEntry) -> SwitchboardResult<()> {
        self.partitions
            .write()
            .entry(entry.tenant_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn search(
        &self,
        tenant: &TenantId,
        query_embedding: &[f32],
        top_k: usize,
    ) -> SwitchboardResult<Vec<ScoredMemory>> {
        let partitions = self.partitions.read();
        let Some(entries) = partitions.get(tenant) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<ScoredMemory> = current_entries(entries)
            .into_iter()
            .map(|e| ScoredMemory {
                score: cosine_similarity(query_embedding, &e.embedding),
                entry: e.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn list(&self, tenant: &TenantId) -> SwitchboardResult<Vec<MemoryEntry>> {
        Ok(self
            .partitions
            .read()
            .get(tenant)
            .cloned()
            .unwrap_or_default())
    }

    async fn count(&self, tenant: &TenantId) -> SwitchboardResult<usize> {
        Ok(self.partitions.read().get(tenant).map_or(0, Vec::len))
    }
}

/// Append-only JSONL store, one file per tenant, indexed in memory.
///
/// All files are replayed on open. Lines that fail to parse are skipped
/// with a warning.
pub struct FileMemoryStore {
    dir: PathBuf,
    index: InMemoryMemoryStore,
    write_lock: Mutex<()>,
}

impl FileMemoryStore {
    /// Open (or create) a store under `dir`, loading existing tenant files.
    pub async fn open(dir: impl Into<PathBuf>) -> SwitchboardResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let index = InMemoryMemoryStore::new();

        let mut loaded = 0usize;
        let mut files = tokio::fs::read_dir(&dir).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let data = tokio::fs::read_to_string(&path).await?;
            for (line_no, line) in data.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MemoryEntry>(line) {
                    Ok(entry) => {
                        index.insert(entry).await?;
                        loaded += 1;
                    }
                    Err(e) => warn!(
                        file = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping unreadable memory entry"
                    ),
                }
            }
        }
        info!(dir = %dir.display(), entries = loaded, "Loaded long-term memory");

        Ok(Self {
            dir,
            index,
            write_lock: Mutex::new(()),
        })
    }

    fn tenant_file(&self, tenant: &TenantId) -> SwitchboardResult<PathBuf> {
        let t = tenant.as_str();
        if t.contains('/') || t.contains('\\') || t.contains("..") {
            return Err(SwitchboardError::Context(format!("invalid tenant id '{t}'")));
        }
        Ok(self.dir.join(format!("{t}.jsonl")))
    }
}

#[async_trait]
impl MemoryStore for FileMemoryStore {
    async fn insert(&self, entry: MemoryEntry) -> SwitchboardResult<()> {
        let path = self.tenant_file(&entry.tenant_id)?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        self.index.insert(entry).await
    }

    async fn search(
        &self,
        tenant: &TenantId,
        query_embedding: &[f32],
        top_k: usize,
    ) -> SwitchboardResult<Vec<ScoredMemory>> {
        self.index.search(tenant, query_embedding, top_k).await
    }

    async fn list(&self, tenant: &TenantId) -> SwitchboardResult<Vec<MemoryEntry>> {
        self.index.list(tenant).await
    }

    async fn count(&self, tenant: &TenantId) -> SwitchboardResult<usize> {
        self.index.count(tenant).await
    }
}
