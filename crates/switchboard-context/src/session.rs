use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use switchboard_core::{SessionTurn, SwitchboardError, SwitchboardResult, TenantId};
use tokio::sync::Mutex;

/// Tenant-partitioned conversation history keyed by session id.
///
/// Sessions never expire; they go away only through [`SessionStore::clear`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append a turn to the end of a session, creating it if needed.
    async fn append(&self, tenant: &TenantId, session_id: &str, turn: SessionTurn)
        -> SwitchboardResult<()>;

    /// The last `n` turns, oldest first.
    async fn read_recent(
        &self,
        tenant: &TenantId,
        session_id: &str,
        n: usize,
    ) -> SwitchboardResult<Vec<SessionTurn>>;

    /// Delete a session. Returns whether it existed.
    async fn clear(&self, tenant: &TenantId, session_id: &str) -> SwitchboardResult<bool>;
}

/// Ids become path segments in the file store, so both stores reject
/// anything that could escape its directory.
fn validate_segment(kind: &str, value: &str) -> SwitchboardResult<()> {
    if value.trim().is_empty() || value.contains('/') || value.contains('\\') || value.contains("..")
    {
        return Err(SwitchboardError::Context(format!("invalid {kind} '{value}'")));
    }
    Ok(())
}

fn validate_session_id(session_id: &str) -> SwitchboardResult<()> {
    validate_segment("session id", session_id)
}

fn tail(turns: &[SessionTurn], n: usize) -> Vec<SessionTurn> {
    turns[turns.len().saturating_sub(n)..].to_vec()
}

/// Process-local session store.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<(TenantId, String), Vec<SessionTurn>>>,
}

impl InMemorySessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append(
        &self,
        tenant: &TenantId,
        session_id: &str,
        turn: SessionTurn,
    ) -> SwitchboardResult<()> {
        validate_session_id(session_id)?;
        self.sessions
            .write()
            .entry((tenant.clone(), session_id.to_string()))
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn read_recent(
        &self,
        tenant: &TenantId,
        session_id: &str,
        n: usize,
    ) -> SwitchboardResult<Vec<SessionTurn>> {
        validate_session_id(session_id)?;
        let sessions = self.sessions.read();
        Ok(sessions
            .get(&(tenant.clone(), session_id.to_string()))
            .map(|turns| tail(turns, n))
            .unwrap_or_default())
    }

    async fn clear(&self, tenant: &TenantId, session_id: &str) -> SwitchboardResult<bool> {
        validate_session_id(session_id)?;
        Ok(self
            .sessions
            .write()
            .remove(&(tenant.clone(), session_id.to_string()))
            .is_some())
    }
}

/// File-backed session store: one JSON file per session under
/// `{dir}/{tenant}/{session_id}.json`.
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Store rooted at `dir`, created if missing.
    pub async fn new(dir: impl Into<PathBuf>) -> SwitchboardResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn session_path(&self, tenant: &TenantId, session_id: &str) -> SwitchboardResult<PathBuf> {
        validate_segment("tenant id", tenant.as_str())?;
        validate_session_id(session_id)?;
        Ok(self
            .dir
            .join(tenant.as_str())
            .join(format!("{session_id}.json")))
    }

    async fn load(&self, path: &Path) -> SwitchboardResult<Vec<SessionTurn>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        serde_json::from_str(&data).map_err(|e| {
            SwitchboardError::Context(format!(
                "failed to parse session file {}: {e}",
                path.display()
            ))
        })
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn append(
        &self,
        tenant: &TenantId,
        session_id: &str,
        turn: SessionTurn,
    ) -> SwitchboardResult<()> {
        let path = self.session_path(tenant, session_id)?;
        let _guard = self.write_lock.lock().await;
        let mut turns = self.load(&path).await?;
        turns.push(turn);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&turns)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_recent(
        &self,
        tenant: &TenantId,
        session_id: &str,
        n: usize,
    ) -> SwitchboardResult<Vec<SessionTurn>> {
        let turns = self.load(&self.session_path(tenant, session_id)?).await?;
        Ok(tail(&turns, n))
    }

    async fn clear(&self, tenant: &TenantId, session_id: &str) -> SwitchboardResult<bool> {
        let path = self.session_path(tenant, session_id)?;
        let _guard = self.write_lock.lock().await;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }
        tokio::fs::remove_file(path).await?;
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_read_recent_returns_tail_oldest_first() {
        let store = InMemorySessionStore::new();
        let t = tenant("t1");
        for i in 0..5 {
            store.append(&t, "deal-1", SessionTurn::user(format!("turn {i}"))).await.unwrap();
        }
        let recent = store.read_recent(&t, "deal-1", 2).await.unwrap();
        let texts: Vec<&str> = recent.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(texts, vec!["turn 3", "turn 4"]);
        assert_eq!(store.read_recent(&t, "deal-1", 100).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_in_memory_partitions_by_tenant() {
        let store = InMemorySessionStore::new();
        store.append(&tenant("a"), "s", SessionTurn::user("secret")).await.unwrap();
        assert!(store.read_recent(&tenant("b"), "s", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemorySessionStore::new();
        let t = tenant("t1");
        store.append(&t, "s", SessionTurn::user("x")).await.unwrap();
        assert!(store.clear(&t, "s").await.unwrap());
        assert!(!store.clear(&t, "s").await.unwrap());
        assert!(store.read_recent(&t, "s", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_session_ids() {
        let store = InMemorySessionStore::new();
        let t = tenant("t1");
        for bad in ["", "../x", "a/b", "a\\b"] {
            assert!(store.append(&t, bad, SessionTurn::user("x")).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let t = tenant("t1");
        {
            let store = FileSessionStore::new(dir.path()).await.unwrap();
            store.append(&t, "deal-9", SessionTurn::user("hello")).await.unwrap();
            store
                .append(&t, "deal-9", SessionTurn::from_worker("crm", "stage updated"))
                .await
                .unwrap();
        }
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        let turns = store.read_recent(&t, "deal-9", 10).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].worker_id.as_deref(), Some("crm"));
        assert!(dir.path().join("t1").join("deal-9.json").exists());

        assert!(store.clear(&t, "deal-9").await.unwrap());
        assert!(store.read_recent(&t, "deal-9", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("t1")).unwrap();
        std::fs::write(dir.path().join("t1").join("s.json"), "not json").unwrap();
        let store = FileSessionStore::new(dir.path()).await.unwrap();
        assert!(matches!(
            store.read_recent(&tenant("t1"), "s", 5).await,
            Err(SwitchboardError::Context(_))
        ));
    }
}
