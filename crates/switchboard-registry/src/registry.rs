use crate::registration::{AgentRegistration, AgentStatus, WorkerSummary};
use parking_lot::RwLock;
use std::collections::HashMap;
use switchboard_core::{SwitchboardError, SwitchboardResult, SUPERVISOR_ID};
use tracing::{info, warn};

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, AgentRegistration>,
    /// Registration order, for stable listings.
    order: Vec<String>,
}

/// Read-mostly store of worker metadata.
///
/// Many concurrent readers, one writer at a time. Holds no live worker
/// instances.
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Rejects duplicate ids, the reserved supervisor id,
    /// self-backups and backup cycles.
    /// Ids are trimmed before they are checked and stored.
    pub fn register(&self, mut registration: AgentRegistration) -> SwitchboardResult<()> {
        registration.worker_id = registration.worker_id.trim().to_string();
        registration.backup_worker_id = registration
            .backup_worker_id
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty());
        let id = registration.worker_id.clone();
        let id = id.as_str();
        if id.is_empty() {
            return Err(SwitchboardError::Registry("worker id must not be empty".into()));
        }
        if id == SUPERVISOR_ID {
            return Err(SwitchboardError::Registry(format!(
                "'{SUPERVISOR_ID}' is reserved"
            )));
        }

        let mut inner = self.inner.write();
        if inner.by_id.contains_key(id) {
            return Err(SwitchboardError::Registry(format!(
                "worker '{id}' is already registered"
            )));
        }
        if let Some(backup) = &registration.backup_worker_id {
            if backup == id {
                return Err(SwitchboardError::Registry(format!(
                    "worker '{id}' cannot be its own backup"
                )));
            }
            // Walk the existing backup links from the new backup; reaching
            // the new worker again means a cycle.
            let mut cursor = Some(backup.clone());
            let mut hops = 0;
            while let Some(current) = cursor {
                if current == id {
                    return Err(SwitchboardError::Registry(format!(
                        "backup cycle: '{id}' -> '{backup}' leads back to '{id}'"
                    )));
                }
                hops += 1;
                if hops > inner.by_id.len() {
                    break;
                }
                cursor = inner
                    .by_id
                    .get(&current)
                    .and_then(|r| r.backup_worker_id.clone());
            }
        }

        info!(
            worker_id = %id,
            capabilities = ?registration.capabilities,
            backup = ?registration.backup_worker_id,
            "Registered worker"
        );
        let id = id.to_string();
        inner.order.push(id.clone());
        inner.by_id.insert(id, registration);
        Ok(())
    }

    /// Remove a worker. An administrative act; workers naming it as their
    /// backup are left with a dangling link that fails at resolution.
    pub fn unregister(&self, worker_id: &str) -> SwitchboardResult<AgentRegistration> {
        let mut inner = self.inner.write();
        let removed = inner
            .by_id
            .remove(worker_id)
            .ok_or_else(|| SwitchboardError::WorkerNotFound(worker_id.to_string()))?;
        inner.order.retain(|w| w != worker_id);
        let dependents: Vec<&str> = inner
            .by_id
            .values()
            .filter(|r| r.backup_worker_id.as_deref() == Some(worker_id))
            .map(|r| r.worker_id.as_str())
            .collect();
        if !dependents.is_empty() {
            warn!(worker_id, ?dependents, "Unregistered worker is still a backup target");
        }
        info!(worker_id, "Unregistered worker");
        Ok(removed)
    }

    /// Snapshot of one registration.
    pub fn get(&self, worker_id: &str) -> Option<AgentRegistration> {
        self.inner.read().by_id.get(worker_id).cloned()
    }

    /// Whether `worker_id` is registered.
    pub fn contains(&self, worker_id: &str) -> bool {
        self.inner.read().by_id.contains_key(worker_id)
    }

    /// The configured backup of a worker: exactly one hop, never a chain.
    ///
    /// `Ok(None)` when no backup is configured; an error when the worker is
    /// unknown or its backup is not registered.
    pub fn get_backup(&self, worker_id: &str) -> SwitchboardResult<Option<AgentRegistration>> {
        let inner = self.inner.read();
        let reg = inner
            .by_id
            .get(worker_id)
            .ok_or_else(|| SwitchboardError::WorkerNotFound(worker_id.to_string()))?;
        let Some(backup_id) = &reg.backup_worker_id else {
            return Ok(None);
        };
        inner.by_id.get(backup_id).cloned().map(Some).ok_or_else(|| {
            SwitchboardError::Registry(format!(
                "backup '{backup_id}' of worker '{worker_id}' is not registered"
            ))
        })
    }

    /// Workers advertising a capability, in registration order.
    pub fn find_by_capability(&self, tag: &str) -> Vec<AgentRegistration> {
        self.collect(|r| r.has_capability(tag))
    }

    /// Workers carrying a tag, in registration order.
    pub fn find_by_tag(&self, tag: &str) -> Vec<AgentRegistration> {
        self.collect(|r| r.tags.iter().any(|t| t == tag))
    }

    /// Routing-facing summaries of every worker, in registration order.
    pub fn list_all(&self) -> Vec<WorkerSummary> {
        self.collect(|_| true).iter().map(AgentRegistration::summary).collect()
    }

    /// Registered ids, in registration order.
    pub fn worker_ids(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }

    /// Update the status of a registered worker.
    pub fn set_status(&self, worker_id: &str, status: AgentStatus) -> SwitchboardResult<()> {
        let mut inner = self.inner.write();
        let reg = inner
            .by_id
            .get_mut(worker_id)
            .ok_or_else(|| SwitchboardError::WorkerNotFound(worker_id.to_string()))?;
        if reg.status != status {
            info!(worker_id, from = %reg.status, to = %status, "Worker status changed");
            reg.status = status;
        }
        Ok(())
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Whether no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect(&self, pred: impl Fn(&AgentRegistration) -> bool) -> Vec<AgentRegistration> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }
}
