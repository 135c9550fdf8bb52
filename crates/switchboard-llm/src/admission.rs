use crate::service::CompletionService;
use crate::types::{Completion, CompletionRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{AdmissionConfig, SwitchboardError, SwitchboardResult, TenantId};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

type TenantSemaphores = Arc<Mutex<HashMap<TenantId, Arc<Semaphore>>>>;

/// Held for the duration of one admitted completion call.
///
/// Dropping the last permit of an otherwise idle tenant removes that
/// tenant's semaphore, so the map only holds tenants with calls in flight.
pub struct AdmissionPermit {
    tenant: Option<(TenantId, OwnedSemaphorePermit)>,
    _global: OwnedSemaphorePermit,
    tenants: TenantSemaphores,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("tenant", &self.tenant.as_ref().map(|(t, _)| t))
            .finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some((tenant, permit)) = self.tenant.take() {
            drop(permit);
            prune_idle(&self.tenants, &tenant);
        }
    }
}

/// Remove a tenant's semaphore once nothing but the map refers to it. Every
/// clone is taken under the same lock, so no waiter or permit can be missed.
fn prune_idle(tenants: &TenantSemaphores, tenant: &TenantId) {
    let mut map = tenants.lock();
    if map.get(tenant).is_some_and(|s| Arc::strong_count(s) == 1) {
        map.remove(tenant);
    }
}

/// Caps in-flight completion calls across the whole process and per tenant.
///
/// A call first takes a slot from its tenant's semaphore and then one from
/// the global semaphore, so a tenant whose subtasks fan out widely queues
/// behind its own cap instead of draining the shared quota.
pub struct AdmissionController {
    global: Arc<Semaphore>,
    tenants: TenantSemaphores,
    per_tenant: usize,
    max_wait: Duration,
}

impl AdmissionController {
    /// Controller with the configured global and per-tenant limits.
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            tenants: Arc::new(Mutex::new(HashMap::new())),
            per_tenant: config.per_tenant.max(1),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }

    fn tenant_semaphore(&self, tenant: &TenantId) -> Arc<Semaphore> {
        self.tenants
            .lock()
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_tenant)))
            .clone()
    }

    /// Wait (up to the configured limit) for admission.
    pub async fn admit(&self, tenant: Option<&TenantId>) -> SwitchboardResult<AdmissionPermit> {
        let acquire = async {
            let tenant_permit = match tenant {
                Some(t) => Some(self.tenant_semaphore(t).acquire_owned().await),
                None => None,
            }
            .transpose();
            let global_permit = self.global.clone().acquire_owned().await;
            (tenant_permit, global_permit)
        };

        let (tenant_permit, global_permit) = tokio::time::timeout(self.max_wait, acquire)
            .await
            .map_err(|_| {
                if let Some(t) = tenant {
                    prune_idle(&self.tenants, t);
                }
                warn!(
                    tenant = tenant.map(TenantId::as_str).unwrap_or("-"),
                    wait_ms = self.max_wait.as_millis() as u64,
                    "Completion admission timed out"
                );
                SwitchboardError::Timeout(format!(
                    "completion admission not granted within {:?}",
                    self.max_wait
                ))
            })?;

        let closed = |e: tokio::sync::AcquireError| {
            SwitchboardError::Completion(format!("admission closed: {e}"))
        };
        let tenant_permit = tenant_permit.map_err(closed)?;
        let global_permit = global_permit.map_err(closed)?;
        Ok(AdmissionPermit {
            tenant: tenant.cloned().zip(tenant_permit),
            _global: global_permit,
            tenants: self.tenants.clone(),
        })
    }

    /// Free global slots.
    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    /// Free slots for one tenant.
    pub fn available_for(&self, tenant: &TenantId) -> usize {
        self.tenants
            .lock()
            .get(tenant)
            .map_or(self.per_tenant, |s| s.available_permits())
    }

    /// Tenants with admitted or waiting calls.
    pub fn tracked_tenants(&self) -> usize {
        self.tenants.lock().len()
    }
}

/// A [`CompletionService`] wrapped in admission control.
pub struct AdmittedCompletion {
    inner: Arc<dyn CompletionService>,
    admission: Arc<AdmissionController>,
}

impl AdmittedCompletion {
    /// Wrap `inner` so every call is admitted first.
    pub fn new(inner: Arc<dyn CompletionService>, admission: Arc<AdmissionController>) -> Self {
        Self { inner, admission }
    }
}

#[async_trait]
impl CompletionService for AdmittedCompletion {
    async fn complete(&self, request: CompletionRequest) -> SwitchboardResult<Completion> {
        let _permit = self.admission.admit(request.tenant_id.as_ref()).await?;
        debug!(
            tenant = request.tenant_id.as_ref().map(TenantId::as_str).unwrap_or("-"),
            tier = %request.tier,
            "Completion admitted"
        );
        self.inner.complete(request).await
    }
}
