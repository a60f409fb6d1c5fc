//! Provision / deprovision state machine for copy instances.
//!
//! `NONE -> IN_PROGRESS -> {SUCCEEDED -> GONE, FAILED -> GONE}`
//!
//! Every operation on a service instance holds that instance's key lock for
//! its whole check-then-act sequence, including the provider call. Binding
//! creation takes the same lock (see `BindingManager`), so a bind always sees
//! the latest persisted state and can never interleave with a teardown.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use crate::copy::provider::CopyProvider;
use crate::store::repository::Repository;

use super::action_log::ActionLog;
use super::error::BrokerError;
use super::locks::KeyedLocks;
use super::{
    BrokerActionState, InstancePair, InstanceState, InstanceStatus, ServiceInstance,
    ServiceInstanceBinding,
};

/// One provision attempt, identified by the copy it started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionAttempt {
    pub service_instance_id: String,
    pub copy_id: String,
}

impl ProvisionAttempt {
    /// `None` until the provider has accepted the copy.
    pub fn of(instance: &ServiceInstance) -> Option<Self> {
        instance.copy_id.as_ref().map(|copy_id| Self {
            service_instance_id: instance.service_instance_id.clone(),
            copy_id: copy_id.clone(),
        })
    }

    fn matches(&self, instance: &ServiceInstance) -> bool {
        instance.copy_id.as_deref() == Some(self.copy_id.as_str())
    }
}

pub struct InstanceLifecycleManager {
    instances: Arc<dyn Repository<ServiceInstance>>,
    /// Read-only here: only consulted to refuse deprovisioning a bound copy.
    bindings: Arc<dyn Repository<ServiceInstanceBinding>>,
    provider: Arc<dyn CopyProvider>,
    log: ActionLog,
    locks: KeyedLocks,
}

impl InstanceLifecycleManager {
    pub fn new(
        instances: Arc<dyn Repository<ServiceInstance>>,
        bindings: Arc<dyn Repository<ServiceInstanceBinding>>,
        provider: Arc<dyn CopyProvider>,
        log: ActionLog,
    ) -> Self {
        Self {
            instances,
            bindings,
            provider,
            log,
            locks: KeyedLocks::new(),
        }
    }

    /// Exclusive access to one service instance's lifecycle.
    pub(crate) async fn lock_instance(&self, service_instance_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(service_instance_id).await
    }

    async fn load(&self, service_instance_id: &str) -> Result<Option<ServiceInstance>, BrokerError> {
        self.instances
            .find_by_id(service_instance_id)
            .await
            .map_err(BrokerError::storage)
    }

    async fn store(&self, instance: &ServiceInstance) -> Result<(), BrokerError> {
        self.instances
            .save(instance.clone())
            .await
            .map_err(BrokerError::storage)
    }

    /// Load an instance that must exist and not be deprovisioned.
    async fn load_live(&self, service_instance_id: &str) -> Result<ServiceInstance, BrokerError> {
        match self.load(service_instance_id).await? {
            None => Err(BrokerError::instance_not_found(service_instance_id)),
            Some(i) if i.state == InstanceState::Gone => {
                Err(BrokerError::Gone(service_instance_id.to_string()))
            }
            Some(i) => Ok(i),
        }
    }

    /// Move to a terminal failure and persist it. Used on error paths, so a
    /// storage failure here is logged rather than returned.
    async fn fail(&self, instance: &mut ServiceInstance, message: String) {
        instance.state = InstanceState::Failed;
        instance.message = Some(message.clone());
        instance.updated_at = Utc::now();
        if let Err(e) = self.store(instance).await {
            tracing::error!(
                service_instance_id = %instance.service_instance_id,
                error = %e,
                "failed to persist FAILED state"
            );
        }
        self.log
            .record_failure(&instance.service_instance_id, message)
            .await;
    }

    /// Start provisioning a copy of `source_instance_id`.
    ///
    /// Returns as soon as the provider has accepted the request; the returned
    /// record is always `IN_PROGRESS`. Completion is observed via `poll_status`.
    pub async fn provision(
        &self,
        service_instance_id: &str,
        source_instance_id: &str,
    ) -> Result<ServiceInstance, BrokerError> {
        let _guard = self.lock_instance(service_instance_id).await;

        if let Some(existing) = self.load(service_instance_id).await? {
            if !existing.state.allows_reprovision() {
                return Err(BrokerError::AlreadyExists(service_instance_id.to_string()));
            }
            self.discard_stale_copy(&existing).await;
        }

        let now = Utc::now();
        let mut instance = ServiceInstance {
            service_instance_id: service_instance_id.to_string(),
            copy_id: None,
            source_instance_id: source_instance_id.to_string(),
            state: InstanceState::InProgress,
            message: None,
            created_at: now,
            updated_at: now,
        };

        self.log
            .record(
                service_instance_id,
                BrokerActionState::InProgress,
                format!("Provisioning copy of {source_instance_id}"),
            )
            .await?;
        if let Err(e) = self.store(&instance).await {
            self.log
                .record_failure(service_instance_id, format!("Failed to record instance: {e}"))
                .await;
            return Err(e);
        }

        match self.provider.begin_copy(source_instance_id).await {
            Ok(copy_id) => {
                instance.copy_id = Some(copy_id.clone());
                instance.updated_at = Utc::now();
                if let Err(e) = self.store(&instance).await {
                    self.fail(&mut instance, format!("Failed to record copy {copy_id}: {e}"))
                        .await;
                    return Err(e);
                }
                // The copy exists and is recorded; the poller must still run.
                if let Err(e) = self
                    .log
                    .record(
                        service_instance_id,
                        BrokerActionState::InProgress,
                        format!("Copy {copy_id} started from {source_instance_id}"),
                    )
                    .await
                {
                    tracing::error!(
                        service_instance_id = %service_instance_id,
                        copy_id = %copy_id,
                        error = %e,
                        "failed to record copy start"
                    );
                }
                Ok(instance)
            }
            Err(e) => {
                self.fail(&mut instance, format!("Failed to start copy: {e}"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// A failed attempt may have left a half-built copy behind; best effort.
    async fn discard_stale_copy(&self, previous: &ServiceInstance) {
        if previous.state != InstanceState::Failed {
            return;
        }
        if let Some(copy_id) = &previous.copy_id {
            if let Err(e) = self.provider.delete_copy(copy_id).await {
                tracing::warn!(
                    service_instance_id = %previous.service_instance_id,
                    copy_id = %copy_id,
                    error = %e,
                    "failed to delete copy left by a failed provision"
                );
            }
        }
    }

    /// Current state without consulting the provider.
    pub async fn status(&self, service_instance_id: &str) -> Result<InstanceStatus, BrokerError> {
        let instance = self.load_live(service_instance_id).await?;
        Ok(InstanceStatus {
            state: instance.state,
            message: instance.message,
        })
    }

    /// Advance an in-progress provision by one readiness check.
    ///
    /// Not-ready leaves the record untouched. Terminal states are returned as-is
    /// without a provider call.
    pub async fn poll_status(&self, service_instance_id: &str) -> Result<InstanceStatus, BrokerError> {
        let _guard = self.lock_instance(service_instance_id).await;
        let instance = self.load_live(service_instance_id).await?;
        self.advance(instance).await
    }

    /// One readiness check on behalf of whoever is watching `attempt`.
    ///
    /// `None` once the instance belongs to a later provision attempt.
    pub async fn poll_attempt(
        &self,
        attempt: &ProvisionAttempt,
    ) -> Result<Option<InstanceStatus>, BrokerError> {
        let _guard = self.lock_instance(&attempt.service_instance_id).await;
        let instance = self.load_live(&attempt.service_instance_id).await?;
        if !attempt.matches(&instance) {
            return Ok(None);
        }
        self.advance(instance).await.map(Some)
    }

    async fn advance(&self, mut instance: ServiceInstance) -> Result<InstanceStatus, BrokerError> {
        if instance.state == InstanceState::InProgress {
            if let Some(copy_id) = instance.copy_id.clone() {
                let service_instance_id = instance.service_instance_id.clone();
                match self.provider.is_ready(&copy_id).await {
                    Ok(true) => {
                        instance.state = InstanceState::Succeeded;
                        instance.message = None;
                        instance.updated_at = Utc::now();
                        self.store(&instance).await?;
                        self.log
                            .record(
                                &service_instance_id,
                                BrokerActionState::Complete,
                                format!("Copy {copy_id} is ready"),
                            )
                            .await?;
                    }
                    Ok(false) => {
                        tracing::debug!(service_instance_id = %service_instance_id, copy_id = %copy_id, "copy not ready yet");
                    }
                    Err(e) => {
                        self.fail(&mut instance, format!("Copy {copy_id} failed: {e}"))
                            .await;
                    }
                }
            }
        }

        Ok(InstanceStatus {
            state: instance.state,
            message: instance.message,
        })
    }

    /// Give up on `attempt` after `attempts` readiness checks.
    ///
    /// Returns `TimedOut` when it moved the instance to `FAILED`. If the
    /// instance already reached a terminal state, or has been re-provisioned
    /// since, nothing changes and the current status is returned.
    pub async fn mark_timed_out(
        &self,
        attempt: &ProvisionAttempt,
        attempts: u32,
    ) -> Result<InstanceStatus, BrokerError> {
        let service_instance_id = attempt.service_instance_id.as_str();
        let _guard = self.lock_instance(service_instance_id).await;
        let mut instance = self.load_live(service_instance_id).await?;

        if instance.state != InstanceState::InProgress || !attempt.matches(&instance) {
            return Ok(InstanceStatus {
                state: instance.state,
                message: instance.message,
            });
        }

        let err = BrokerError::TimedOut {
            id: service_instance_id.to_string(),
            attempts,
        };
        self.fail(&mut instance, format!("Provisioning timed out: {err}"))
            .await;
        Err(err)
    }

    /// Tear down a copy. Requires a terminal state and no remaining bindings.
    pub async fn deprovision(&self, service_instance_id: &str) -> Result<ServiceInstance, BrokerError> {
        let _guard = self.lock_instance(service_instance_id).await;
        let mut instance = self.load_live(service_instance_id).await?;

        if instance.state == InstanceState::InProgress {
            return Err(BrokerError::Conflict(format!(
                "service instance {service_instance_id} is still being provisioned"
            )));
        }

        let bound = self
            .bindings
            .find_all()
            .await
            .map_err(BrokerError::storage)?
            .into_iter()
            .filter(|b| b.service_instance_id == service_instance_id)
            .count();
        if bound > 0 {
            return Err(BrokerError::Conflict(format!(
                "service instance {service_instance_id} still has {bound} binding(s)"
            )));
        }

        self.log
            .record(
                service_instance_id,
                BrokerActionState::InProgress,
                "Deprovisioning copy",
            )
            .await?;

        if let Some(copy_id) = &instance.copy_id {
            if let Err(e) = self.provider.delete_copy(copy_id).await {
                self.log
                    .record_failure(
                        service_instance_id,
                        format!("Failed to delete copy {copy_id}: {e}"),
                    )
                    .await;
                return Err(e.into());
            }
        }

        instance.state = InstanceState::Gone;
        instance.updated_at = Utc::now();
        if let Err(e) = self.store(&instance).await {
            self.log
                .record_failure(
                    service_instance_id,
                    format!("Copy deleted but failed to record removal: {e}"),
                )
                .await;
            return Err(e);
        }
        self.log
            .record(service_instance_id, BrokerActionState::Complete, "Deprovisioned copy")
            .await?;
        Ok(instance)
    }

    pub async fn get(&self, service_instance_id: &str) -> Result<Option<ServiceInstance>, BrokerError> {
        self.load(service_instance_id).await
    }

    /// Every instance that has not been deprovisioned.
    pub async fn list_live(&self) -> Result<Vec<ServiceInstance>, BrokerError> {
        let mut live: Vec<ServiceInstance> = self
            .instances
            .find_all()
            .await
            .map_err(BrokerError::storage)?
            .into_iter()
            .filter(|i| i.state != InstanceState::Gone)
            .collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(live)
    }

    /// `(source instance, copy)` for every live instance with a copy.
    pub async fn derive_pairs(&self) -> Result<Vec<InstancePair>, BrokerError> {
        Ok(self
            .list_live()
            .await?
            .into_iter()
            .filter_map(|i| {
                i.copy_id
                    .map(|copy_id| InstancePair::new(i.source_instance_id, copy_id))
            })
            .collect())
    }

    pub async fn resolve_copy_id(&self, service_instance_id: &str) -> Result<String, BrokerError> {
        let instance = self.load_live(service_instance_id).await?;
        instance
            .copy_id
            .ok_or(BrokerError::InstanceNotReady {
                id: instance.service_instance_id,
                state: instance.state,
            })
    }

    pub async fn resolve_source_instance_id(
        &self,
        service_instance_id: &str,
    ) -> Result<String, BrokerError> {
        Ok(self.load_live(service_instance_id).await?.source_instance_id)
    }

    /// Reconcile after a restart.
    ///
    /// Returns the ids whose copy is still being built so polling can resume.
    /// Instances that never got a copy id were interrupted before the provider
    /// accepted them and are failed.
    pub async fn recover(&self) -> Result<Vec<ProvisionAttempt>, BrokerError> {
        let pending: Vec<ServiceInstance> = self
            .instances
            .find_all()
            .await
            .map_err(BrokerError::storage)?
            .into_iter()
            .filter(|i| i.state == InstanceState::InProgress)
            .collect();

        let mut resumable = Vec::new();
        for instance in pending {
            let _guard = self.lock_instance(&instance.service_instance_id).await;
            let Some(mut current) = self.load(&instance.service_instance_id).await? else {
                continue;
            };
            if current.state != InstanceState::InProgress {
                continue;
            }
            if let Some(attempt) = ProvisionAttempt::of(&current) {
                resumable.push(attempt);
            } else {
                self.fail(
                    &mut current,
                    "Provisioning was interrupted before the copy was started".to_string(),
                )
                .await;
            }
        }

        tracing::info!(count = resumable.len(), "in-progress provisions to resume");
        Ok(resumable)
    }
}
