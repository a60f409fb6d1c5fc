use std::sync::Arc;

use chrono::Utc;

use crate::copy::provider::CopyProvider;
use crate::store::repository::Repository;

use super::action_log::ActionLog;
use super::error::BrokerError;
use super::instances::InstanceLifecycleManager;
use super::locks::KeyedLocks;
use super::{BrokerActionState, InstancePair, InstanceState, ServiceInstanceBinding};

/// Owns the binding set. Nothing else writes to the binding repository.
///
/// Lock order is instance key, then binding key. Creation holds both for the
/// whole check-then-act sequence so duplicate and already-bound checks are
/// race-free; removal only needs the binding key.
pub struct BindingManager {
    bindings: Arc<dyn Repository<ServiceInstanceBinding>>,
    instances: Arc<InstanceLifecycleManager>,
    provider: Arc<dyn CopyProvider>,
    log: ActionLog,
    locks: KeyedLocks,
}

impl BindingManager {
    pub fn new(
        bindings: Arc<dyn Repository<ServiceInstanceBinding>>,
        instances: Arc<InstanceLifecycleManager>,
        provider: Arc<dyn CopyProvider>,
        log: ActionLog,
    ) -> Self {
        Self {
            bindings,
            instances,
            provider,
            log,
            locks: KeyedLocks::new(),
        }
    }

    /// Issue credentials for `app_guid` against a ready copy.
    #[tracing::instrument(skip(self))]
    pub async fn create_binding(
        &self,
        binding_id: &str,
        service_instance_id: &str,
        app_guid: &str,
    ) -> Result<ServiceInstanceBinding, BrokerError> {
        let _instance_guard = self.instances.lock_instance(service_instance_id).await;
        let _binding_guard = self.locks.lock(binding_id).await;

        if let Some(existing) = self.get_binding(binding_id).await? {
            return Err(BrokerError::DuplicateBinding(Box::new(existing)));
        }
        if let Some(existing) = self
            .list_bindings()
            .await?
            .into_iter()
            .find(|b| b.app_guid == app_guid && b.service_instance_id == service_instance_id)
        {
            return Err(BrokerError::AlreadyBound(Box::new(existing)));
        }

        let instance = match self.instances.get(service_instance_id).await? {
            None => return Err(BrokerError::instance_not_found(service_instance_id)),
            Some(i) if i.state == InstanceState::Gone => {
                return Err(BrokerError::Gone(service_instance_id.to_string()));
            }
            Some(i) => i,
        };
        let copy_id = match (instance.state, instance.copy_id) {
            (InstanceState::Succeeded, Some(copy_id)) => copy_id,
            (state, _) => {
                return Err(BrokerError::InstanceNotReady {
                    id: service_instance_id.to_string(),
                    state,
                });
            }
        };

        self.log
            .record(
                binding_id,
                BrokerActionState::InProgress,
                format!("Creating service binding for app {app_guid}"),
            )
            .await?;

        let credentials = match self.provider.get_creds(&copy_id).await {
            Ok(c) => c,
            Err(e) => {
                self.log
                    .record_failure(binding_id, format!("Failed to bind app {app_guid}: {e}"))
                    .await;
                return Err(e.into());
            }
        };

        let binding = ServiceInstanceBinding {
            binding_id: binding_id.to_string(),
            service_instance_id: service_instance_id.to_string(),
            app_guid: app_guid.to_string(),
            credentials,
            created_at: Utc::now(),
        };
        if let Err(e) = self.bindings.save(binding.clone()).await {
            let err = BrokerError::storage(e);
            self.log
                .record_failure(binding_id, format!("Failed to bind app {app_guid}: {err}"))
                .await;
            return Err(err);
        }

        self.log
            .record(
                binding_id,
                BrokerActionState::Complete,
                format!("Created service binding for app {app_guid}"),
            )
            .await?;
        Ok(binding)
    }

    /// Drop a binding record. The copy's credentials are left alone; they go
    /// away with the copy at deprovision.
    #[tracing::instrument(skip(self))]
    pub async fn remove_binding(&self, binding_id: &str) -> Result<ServiceInstanceBinding, BrokerError> {
        let _binding_guard = self.locks.lock(binding_id).await;

        let binding = self
            .get_binding(binding_id)
            .await?
            .ok_or_else(|| BrokerError::binding_not_found(binding_id))?;

        self.log
            .record(binding_id, BrokerActionState::InProgress, "Removing binding")
            .await?;
        if let Err(e) = self.bindings.delete(binding_id).await {
            let err = BrokerError::storage(e);
            self.log
                .record_failure(binding_id, format!("Failed to remove binding: {err}"))
                .await;
            return Err(err);
        }
        self.log
            .record(binding_id, BrokerActionState::Complete, "Removed binding")
            .await?;
        Ok(binding)
    }

    pub async fn get_binding(&self, binding_id: &str) -> Result<Option<ServiceInstanceBinding>, BrokerError> {
        self.bindings
            .find_by_id(binding_id)
            .await
            .map_err(BrokerError::storage)
    }

    pub async fn list_bindings(&self) -> Result<Vec<ServiceInstanceBinding>, BrokerError> {
        self.bindings.find_all().await.map_err(BrokerError::storage)
    }

    /// One `(app, copy)` pair per binding.
    pub async fn derive_pairs(&self) -> Result<Vec<InstancePair>, BrokerError> {
        let mut bindings = self.list_bindings().await?;
        bindings.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut pairs = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let copy_id = self
                .instances
                .resolve_copy_id(&binding.service_instance_id)
                .await?;
            pairs.push(InstancePair::new(binding.app_guid, copy_id));
        }
        Ok(pairs)
    }
}
