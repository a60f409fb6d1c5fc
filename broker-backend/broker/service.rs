//! Public orchestrators. The HTTP layer only talks to these.

use std::sync::Arc;

use crate::copy::provider::CopyProvider;
use crate::store::Stores;

use super::action_log::ActionLog;
use super::bindings::BindingManager;
use super::error::BrokerError;
use super::instances::{InstanceLifecycleManager, ProvisionAttempt};
use super::poller::{PollPolicy, ProvisionPoller};
use super::scripts::SanitizeScripts;
use super::{InstancePair, InstanceStatus, ServiceInstance, ServiceInstanceBinding};

/// Provision, poll and deprovision copies. Every accepted provision gets a
/// background poller.
pub struct ProvisioningService {
    instances: Arc<InstanceLifecycleManager>,
    poller: Arc<ProvisionPoller>,
}

impl ProvisioningService {
    pub fn new(instances: Arc<InstanceLifecycleManager>, poller: Arc<ProvisionPoller>) -> Self {
        Self { instances, poller }
    }

    pub async fn provision(
        &self,
        service_instance_id: &str,
        source_instance_id: &str,
    ) -> Result<ServiceInstance, BrokerError> {
        let instance = self
            .instances
            .provision(service_instance_id, source_instance_id)
            .await?;
        if let Some(attempt) = ProvisionAttempt::of(&instance) {
            self.poller.spawn(attempt);
        }
        Ok(instance)
    }

    /// Stored status; never calls the provider.
    pub async fn status(&self, service_instance_id: &str) -> Result<InstanceStatus, BrokerError> {
        self.instances.status(service_instance_id).await
    }

    /// Status for a polling client; performs one readiness check if needed.
    pub async fn last_operation(&self, service_instance_id: &str) -> Result<InstanceStatus, BrokerError> {
        self.instances.poll_status(service_instance_id).await
    }

    pub async fn deprovision(&self, service_instance_id: &str) -> Result<ServiceInstance, BrokerError> {
        self.instances.deprovision(service_instance_id).await
    }

    pub async fn instance(&self, service_instance_id: &str) -> Result<Option<ServiceInstance>, BrokerError> {
        self.instances.get(service_instance_id).await
    }

    pub async fn instances(&self) -> Result<Vec<ServiceInstance>, BrokerError> {
        self.instances.list_live().await
    }

    pub async fn instance_pairs(&self) -> Result<Vec<InstancePair>, BrokerError> {
        self.instances.derive_pairs().await
    }

    /// Restart polling for provisions interrupted by a restart.
    pub async fn resume_pending(&self) -> Result<usize, BrokerError> {
        let attempts = self.instances.recover().await?;
        let count = attempts.len();
        for attempt in attempts {
            self.poller.spawn(attempt);
        }
        Ok(count)
    }
}

/// What a bind request resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum BindOutcome {
    Created(ServiceInstanceBinding),
    /// Same binding id, instance and app as an existing binding: a retry.
    Existing(ServiceInstanceBinding),
}

impl BindOutcome {
    pub fn binding(&self) -> &ServiceInstanceBinding {
        match self {
            BindOutcome::Created(b) | BindOutcome::Existing(b) => b,
        }
    }
}

pub struct BindingService {
    bindings: Arc<BindingManager>,
}

impl BindingService {
    pub fn new(bindings: Arc<BindingManager>) -> Self {
        Self { bindings }
    }

    /// Create a binding. An identical retry resolves to `Existing`; a
    /// duplicate id with different attributes is still `DuplicateBinding`.
    pub async fn bind(
        &self,
        binding_id: &str,
        service_instance_id: &str,
        app_guid: &str,
    ) -> Result<BindOutcome, BrokerError> {
        match self
            .bindings
            .create_binding(binding_id, service_instance_id, app_guid)
            .await
        {
            Ok(binding) => Ok(BindOutcome::Created(binding)),
            Err(BrokerError::DuplicateBinding(existing))
                if existing.service_instance_id == service_instance_id
                    && existing.app_guid == app_guid =>
            {
                tracing::info!(binding_id = %binding_id, "bind retried for existing binding");
                Ok(BindOutcome::Existing(*existing))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unbind(&self, binding_id: &str) -> Result<ServiceInstanceBinding, BrokerError> {
        self.bindings.remove_binding(binding_id).await
    }

    pub async fn binding(&self, binding_id: &str) -> Result<Option<ServiceInstanceBinding>, BrokerError> {
        self.bindings.get_binding(binding_id).await
    }

    pub async fn bindings(&self) -> Result<Vec<ServiceInstanceBinding>, BrokerError> {
        self.bindings.list_bindings().await
    }

    pub async fn binding_pairs(&self) -> Result<Vec<InstancePair>, BrokerError> {
        self.bindings.derive_pairs().await
    }
}

/// The wired lifecycle engine.
#[derive(Clone)]
pub struct Broker {
    pub provisioning: Arc<ProvisioningService>,
    pub binding: Arc<BindingService>,
    pub actions: ActionLog,
    pub scripts: Arc<SanitizeScripts>,
    pub provider_kind: &'static str,
}

impl Broker {
    pub fn new(stores: &Stores, provider: Arc<dyn CopyProvider>, policy: PollPolicy) -> Self {
        let actions = ActionLog::new(stores.actions.clone());
        let instances = Arc::new(InstanceLifecycleManager::new(
            stores.instances.clone(),
            stores.bindings.clone(),
            provider.clone(),
            actions.clone(),
        ));
        let bindings = Arc::new(BindingManager::new(
            stores.bindings.clone(),
            instances.clone(),
            provider.clone(),
            actions.clone(),
        ));
        let poller = Arc::new(ProvisionPoller::new(instances.clone(), policy));

        Self {
            provisioning: Arc::new(ProvisioningService::new(instances, poller)),
            binding: Arc::new(BindingService::new(bindings)),
            actions,
            scripts: Arc::new(SanitizeScripts::new(stores.scripts.clone())),
            provider_kind: provider.kind(),
        }
    }
}
