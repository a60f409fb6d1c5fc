use crate::copy::error::ProviderError;

use super::{InstanceState, ServiceInstanceBinding};

/// Errors from the provisioning and binding lifecycle.
///
/// Invariant violations (`AlreadyExists`, `DuplicateBinding`, `AlreadyBound`,
/// `InstanceNotReady`, `Conflict`) are detected before any provider call and
/// leave no state behind. `Provider` and `Storage` come from collaborators and
/// are returned unchanged after a `FAILED` action is recorded.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("service instance {0} already exists")]
    AlreadyExists(String),

    /// A binding with this id exists; carries it so retries can be recognised.
    #[error("binding {} already exists", .0.binding_id)]
    DuplicateBinding(Box<ServiceInstanceBinding>),

    /// The app already holds a binding to this instance.
    #[error("app {} is already bound to service instance {} by binding {}", .0.app_guid, .0.service_instance_id, .0.binding_id)]
    AlreadyBound(Box<ServiceInstanceBinding>),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("service instance {0} is gone")]
    Gone(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service instance {id} is not ready (state {state:?})")]
    InstanceNotReady { id: String, state: InstanceState },

    #[error("service instance {id} timed out after {attempts} readiness checks")]
    TimedOut { id: String, attempts: u32 },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BrokerError {
    pub fn instance_not_found(id: &str) -> Self {
        BrokerError::NotFound {
            kind: "service instance",
            id: id.to_string(),
        }
    }

    pub fn binding_not_found(id: &str) -> Self {
        BrokerError::NotFound {
            kind: "binding",
            id: id.to_string(),
        }
    }

    /// Wrap a repository failure. Keeps the full context chain in the message.
    pub fn storage(err: anyhow::Error) -> Self {
        BrokerError::Storage(format!("{err:#}"))
    }

    /// The pre-existing binding for duplicate / already-bound outcomes.
    pub fn existing_binding(&self) -> Option<&ServiceInstanceBinding> {
        match self {
            BrokerError::DuplicateBinding(b) | BrokerError::AlreadyBound(b) => Some(b),
            _ => None,
        }
    }
}
