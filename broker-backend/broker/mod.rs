pub mod action_log;
pub mod bindings;
pub mod error;
pub mod instances;
pub mod locks;
pub mod poller;
pub mod scripts;
pub mod service;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::copy::Credentials;
use crate::store::repository::Entity;

/// Outcome recorded for a broker operation in the action log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerActionState {
    InProgress,
    Complete,
    Failed,
}

/// One append-only audit entry. `id` is the operation key: a binding id or a
/// service-instance id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerAction {
    pub id: String,
    pub state: BrokerActionState,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl BrokerAction {
    pub fn new(id: impl Into<String>, state: BrokerActionState, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Lifecycle state of a provisioned copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    InProgress,
    Succeeded,
    Failed,
    /// Deprovisioned. Kept as a tombstone so lookups can tell "gone" from
    /// "never existed".
    Gone,
}

impl InstanceState {
    /// Wire form used by the broker protocol's `last_operation.state`.
    pub fn as_protocol_str(self) -> &'static str {
        match self {
            InstanceState::InProgress => "in progress",
            InstanceState::Succeeded => "succeeded",
            InstanceState::Failed => "failed",
            InstanceState::Gone => "gone",
        }
    }

    /// Whether a new provision may reuse the id.
    pub fn allows_reprovision(self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::Gone)
    }
}

/// One provisioned copy of a source instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_instance_id: String,
    /// Provider-assigned id; `None` until `begin_copy` returns.
    #[serde(default)]
    pub copy_id: Option<String>,
    pub source_instance_id: String,
    pub state: InstanceState,
    /// Failure reason or other detail for the last transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity for ServiceInstance {
    const KIND: &'static str = "instances";

    fn entity_id(&self) -> &str {
        &self.service_instance_id
    }
}

/// Snapshot returned by a status poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub state: InstanceState,
    pub message: Option<String>,
}

/// One application's access grant to a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceBinding {
    pub binding_id: String,
    pub service_instance_id: String,
    pub app_guid: String,
    pub credentials: Credentials,
    pub created_at: DateTime<Utc>,
}

impl Entity for ServiceInstanceBinding {
    const KIND: &'static str = "bindings";

    fn entity_id(&self) -> &str {
        &self.binding_id
    }
}

/// Read-only reporting view: what is bound to which copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstancePair {
    /// App guid for binding pairs, source instance id for instance pairs.
    pub source: String,
    pub copy: String,
}

impl InstancePair {
    pub fn new(source: impl Into<String>, copy: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            copy: copy.into(),
        }
    }
}

/// Uploaded SQL applied to copies before binding. Stored as a singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizeScript {
    pub id: String,
    pub script: String,
    pub updated_at: DateTime<Utc>,
}

impl SanitizeScript {
    pub const ID: &'static str = "current";
}

impl Entity for SanitizeScript {
    const KIND: &'static str = "scripts";

    fn entity_id(&self) -> &str {
        &self.id
    }
}
