//! In-process copy provider.
//!
//! Used when no copy service is configured (local development) and as the
//! scripted provider in tests. A copy becomes ready after a configurable
//! number of readiness checks; failures can be injected per operation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::ProviderError;
use super::provider::CopyProvider;
use super::Credentials;

#[derive(Debug, Clone)]
struct SimulatedCopy {
    source_instance_id: String,
    checks: u32,
    failure: Option<String>,
}

#[derive(Default)]
struct SimState {
    copies: HashMap<String, SimulatedCopy>,
    deleted: Vec<String>,
    fail_next_begin: Option<String>,
    fail_creds: Option<String>,
    fail_delete: Option<String>,
}

pub struct SimulatedCopyProvider {
    ready_after_checks: u32,
    state: Mutex<SimState>,
}

impl SimulatedCopyProvider {
    /// A copy reports ready on the `ready_after_checks`-th readiness check.
    /// Zero means ready on the first check.
    pub fn new(ready_after_checks: u32) -> Self {
        Self {
            ready_after_checks,
            state: Mutex::new(SimState::default()),
        }
    }

    /// The next `begin_copy` fails with `reason`.
    pub async fn fail_next_begin(&self, reason: &str) {
        self.state.lock().await.fail_next_begin = Some(reason.to_string());
    }

    /// Mark an existing copy as failed; the next readiness check reports it.
    pub async fn fail_copy(&self, copy_id: &str, reason: &str) {
        if let Some(copy) = self.state.lock().await.copies.get_mut(copy_id) {
            copy.failure = Some(reason.to_string());
        }
    }

    /// Every `get_creds` fails with `reason` until cleared with `None`.
    pub async fn fail_creds(&self, reason: Option<&str>) {
        self.state.lock().await.fail_creds = reason.map(String::from);
    }

    /// Every `delete_copy` fails with `reason` until cleared with `None`.
    pub async fn fail_delete(&self, reason: Option<&str>) {
        self.state.lock().await.fail_delete = reason.map(String::from);
    }

    /// Copy ids passed to `delete_copy`, in call order.
    pub async fn deleted(&self) -> Vec<String> {
        self.state.lock().await.deleted.clone()
    }

    /// Number of readiness checks made against `copy_id`.
    pub async fn checks(&self, copy_id: &str) -> u32 {
        self.state
            .lock()
            .await
            .copies
            .get(copy_id)
            .map(|c| c.checks)
            .unwrap_or(0)
    }
}

fn credentials_for(copy_id: &str, source_instance_id: &str) -> Credentials {
    let value = json!({
        "uri": format!("postgres://broker@{copy_id}.copies.internal:5432/{source_instance_id}"),
        "host": format!("{copy_id}.copies.internal"),
        "port": 5432,
        "copy_id": copy_id,
    });
    match value {
        serde_json::Value::Object(map) => map,
        _ => Credentials::new(),
    }
}

#[async_trait]
impl CopyProvider for SimulatedCopyProvider {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    async fn begin_copy(&self, source_instance_id: &str) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = state.fail_next_begin.take() {
            return Err(ProviderError::Begin(reason));
        }
        let copy_id = format!("copy-{}", Uuid::new_v4().simple());
        state.copies.insert(
            copy_id.clone(),
            SimulatedCopy {
                source_instance_id: source_instance_id.to_string(),
                checks: 0,
                failure: None,
            },
        );
        tracing::debug!(copy_id = %copy_id, source_instance_id = %source_instance_id, "simulated copy started");
        Ok(copy_id)
    }

    async fn is_ready(&self, copy_id: &str) -> Result<bool, ProviderError> {
        let mut state = self.state.lock().await;
        let copy = state
            .copies
            .get_mut(copy_id)
            .ok_or_else(|| ProviderError::NotFound(copy_id.to_string()))?;
        if let Some(reason) = &copy.failure {
            return Err(ProviderError::CopyFailed(reason.clone()));
        }
        copy.checks += 1;
        Ok(copy.checks >= self.ready_after_checks)
    }

    async fn get_creds(&self, copy_id: &str) -> Result<Credentials, ProviderError> {
        let state = self.state.lock().await;
        if let Some(reason) = &state.fail_creds {
            return Err(ProviderError::Credentials(reason.clone()));
        }
        let copy = state
            .copies
            .get(copy_id)
            .ok_or_else(|| ProviderError::NotFound(copy_id.to_string()))?;
        Ok(credentials_for(copy_id, &copy.source_instance_id))
    }

    async fn delete_copy(&self, copy_id: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.fail_delete {
            return Err(ProviderError::Delete(reason.clone()));
        }
        state.copies.remove(copy_id);
        state.deleted.push(copy_id.to_string());
        Ok(())
    }
}
