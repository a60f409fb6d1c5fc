use std::sync::Arc;

use crate::store::repository::ActionRepository;

use super::error::BrokerError;
use super::{BrokerAction, BrokerActionState};

/// Append-only audit trail of lifecycle transitions.
///
/// Shared by every manager. Nothing in the lifecycle reads it back to make a
/// decision; `history` and `latest` exist for operators.
#[derive(Clone)]
pub struct ActionLog {
    repo: Arc<dyn ActionRepository>,
}

impl ActionLog {
    pub fn new(repo: Arc<dyn ActionRepository>) -> Self {
        Self { repo }
    }

    /// Append one entry and mirror it to the tracing output.
    pub async fn record(
        &self,
        id: &str,
        state: BrokerActionState,
        message: impl Into<String>,
    ) -> Result<(), BrokerError> {
        let message = message.into();
        if state == BrokerActionState::Failed {
            tracing::error!(id = %id, state = ?state, "{message}");
        } else {
            tracing::info!(id = %id, state = ?state, "{message}");
        }
        self.repo
            .append(BrokerAction::new(id, state, message))
            .await
            .map_err(BrokerError::storage)
    }

    /// Like `record`, for failure paths that are already returning an error:
    /// a log write failure is reported but must not replace the original error.
    pub async fn record_failure(&self, id: &str, message: impl Into<String>) {
        if let Err(e) = self.record(id, BrokerActionState::Failed, message).await {
            tracing::error!(id = %id, error = %e, "failed to append FAILED action");
        }
    }

    pub async fn history(&self, id: &str) -> Result<Vec<BrokerAction>, BrokerError> {
        self.repo.find_by_id(id).await.map_err(BrokerError::storage)
    }

    pub async fn latest(&self, id: &str) -> Result<Option<BrokerAction>, BrokerError> {
        Ok(self.history(id).await?.pop())
    }
}
