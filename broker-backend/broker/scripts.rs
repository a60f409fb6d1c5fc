//! The sanitize script: SQL run against a fresh copy before it is handed to
//! applications. At most one is stored; an empty upload clears it.

use std::sync::Arc;

use chrono::Utc;

use crate::store::repository::Repository;

use super::SanitizeScript;
use super::error::BrokerError;

pub struct SanitizeScripts {
    repo: Arc<dyn Repository<SanitizeScript>>,
}

impl SanitizeScripts {
    pub fn new(repo: Arc<dyn Repository<SanitizeScript>>) -> Self {
        Self { repo }
    }

    pub async fn current(&self) -> Result<Option<SanitizeScript>, BrokerError> {
        self.repo
            .find_by_id(SanitizeScript::ID)
            .await
            .map_err(BrokerError::storage)
    }

    /// Store `script`, replacing any previous one. Blank input removes it and
    /// returns `None`.
    pub async fn replace(&self, script: &str) -> Result<Option<SanitizeScript>, BrokerError> {
        if script.trim().is_empty() {
            let removed = self
                .repo
                .delete(SanitizeScript::ID)
                .await
                .map_err(BrokerError::storage)?;
            if removed {
                tracing::info!("sanitize script cleared");
            }
            return Ok(None);
        }

        let stored = SanitizeScript {
            id: SanitizeScript::ID.to_string(),
            script: script.to_string(),
            updated_at: Utc::now(),
        };
        self.repo
            .save(stored.clone())
            .await
            .map_err(BrokerError::storage)?;
        tracing::info!(bytes = script.len(), "sanitize script updated");
        Ok(Some(stored))
    }
}
