use async_trait::async_trait;

use super::error::ProviderError;
use super::Credentials;

/// Produces and tears down point-in-time copies of a source instance.
///
/// One provider lives on the broker for the whole process. `begin_copy`
/// only starts the snapshot + relaunch; completion is observed through
/// `is_ready`.
#[async_trait]
pub trait CopyProvider: Send + Sync {
    /// Short name for logs (`vm-manager`, `simulated`).
    fn kind(&self) -> &'static str;

    /// Start copying `source_instance_id`. Returns the provider-assigned copy id.
    async fn begin_copy(&self, source_instance_id: &str) -> Result<String, ProviderError>;

    /// Whether the copy is running and reachable.
    ///
    /// Returns `Err(ProviderError::CopyFailed)` once the provider has given up
    /// on the copy.
    async fn is_ready(&self, copy_id: &str) -> Result<bool, ProviderError>;

    /// Connection credentials for a ready copy.
    async fn get_creds(&self, copy_id: &str) -> Result<Credentials, ProviderError>;

    /// Tear the copy down. Deleting an already-deleted copy is not an error.
    async fn delete_copy(&self, copy_id: &str) -> Result<(), ProviderError>;
}
