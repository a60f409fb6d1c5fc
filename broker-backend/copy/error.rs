/// Errors from copy provider operations.
///
/// Backends map their transport and API failures into these variants.
/// `CopyFailed` is what a provider returns when the copy itself reached a
/// failed state (image creation or relaunch failed), as opposed to the
/// provider being unreachable.
#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("copy not found: {0}")]
    NotFound(String),

    #[error("begin copy failed: {0}")]
    Begin(String),

    #[error("copy failed: {0}")]
    CopyFailed(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),

    #[error("delete copy failed: {0}")]
    Delete(String),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_id() {
        let err = ProviderError::NotFound("copy-123".into());
        assert_eq!(err.to_string(), "copy not found: copy-123");
    }

    #[test]
    fn copy_failed_displays_reason() {
        let err = ProviderError::CopyFailed("image creation failed".into());
        assert_eq!(err.to_string(), "copy failed: image creation failed");
    }

    #[test]
    fn begin_credentials_delete_serde_backend_display() {
        assert_eq!(
            ProviderError::Begin("quota exceeded".into()).to_string(),
            "begin copy failed: quota exceeded"
        );
        assert_eq!(
            ProviderError::Credentials("no endpoint yet".into()).to_string(),
            "credentials unavailable: no endpoint yet"
        );
        assert_eq!(
            ProviderError::Delete("instance locked".into()).to_string(),
            "delete copy failed: instance locked"
        );
        assert_eq!(
            ProviderError::Serde("bad json".into()).to_string(),
            "serialization: bad json"
        );
        assert_eq!(
            ProviderError::Backend("connection refused".into()).to_string(),
            "backend error: connection refused"
        );
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProviderError>();
    }
}
