use crate::models::TaskId;
use crate::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("setting {0:?} not found")]
    SettingNotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_) | StoreError::SettingNotFound(_))
    }
}

/// Failures talking to a remote service (task provider, backup blob store, calendar).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("session expired, sign in again")]
    AuthExpired,
    #[error("temporary remote failure: {0}")]
    Transient(String),
    #[error("remote http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("unexpected remote payload: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Classifies an HTTP status that is not a success.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => RemoteError::AuthExpired,
            429 | 500..=599 => RemoteError::Transient(format!("http {status}: {message}")),
            _ => RemoteError::Http { status, message },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("restore replaces all local tasks and must be confirmed")]
    ConfirmationRequired,
    #[error("no cloud backup found")]
    NothingToRestore,
}

impl SyncError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, SyncError::Remote(RemoteError::AuthExpired))
    }
}

/// Failures of a command routed to whichever side owns an item.
#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("no item with key {0:?}")]
    UnknownKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("the assistant returned an empty response")]
    Empty,
    #[error("could not read the assistant response: {0}")]
    Parse(String),
    #[error("{0}")]
    Service(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(RemoteError::from_status(401, "x"), RemoteError::AuthExpired);
        assert!(RemoteError::from_status(429, "slow down").is_transient());
        assert!(RemoteError::from_status(503, "down").is_transient());
        assert_eq!(
            RemoteError::from_status(404, "gone"),
            RemoteError::Http {
                status: 404,
                message: "gone".to_string()
            }
        );
        assert!(!RemoteError::AuthExpired.is_transient());
    }

    #[test]
    fn sync_error_detects_auth_expiry() {
        assert!(SyncError::from(RemoteError::AuthExpired).is_auth_expired());
        assert!(!SyncError::ConfirmationRequired.is_auth_expired());
        assert!(StoreError::NotFound(3).is_not_found());
    }
}
