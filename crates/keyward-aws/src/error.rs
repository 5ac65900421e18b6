use keyward_journal::JournalError;
use thiserror::Error;

use crate::client::ProviderError;

/// Errors from credential issuance and the lease lifecycle.
///
/// Recoverable errors are meant to be shown to the caller, who may retry the
/// whole operation. The rest are operational faults.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("identity provider is not configured: {0}")]
    Configuration(String),

    #[error("error writing journal entry: {0}")]
    JournalWrite(#[source] JournalError),

    #[error(transparent)]
    RemoteMutation(#[from] ProviderError),

    #[error("failed to commit journal entry for {username}: {source}")]
    JournalCommit {
        username: String,
        #[source]
        source: JournalError,
    },

    #[error("lease integrity violation: {0}")]
    LeaseIntegrity(String),

    #[error("lease can only be renewed up to {max_secs}s past original issue")]
    RenewalWindowExceeded { max_secs: u64 },

    #[error("configuration storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),
}

impl CredentialError {
    /// Whether the error should be reported to the caller as a soft failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CredentialError::Configuration(_)
                | CredentialError::RemoteMutation(_)
                | CredentialError::RenewalWindowExceeded { .. }
        )
    }
}

/// Errors from the backend configuration store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Errors from tearing down a remote identity.
#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("rollback of user {username} failed: {source}")]
    Provider {
        username: String,
        #[source]
        source: ProviderError,
    },

    #[error("invalid rollback payload: {0}")]
    InvalidPayload(String),

    #[error("identity client unavailable: {0}")]
    ClientUnavailable(String),
}
