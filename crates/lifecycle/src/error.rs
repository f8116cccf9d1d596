use fidoreg_security::ValidationError;
use fidoreg_storage::StorageError;
use fidoreg_types::{DomainId, HandleError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },
    #[error("a credential with this key handle already exists for {username} in domain {domain_id}")]
    DuplicateCredential { domain_id: DomainId, username: String },
    #[error("credential {0} not found")]
    NotFound(String),
    #[error("{username} is not authorized to change credential {handle}")]
    Authorization { username: String, handle: String },
    #[error("invalid handle: {0}")]
    InvalidHandle(#[from] HandleError),
    #[error("integrity signing failed: {0}")]
    SigningFailure(String),
    #[error("credential {0} failed its integrity check")]
    IntegrityViolation(String),
    #[error("persistence failed: {0}")]
    PersistenceFailure(String),
    #[error("replication failed: {0}")]
    ReplicationFailure(String),
}

impl LifecycleError {
    /// Stable machine-readable key for the error class.
    pub fn error_key(&self) -> &'static str {
        match self {
            LifecycleError::Validation { .. } => "validation_error",
            LifecycleError::DuplicateCredential { .. } => "duplicate_credential",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::Authorization { .. } => "authorization_error",
            LifecycleError::InvalidHandle(_) => "invalid_handle",
            LifecycleError::SigningFailure(_) => "signing_failure",
            LifecycleError::IntegrityViolation(_) => "integrity_violation",
            LifecycleError::PersistenceFailure(_) => "persistence_failure",
            LifecycleError::ReplicationFailure(_) => "replication_failure",
        }
    }
}

impl From<ValidationError> for LifecycleError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Rejected(issue) => LifecycleError::Validation {
                field: issue.field,
                reason: issue.message,
            },
            ValidationError::Serialization(reason) => LifecycleError::Validation {
                field: "request".to_string(),
                reason,
            },
        }
    }
}

impl From<StorageError> for LifecycleError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Duplicate { domain_id, username } => {
                LifecycleError::DuplicateCredential { domain_id, username }
            }
            StorageError::NotFound {
                server_id,
                domain_id,
                key_id,
            } => LifecycleError::NotFound(format!("{server_id}/{domain_id}/{key_id}")),
            other => LifecycleError::PersistenceFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_onto_taxonomy() {
        let dup: LifecycleError = StorageError::Duplicate {
            domain_id: 1,
            username: "alice".into(),
        }
        .into();
        assert_eq!(dup.error_key(), "duplicate_credential");

        let conflict: LifecycleError = StorageError::Conflict {
            server_id: 1,
            domain_id: 1,
            key_id: 2,
        }
        .into();
        assert_eq!(conflict.error_key(), "persistence_failure");
    }

    #[test]
    fn handle_errors_are_invalid_handle() {
        let err: LifecycleError = HandleError::Empty.into();
        assert_eq!(err.error_key(), "invalid_handle");
    }
}
