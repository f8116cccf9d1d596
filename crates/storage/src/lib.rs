use fidoreg_types::{Credential, DomainId, KeyId, KeyStatus, ServerId};

mod keys;
mod memory;
mod sled_store;

pub use memory::MemoryStorage;
pub use sled_store::SledStorage;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Credential already exists for domain {domain_id}, user {username}")]
    Duplicate { domain_id: DomainId, username: String },
    #[error("Credential {server_id}/{domain_id}/{key_id} not found")]
    NotFound {
        server_id: ServerId,
        domain_id: DomainId,
        key_id: KeyId,
    },
    #[error("Credential {server_id}/{domain_id}/{key_id} was modified concurrently")]
    Conflict {
        server_id: ServerId,
        domain_id: DomainId,
        key_id: KeyId,
    },
    #[error("Corrupt value under {0}")]
    Corrupt(String),
    #[error("Sequence {0} is exhausted")]
    Exhausted(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Read access to persisted credentials.
pub trait CredentialFinder: Send + Sync {
    /// The credential registered for `key_handle` by `username` in a domain.
    fn by_username_and_key_handle(
        &self,
        domain_id: DomainId,
        username: &str,
        key_handle: &str,
    ) -> Result<Option<Credential>>;

    /// All credentials of `username` in a domain that are in `status`,
    /// ordered by key id.
    fn by_username_and_status(
        &self,
        domain_id: DomainId,
        username: &str,
        status: KeyStatus,
    ) -> Result<Vec<Credential>>;

    fn by_key(
        &self,
        server_id: ServerId,
        domain_id: DomainId,
        key_id: KeyId,
    ) -> Result<Option<Credential>>;
}

/// Durable identifier allocation.
///
/// Every call is an atomic increment of a persisted counter; a value is
/// handed out at most once, even across restarts.
pub trait SequenceService: Send + Sync {
    fn next_key_id(&self, domain_id: DomainId) -> Result<KeyId>;
    fn next_policy_id(&self) -> Result<u64>;
    fn next_attestation_certificate_id(&self) -> Result<u64>;
}

/// Write access to persisted credentials.
pub trait CredentialStore: CredentialFinder {
    /// Persist a new credential.
    ///
    /// Fails with [`StorageError::Duplicate`] when `(domain, username,
    /// key handle)` or the primary key is already taken. The check and the
    /// write happen atomically.
    fn insert(&self, credential: &Credential) -> Result<()>;

    /// Undo an [`insert`](Self::insert). Missing rows are ignored. A row
    /// that no longer equals `credential` stays in place and the call fails
    /// with [`StorageError::Conflict`].
    fn rollback_insert(&self, credential: &Credential) -> Result<()>;

    /// Replace `current` with `updated` only if the stored row still equals
    /// `current`; otherwise [`StorageError::Conflict`].
    fn compare_and_swap(&self, current: &Credential, updated: &Credential) -> Result<()>;

    /// Insert or overwrite a credential by primary key. Used when applying
    /// replicated state.
    fn put(&self, credential: &Credential) -> Result<()>;

    fn flush(&self) -> Result<()>;
}
