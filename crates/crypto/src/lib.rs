//! Tamper evidence for persisted credential rows.
//!
//! A row is serialized canonically (sorted keys, no whitespace, signature
//! removed) and signed by the owning domain's identity through a
//! [`SigningService`]. [`Keyring`] is the in-process Ed25519 implementation;
//! [`IntegritySigner`] binds the service to the signing configuration.

use fidoreg_types::DomainId;
use thiserror::Error;

pub mod canonical;
pub mod keyring;
pub mod signer;

pub use canonical::{to_canonical_bytes, to_canonical_json};
pub use keyring::Keyring;
pub use signer::{DomainSettings, IntegritySigner, SigningConfig};

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("canonical serialization failed: {0}")]
    Canonical(#[from] serde_json::Error),
    #[error("no signing identity configured for domain {0}")]
    UnknownDomain(DomainId),
    #[error("invalid signing seed for domain {domain_id}: {reason}")]
    InvalidSeed { domain_id: DomainId, reason: String },
    #[error("key derivation failed for domain {0}")]
    Derivation(DomainId),
    #[error("signing service returned no signature for domain {0}")]
    NoSignature(DomainId),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
}

/// Signing oracle.
///
/// `sign` answers `Ok(None)` when it has no key for the requested identity;
/// callers treat that the same as a failure.
pub trait SigningService: Send + Sync {
    fn sign(
        &self,
        domain_id: DomainId,
        signer_identity: &str,
        payload: &[u8],
        standalone: bool,
        keystore_password: Option<&str>,
    ) -> Result<Option<String>, CryptoError>;

    /// Check a base64 signature produced by [`sign`](Self::sign).
    fn verify(
        &self,
        domain_id: DomainId,
        signer_identity: &str,
        payload: &[u8],
        signature: &str,
        standalone: bool,
        keystore_password: Option<&str>,
    ) -> Result<bool, CryptoError>;
}
