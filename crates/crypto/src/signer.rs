use crate::{to_canonical_bytes, CryptoError, SigningService};
use fidoreg_types::{Credential, DomainId, RowSignature, SignatureKeyType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Integrity signing switches.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    pub enabled: bool,
    /// Derive keys from the keystore password instead of registered keys.
    pub standalone: bool,
    pub keystore_password: Option<String>,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("enabled", &self.enabled)
            .field("standalone", &self.standalone)
            .field(
                "keystore_password",
                &self.keystore_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// A tenant and the identity its rows are signed under.
#[derive(Clone, Serialize, Deserialize)]
pub struct DomainSettings {
    pub id: DomainId,
    pub signing_identity: String,
    #[serde(default)]
    pub seed_hex: Option<String>,
}

impl fmt::Debug for DomainSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainSettings")
            .field("id", &self.id)
            .field("signing_identity", &self.signing_identity)
            .finish_non_exhaustive()
    }
}

/// Signs and verifies whole credential rows.
#[derive(Clone)]
pub struct IntegritySigner {
    service: Arc<dyn SigningService>,
    config: SigningConfig,
    identities: HashMap<DomainId, String>,
}

impl IntegritySigner {
    pub fn new(
        service: Arc<dyn SigningService>,
        config: SigningConfig,
        domains: &[DomainSettings],
    ) -> Self {
        let identities = domains
            .iter()
            .map(|d| (d.id, d.signing_identity.clone()))
            .collect();
        Self {
            service,
            config,
            identities,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn signing_identity(&self, domain_id: DomainId) -> Result<&str, CryptoError> {
        self.identities
            .get(&domain_id)
            .map(String::as_str)
            .ok_or(CryptoError::UnknownDomain(domain_id))
    }

    /// Sign the canonical form of `credential` (its signature field is
    /// ignored). An empty answer from the service is an error.
    pub fn sign_credential(&self, credential: &Credential) -> Result<RowSignature, CryptoError> {
        let domain_id = credential.domain_id();
        let identity = self.signing_identity(domain_id)?;
        let payload = to_canonical_bytes(&credential.unsigned())?;

        let value = self
            .service
            .sign(
                domain_id,
                identity,
                &payload,
                self.config.standalone,
                self.config.keystore_password.as_deref(),
            )?
            .filter(|s| !s.is_empty())
            .ok_or(CryptoError::NoSignature(domain_id))?;

        Ok(RowSignature {
            key_type: SignatureKeyType::Ed25519,
            signer: identity.to_string(),
            value,
        })
    }

    /// True when the row carries a signature that still matches its
    /// content. Unsigned rows do not verify.
    pub fn verify(&self, credential: &Credential) -> Result<bool, CryptoError> {
        let Some(signature) = &credential.signature else {
            return Ok(false);
        };
        let domain_id = credential.domain_id();
        if signature.signer != self.signing_identity(domain_id)? {
            return Ok(false);
        }
        let payload = to_canonical_bytes(&credential.unsigned())?;
        self.service.verify(
            domain_id,
            &signature.signer,
            &payload,
            &signature.value,
            self.config.standalone,
            self.config.keystore_password.as_deref(),
        )
    }
}
