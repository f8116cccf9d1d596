use crate::{CryptoError, DomainSettings, SigningService};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use fidoreg_types::DomainId;
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::HashMap;

const DERIVATION_CONTEXT: &str = "fidoreg/row-signing/v1";

struct DomainKey {
    identity: String,
    signing_key: SigningKey,
}

/// Ed25519 keys per domain.
///
/// Registered keys are used in the normal mode. In standalone mode the key
/// is derived from the keystore password with HKDF-SHA256, salted with the
/// signer identity, so no key material needs to be provisioned.
#[derive(Default)]
pub struct Keyring {
    keys: HashMap<DomainId, DomainKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a keyring from configured domains; domains without a seed get
    /// no key and can only sign in standalone mode.
    pub fn from_domains(domains: &[DomainSettings]) -> Result<Self, CryptoError> {
        let mut keyring = Self::new();
        for domain in domains {
            let Some(seed_hex) = &domain.seed_hex else {
                continue;
            };
            let seed = decode_seed(domain.id, seed_hex)?;
            keyring.insert(domain.id, &domain.signing_identity, SigningKey::from_bytes(&seed));
        }
        Ok(keyring)
    }

    pub fn insert(&mut self, domain_id: DomainId, identity: &str, signing_key: SigningKey) {
        self.keys.insert(
            domain_id,
            DomainKey {
                identity: identity.to_string(),
                signing_key,
            },
        );
    }

    /// Hex-encoded public key registered for a domain.
    pub fn public_key_hex(&self, domain_id: DomainId) -> Option<String> {
        self.keys
            .get(&domain_id)
            .map(|k| hex::encode(k.signing_key.verifying_key().to_bytes()))
    }

    fn resolve(
        &self,
        domain_id: DomainId,
        signer_identity: &str,
        standalone: bool,
        keystore_password: Option<&str>,
    ) -> Result<Option<SigningKey>, CryptoError> {
        if standalone {
            let Some(password) = keystore_password else {
                tracing::warn!(domain_id, "standalone signing requested without a keystore password");
                return Ok(None);
            };
            return derive_key(domain_id, signer_identity, password).map(Some);
        }

        match self.keys.get(&domain_id) {
            Some(key) if key.identity == signer_identity => Ok(Some(key.signing_key.clone())),
            Some(_) => {
                tracing::warn!(domain_id, signer_identity, "signer identity does not match the domain key");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

impl SigningService for Keyring {
    fn sign(
        &self,
        domain_id: DomainId,
        signer_identity: &str,
        payload: &[u8],
        standalone: bool,
        keystore_password: Option<&str>,
    ) -> Result<Option<String>, CryptoError> {
        let key = self.resolve(domain_id, signer_identity, standalone, keystore_password)?;
        Ok(key.map(|key| STANDARD.encode(key.sign(payload).to_bytes())))
    }

    fn verify(
        &self,
        domain_id: DomainId,
        signer_identity: &str,
        payload: &[u8],
        signature: &str,
        standalone: bool,
        keystore_password: Option<&str>,
    ) -> Result<bool, CryptoError> {
        let Some(key) = self.resolve(domain_id, signer_identity, standalone, keystore_password)?
        else {
            return Ok(false);
        };
        let bytes = STANDARD
            .decode(signature)
            .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
        let signature = Signature::from_slice(&bytes)
            .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
        Ok(key.verifying_key().verify(payload, &signature).is_ok())
    }
}

fn derive_key(
    domain_id: DomainId,
    signer_identity: &str,
    password: &str,
) -> Result<SigningKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(signer_identity.as_bytes()), password.as_bytes());
    let info = format!("{DERIVATION_CONTEXT}/{domain_id}");
    let mut seed = [0u8; 32];
    hk.expand(info.as_bytes(), &mut seed)
        .map_err(|_| CryptoError::Derivation(domain_id))?;
    Ok(SigningKey::from_bytes(&seed))
}

fn decode_seed(domain_id: DomainId, seed_hex: &str) -> Result<[u8; 32], CryptoError> {
    let invalid = |reason: String| CryptoError::InvalidSeed { domain_id, reason };
    let bytes = hex::decode(seed_hex.trim()).map_err(|e| invalid(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| invalid(format!("expected 32 bytes, got {}", b.len())))
}
