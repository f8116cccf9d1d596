use crate::{DomainId, FidoProtocol, FidoVersion, Handle, KeyId, KeyStatus, ServerId};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Composite primary key of a credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialKey {
    pub server_id: ServerId,
    pub domain_id: DomainId,
    pub username: String,
    pub key_id: KeyId,
}

impl CredentialKey {
    pub fn new(
        server_id: ServerId,
        domain_id: DomainId,
        username: impl Into<String>,
        key_id: KeyId,
    ) -> Self {
        Self {
            server_id,
            domain_id,
            username: username.into(),
            key_id,
        }
    }

    pub fn handle(&self) -> Handle {
        Handle::compose(self.server_id, self.domain_id, &self.username, self.key_id)
    }
}

/// Reference to the attestation certificate that vouched for the
/// authenticator at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRef {
    pub server_id: ServerId,
    pub domain_id: DomainId,
    pub certificate_id: u64,
}

/// Algorithm family of a row signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureKeyType {
    #[serde(rename = "Ed25519")]
    Ed25519,
}

/// Detached signature over the canonical serialization of a record.
///
/// Key type and signature value live together so a record is either fully
/// signed or not signed at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSignature {
    pub key_type: SignatureKeyType,
    pub signer: String,
    /// Base64 signature bytes.
    pub value: String,
}

/// A registered authenticator public-key record bound to a user in a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(flatten)]
    pub key: CredentialKey,
    pub handle: Handle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub key_handle: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transports: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationRef>,
    pub counter: u32,
    pub fido_version: FidoVersion,
    pub fido_protocol: FidoProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aaguid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_settings: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_settings_version: Option<i32>,
    pub create_location: String,
    pub create_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify_date: Option<DateTime<Utc>>,
    pub status: KeyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<RowSignature>,
}

impl Credential {
    pub fn domain_id(&self) -> DomainId {
        self.key.domain_id
    }

    pub fn username(&self) -> &str {
        &self.key.username
    }

    pub fn key_id(&self) -> KeyId {
        self.key.key_id
    }

    pub fn is_active(&self) -> bool {
        self.status == KeyStatus::Active
    }

    /// True when the stored handle still matches the one recomputed from the
    /// key fields.
    pub fn handle_is_consistent(&self) -> bool {
        self.handle == self.key.handle()
    }

    /// Copy of the record without its detached signature; this is the form
    /// that gets signed.
    pub fn unsigned(&self) -> Credential {
        Credential {
            signature: None,
            ..self.clone()
        }
    }

    /// Apply a status transition, stamping the modification metadata.
    pub fn transition(&mut self, status: KeyStatus, modify_location: Option<&str>) {
        self.status = status;
        self.modify_location = modify_location.map(str::to_string);
        self.modify_date = Some(now_seconds());
        self.signature = None;
    }
}

/// Current UTC time truncated to whole seconds.
pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
