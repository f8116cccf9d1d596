//! Byte layout of sled keys.
//!
//! Numbers are big-endian so that lexicographic order matches numeric order.

use fidoreg_types::{Credential, DomainId, KeyId, ServerId};

pub(crate) type PrimaryKey = [u8; 18];

pub(crate) fn primary(server_id: ServerId, domain_id: DomainId, key_id: KeyId) -> PrimaryKey {
    let mut key = [0u8; 18];
    key[..2].copy_from_slice(&server_id.to_be_bytes());
    key[2..10].copy_from_slice(&domain_id.to_be_bytes());
    key[10..].copy_from_slice(&key_id.to_be_bytes());
    key
}

pub(crate) fn primary_of(credential: &Credential) -> PrimaryKey {
    primary(
        credential.key.server_id,
        credential.domain_id(),
        credential.key_id(),
    )
}

/// Prefix shared by every key handle a user registered in a domain.
pub(crate) fn user_prefix(domain_id: DomainId, username: &str) -> Vec<u8> {
    let name = username.as_bytes();
    let mut key = Vec::with_capacity(12 + name.len());
    key.extend_from_slice(&domain_id.to_be_bytes());
    key.extend_from_slice(&(name.len() as u32).to_be_bytes());
    key.extend_from_slice(name);
    key
}

/// Unique index key for `(domain, username, key handle)`.
pub(crate) fn key_handle(domain_id: DomainId, username: &str, key_handle: &str) -> Vec<u8> {
    let mut key = user_prefix(domain_id, username);
    key.extend_from_slice(key_handle.as_bytes());
    key
}

pub(crate) fn key_handle_of(credential: &Credential) -> Vec<u8> {
    key_handle(
        credential.domain_id(),
        credential.username(),
        &credential.key_handle,
    )
}

pub(crate) fn key_id_sequence(domain_id: DomainId) -> Vec<u8> {
    let mut key = b"key_id/".to_vec();
    key.extend_from_slice(&domain_id.to_be_bytes());
    key
}

pub(crate) const POLICY_SEQUENCE: &[u8] = b"policy_id";
pub(crate) const ATTESTATION_SEQUENCE: &[u8] = b"attestation_certificate_id";

pub(crate) fn decode_counter(bytes: &[u8]) -> Option<u64> {
    let array: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(array))
}
