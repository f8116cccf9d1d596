use crate::{CredentialFinder, CredentialStore, Result, SequenceService, StorageError};
use fidoreg_types::{Credential, DomainId, KeyId, KeyStatus, ServerId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Primary = (ServerId, DomainId, KeyId);
type KeyHandleIndex = (DomainId, String, String);

#[derive(Default)]
struct Inner {
    credentials: BTreeMap<Primary, Credential>,
    key_handles: HashMap<KeyHandleIndex, Primary>,
    key_ids: HashMap<DomainId, KeyId>,
    policy_id: u64,
    attestation_certificate_id: u64,
}

/// In-memory backend with the same atomicity guarantees as [`SledStorage`].
///
/// A single lock covers rows, index and counters so every operation is
/// one critical section. Clones share state.
///
/// [`SledStorage`]: crate::SledStorage
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Inner>>,
}

fn primary_of(credential: &Credential) -> Primary {
    (
        credential.key.server_id,
        credential.domain_id(),
        credential.key_id(),
    )
}

fn index_of(credential: &Credential) -> KeyHandleIndex {
    (
        credential.domain_id(),
        credential.username().to_string(),
        credential.key_handle.clone(),
    )
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialFinder for MemoryStorage {
    fn by_username_and_key_handle(
        &self,
        domain_id: DomainId,
        username: &str,
        key_handle: &str,
    ) -> Result<Option<Credential>> {
        let inner = self.inner.read();
        let index = (domain_id, username.to_string(), key_handle.to_string());
        Ok(inner
            .key_handles
            .get(&index)
            .and_then(|primary| inner.credentials.get(primary))
            .cloned())
    }

    fn by_username_and_status(
        &self,
        domain_id: DomainId,
        username: &str,
        status: KeyStatus,
    ) -> Result<Vec<Credential>> {
        let mut out: Vec<Credential> = self
            .inner
            .read()
            .credentials
            .values()
            .filter(|c| c.domain_id() == domain_id && c.username() == username)
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        out.sort_by_key(Credential::key_id);
        Ok(out)
    }

    fn by_key(
        &self,
        server_id: ServerId,
        domain_id: DomainId,
        key_id: KeyId,
    ) -> Result<Option<Credential>> {
        Ok(self
            .inner
            .read()
            .credentials
            .get(&(server_id, domain_id, key_id))
            .cloned())
    }
}

impl CredentialStore for MemoryStorage {
    fn insert(&self, credential: &Credential) -> Result<()> {
        let primary = primary_of(credential);
        let index = index_of(credential);
        let mut inner = self.inner.write();
        if inner.key_handles.contains_key(&index) || inner.credentials.contains_key(&primary) {
            return Err(StorageError::Duplicate {
                domain_id: credential.domain_id(),
                username: credential.username().to_string(),
            });
        }
        inner.credentials.insert(primary, credential.clone());
        inner.key_handles.insert(index, primary);
        Ok(())
    }

    fn rollback_insert(&self, credential: &Credential) -> Result<()> {
        let primary = primary_of(credential);
        let index = index_of(credential);
        let mut inner = self.inner.write();
        match inner.credentials.get(&primary) {
            None => return Ok(()),
            Some(stored) if stored != credential => {
                return Err(StorageError::Conflict {
                    server_id: primary.0,
                    domain_id: primary.1,
                    key_id: primary.2,
                })
            }
            Some(_) => {}
        }
        if inner.key_handles.get(&index) == Some(&primary) {
            inner.key_handles.remove(&index);
        }
        inner.credentials.remove(&primary);
        Ok(())
    }

    fn compare_and_swap(&self, current: &Credential, updated: &Credential) -> Result<()> {
        let primary = primary_of(current);
        let conflict = || StorageError::Conflict {
            server_id: primary.0,
            domain_id: primary.1,
            key_id: primary.2,
        };
        if primary_of(updated) != primary || index_of(updated) != index_of(current) {
            return Err(conflict());
        }

        let mut inner = self.inner.write();
        match inner.credentials.get_mut(&primary) {
            None => Err(StorageError::NotFound {
                server_id: primary.0,
                domain_id: primary.1,
                key_id: primary.2,
            }),
            Some(stored) if *stored != *current => Err(conflict()),
            Some(stored) => {
                *stored = updated.clone();
                Ok(())
            }
        }
    }

    fn put(&self, credential: &Credential) -> Result<()> {
        let primary = primary_of(credential);
        let index = index_of(credential);
        let mut inner = self.inner.write();
        if matches!(inner.key_handles.get(&index), Some(owner) if *owner != primary) {
            return Err(StorageError::Duplicate {
                domain_id: credential.domain_id(),
                username: credential.username().to_string(),
            });
        }
        if let Some(previous) = inner.credentials.insert(primary, credential.clone()) {
            let previous_index = index_of(&previous);
            if previous_index != index {
                inner.key_handles.remove(&previous_index);
            }
        }
        inner.key_handles.insert(index, primary);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn bump(counter: &mut u64, name: impl FnOnce() -> String) -> Result<u64> {
    *counter = counter
        .checked_add(1)
        .ok_or_else(|| StorageError::Exhausted(name()))?;
    Ok(*counter)
}

impl SequenceService for MemoryStorage {
    fn next_key_id(&self, domain_id: DomainId) -> Result<KeyId> {
        let mut inner = self.inner.write();
        let counter = inner.key_ids.entry(domain_id).or_insert(0);
        bump(counter, || format!("key_id/{domain_id}"))
    }

    fn next_policy_id(&self) -> Result<u64> {
        bump(&mut self.inner.write().policy_id, || "policy_id".to_string())
    }

    fn next_attestation_certificate_id(&self) -> Result<u64> {
        bump(&mut self.inner.write().attestation_certificate_id, || {
            "attestation_certificate_id".to_string()
        })
    }
}
