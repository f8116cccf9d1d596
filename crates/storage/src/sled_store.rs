use crate::keys::{self, PrimaryKey};
use crate::{CredentialFinder, CredentialStore, Result, SequenceService, StorageError};
use fidoreg_types::{Credential, DomainId, KeyId, KeyStatus, ServerId};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use std::path::Path;

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<StorageError>>;

/// Sled-backed implementation
///
/// Three trees: `credentials` keyed by `(server, domain, key id)`,
/// `key_handles` enforcing `(domain, username, key handle)` uniqueness and
/// pointing at the primary key, and `sequences` holding the counters.
pub struct SledStorage {
    db: Db,
    credentials: Tree,
    key_handles: Tree,
    sequences: Tree,
}

impl SledStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let credentials = db.open_tree("credentials")?;
        let key_handles = db.open_tree("key_handles")?;
        let sequences = db.open_tree("sequences")?;
        tracing::debug!(credentials = credentials.len(), "opened credential store");

        Ok(Self {
            db,
            credentials,
            key_handles,
            sequences,
        })
    }

    /// Number of persisted credentials.
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    fn load(&self, primary: &PrimaryKey) -> Result<Option<Credential>> {
        self.credentials
            .get(primary)?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    /// Underlying database, for components that keep their own trees next
    /// to the credentials.
    pub fn database(&self) -> &Db {
        &self.db
    }

    fn increment(&self, key: &[u8]) -> Result<u64> {
        let name = || String::from_utf8_lossy(key).into_owned();
        // unreadable or exhausted counters are left untouched so no value is reissued
        let previous = self.sequences.fetch_and_update(key, |old| match old {
            None => Some(1u64.to_be_bytes().to_vec()),
            Some(bytes) => match keys::decode_counter(bytes).and_then(|c| c.checked_add(1)) {
                Some(next) => Some(next.to_be_bytes().to_vec()),
                None => Some(bytes.to_vec()),
            },
        })?;

        match previous {
            None => Ok(1),
            Some(bytes) => match keys::decode_counter(&bytes) {
                Some(u64::MAX) => Err(StorageError::Exhausted(name())),
                Some(current) => Ok(current + 1),
                None => Err(StorageError::Corrupt(name())),
            },
        }
    }
}

fn settle<T>(result: std::result::Result<T, TransactionError<StorageError>>) -> Result<T> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => StorageError::Database(err),
    })
}

fn abort<T>(err: StorageError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn decode_in_tx(bytes: &[u8]) -> TxResult<Credential> {
    serde_json::from_slice(bytes)
        .map_err(|e| ConflictableTransactionError::Abort(StorageError::Serialization(e)))
}

impl CredentialFinder for SledStorage {
    fn by_username_and_key_handle(
        &self,
        domain_id: DomainId,
        username: &str,
        key_handle: &str,
    ) -> Result<Option<Credential>> {
        let index = keys::key_handle(domain_id, username, key_handle);
        let Some(primary) = self.key_handles.get(&index)? else {
            return Ok(None);
        };
        let primary: PrimaryKey = primary
            .as_ref()
            .try_into()
            .map_err(|_| StorageError::Corrupt(format!("key handle index of {username}")))?;
        self.load(&primary)
    }

    fn by_username_and_status(
        &self,
        domain_id: DomainId,
        username: &str,
        status: KeyStatus,
    ) -> Result<Vec<Credential>> {
        let mut out = Vec::new();
        for item in self.key_handles.scan_prefix(keys::user_prefix(domain_id, username)) {
            let (_, primary) = item?;
            let Some(value) = self.credentials.get(&primary)? else {
                tracing::warn!(domain_id, username, "key handle index points at a missing row");
                continue;
            };
            let credential: Credential = serde_json::from_slice(&value)?;
            if credential.status == status {
                out.push(credential);
            }
        }
        out.sort_by_key(Credential::key_id);
        Ok(out)
    }

    fn by_key(
        &self,
        server_id: ServerId,
        domain_id: DomainId,
        key_id: KeyId,
    ) -> Result<Option<Credential>> {
        self.load(&keys::primary(server_id, domain_id, key_id))
    }
}

impl CredentialStore for SledStorage {
    fn insert(&self, credential: &Credential) -> Result<()> {
        let primary = keys::primary_of(credential);
        let index = keys::key_handle_of(credential);
        let value = serde_json::to_vec(credential)?;

        settle(
            (&self.credentials, &self.key_handles).transaction(|(credentials, key_handles)| {
                if key_handles.get(&index)?.is_some() || credentials.get(primary)?.is_some() {
                    return abort(StorageError::Duplicate {
                        domain_id: credential.domain_id(),
                        username: credential.username().to_string(),
                    });
                }
                credentials.insert(&primary[..], value.clone())?;
                key_handles.insert(index.clone(), &primary[..])?;
                Ok(())
            }),
        )
    }

    fn rollback_insert(&self, credential: &Credential) -> Result<()> {
        let primary = keys::primary_of(credential);
        let index = keys::key_handle_of(credential);

        settle(
            (&self.credentials, &self.key_handles).transaction(|(credentials, key_handles)| {
                let Some(stored) = credentials.get(primary)? else {
                    return Ok(());
                };
                if &decode_in_tx(&stored)? != credential {
                    return abort(StorageError::Conflict {
                        server_id: credential.key.server_id,
                        domain_id: credential.domain_id(),
                        key_id: credential.key_id(),
                    });
                }
                if let Some(owner) = key_handles.get(&index)? {
                    if owner.as_ref() == &primary[..] {
                        key_handles.remove(index.clone())?;
                    }
                }
                credentials.remove(&primary[..])?;
                Ok(())
            }),
        )
    }

    fn compare_and_swap(&self, current: &Credential, updated: &Credential) -> Result<()> {
        let primary = keys::primary_of(current);
        let conflict = || StorageError::Conflict {
            server_id: current.key.server_id,
            domain_id: current.domain_id(),
            key_id: current.key_id(),
        };
        if keys::primary_of(updated) != primary
            || keys::key_handle_of(updated) != keys::key_handle_of(current)
        {
            return Err(conflict());
        }
        let value = serde_json::to_vec(updated)?;

        settle(self.credentials.transaction(|credentials| {
            let Some(stored) = credentials.get(primary)? else {
                return abort(StorageError::NotFound {
                    server_id: current.key.server_id,
                    domain_id: current.domain_id(),
                    key_id: current.key_id(),
                });
            };
            if &decode_in_tx(&stored)? != current {
                return abort(conflict());
            }
            credentials.insert(&primary[..], value.clone())?;
            Ok(())
        }))
    }

    fn put(&self, credential: &Credential) -> Result<()> {
        let primary = keys::primary_of(credential);
        let index = keys::key_handle_of(credential);
        let value = serde_json::to_vec(credential)?;

        settle(
            (&self.credentials, &self.key_handles).transaction(|(credentials, key_handles)| {
                if let Some(owner) = key_handles.get(&index)? {
                    if owner.as_ref() != &primary[..] {
                        return abort(StorageError::Duplicate {
                            domain_id: credential.domain_id(),
                            username: credential.username().to_string(),
                        });
                    }
                }
                if let Some(previous) = credentials.insert(&primary[..], value.clone())? {
                    let previous_index = keys::key_handle_of(&decode_in_tx(&previous)?);
                    if previous_index != index {
                        key_handles.remove(previous_index)?;
                    }
                }
                key_handles.insert(index.clone(), &primary[..])?;
                Ok(())
            }),
        )
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl SequenceService for SledStorage {
    fn next_key_id(&self, domain_id: DomainId) -> Result<KeyId> {
        self.increment(&keys::key_id_sequence(domain_id))
    }

    fn next_policy_id(&self) -> Result<u64> {
        self.increment(keys::POLICY_SEQUENCE)
    }

    fn next_attestation_certificate_id(&self) -> Result<u64> {
        self.increment(keys::ATTESTATION_SEQUENCE)
    }
}
