//! Durable replication bookkeeping.
//!
//! The outbox journal holds detached events until a delivery succeeds, so a
//! restart replays them instead of losing them. Watermarks record the
//! highest sequence applied per `(origin, key)` on the receiving side; there
//! is one entry per replicated credential.

use crate::ReplicationMessage;
use fidoreg_types::ServerId;
use parking_lot::Mutex;
use sled::{Db, Tree};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal database error: {0}")]
    Database(#[from] sled::Error),
    #[error("journal serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt journal entry: {0}")]
    Corrupt(String),
}

/// Events waiting for delivery, keyed by sequence.
pub trait OutboxJournal: Send + Sync {
    fn append(&self, message: &ReplicationMessage) -> Result<(), JournalError>;
    /// Forget an event once it has been delivered.
    fn acknowledge(&self, sequence: u64) -> Result<(), JournalError>;
    /// Undelivered events in issue order.
    fn pending(&self) -> Result<Vec<ReplicationMessage>, JournalError>;
}

/// Highest sequence applied per `(origin, primary key)`.
pub trait Watermarks: Send + Sync {
    fn last_applied(&self, origin: ServerId, key: &str) -> Result<Option<u64>, JournalError>;
    fn record(&self, origin: ServerId, key: &str, sequence: u64) -> Result<(), JournalError>;
}

/// Process-local journal; state ends with the process.
#[derive(Default)]
pub struct MemoryJournal {
    outbox: Mutex<BTreeMap<u64, ReplicationMessage>>,
    watermarks: Mutex<HashMap<(ServerId, String), u64>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutboxJournal for MemoryJournal {
    fn append(&self, message: &ReplicationMessage) -> Result<(), JournalError> {
        self.outbox.lock().insert(message.sequence, message.clone());
        Ok(())
    }

    fn acknowledge(&self, sequence: u64) -> Result<(), JournalError> {
        self.outbox.lock().remove(&sequence);
        Ok(())
    }

    fn pending(&self) -> Result<Vec<ReplicationMessage>, JournalError> {
        Ok(self.outbox.lock().values().cloned().collect())
    }
}

impl Watermarks for MemoryJournal {
    fn last_applied(&self, origin: ServerId, key: &str) -> Result<Option<u64>, JournalError> {
        Ok(self
            .watermarks
            .lock()
            .get(&(origin, key.to_string()))
            .copied())
    }

    fn record(&self, origin: ServerId, key: &str, sequence: u64) -> Result<(), JournalError> {
        let mut watermarks = self.watermarks.lock();
        let entry = watermarks.entry((origin, key.to_string())).or_insert(0);
        *entry = (*entry).max(sequence);
        Ok(())
    }
}

/// Sled-backed journal living in the node's database.
///
/// Two trees: `replication_outbox` keyed by big-endian sequence, and
/// `replication_watermarks` keyed by `origin || primary key`.
pub struct SledJournal {
    outbox: Tree,
    watermarks: Tree,
}

impl SledJournal {
    pub fn open(db: &Db) -> Result<Self, JournalError> {
        let outbox = db.open_tree("replication_outbox")?;
        let watermarks = db.open_tree("replication_watermarks")?;
        tracing::debug!(pending = outbox.len(), "opened replication journal");
        Ok(Self { outbox, watermarks })
    }
}

fn watermark_key(origin: ServerId, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + key.len());
    out.extend_from_slice(&origin.to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

fn decode_sequence(bytes: &[u8]) -> Result<u64, JournalError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| JournalError::Corrupt(format!("{} byte watermark", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

impl OutboxJournal for SledJournal {
    fn append(&self, message: &ReplicationMessage) -> Result<(), JournalError> {
        let value = serde_json::to_vec(message)?;
        self.outbox.insert(message.sequence.to_be_bytes(), value)?;
        self.outbox.flush()?;
        Ok(())
    }

    fn acknowledge(&self, sequence: u64) -> Result<(), JournalError> {
        self.outbox.remove(sequence.to_be_bytes())?;
        Ok(())
    }

    fn pending(&self) -> Result<Vec<ReplicationMessage>, JournalError> {
        self.outbox
            .iter()
            .values()
            .map(|value| -> Result<ReplicationMessage, JournalError> {
                Ok(serde_json::from_slice(&value?)?)
            })
            .collect()
    }
}

impl Watermarks for SledJournal {
    fn last_applied(&self, origin: ServerId, key: &str) -> Result<Option<u64>, JournalError> {
        self.watermarks
            .get(watermark_key(origin, key))?
            .map(|bytes| decode_sequence(&bytes))
            .transpose()
    }

    fn record(&self, origin: ServerId, key: &str, sequence: u64) -> Result<(), JournalError> {
        let mut corrupt = false;
        self.watermarks
            .fetch_and_update(watermark_key(origin, key), |old| {
                let current = match old.map(decode_sequence) {
                    None => 0,
                    Some(Ok(current)) => current,
                    Some(Err(_)) => {
                        corrupt = true;
                        0
                    }
                };
                Some(current.max(sequence).to_be_bytes().to_vec())
            })?;
        if corrupt {
            tracing::warn!(origin, key, "replaced unreadable watermark");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityType, Operation};

    fn message(sequence: u64) -> ReplicationMessage {
        ReplicationMessage {
            origin: 5,
            sequence,
            entity: EntityType::FidoKey,
            operation: Operation::Update,
            primary_key: format!("5-1-alice-{sequence}"),
            payload: serde_json::Value::Null,
            issued_at: fidoreg_types::now_seconds(),
        }
    }

    #[test]
    fn sled_outbox_survives_reopen_in_issue_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let journal = SledJournal::open(&db).unwrap();
            for sequence in [300, 2, 41] {
                journal.append(&message(sequence)).unwrap();
            }
            journal.acknowledge(41).unwrap();
            journal.record(5, "5-1-alice-1", 9).unwrap();
            journal.record(5, "5-1-alice-1", 4).unwrap();
            db.flush().unwrap();
        }

        let db = sled::open(dir.path()).unwrap();
        let journal = SledJournal::open(&db).unwrap();
        let pending: Vec<u64> = journal.pending().unwrap().iter().map(|m| m.sequence).collect();
        assert_eq!(pending, vec![2, 300]);
        assert_eq!(journal.last_applied(5, "5-1-alice-1").unwrap(), Some(9));
        assert_eq!(journal.last_applied(6, "5-1-alice-1").unwrap(), None);
    }

    #[test]
    fn memory_watermarks_only_move_forward() {
        let journal = MemoryJournal::new();
        journal.record(5, "k", 7).unwrap();
        journal.record(5, "k", 3).unwrap();
        assert_eq!(journal.last_applied(5, "k").unwrap(), Some(7));
    }
}
