use crate::{
    Envelope, EntityType, MemoryJournal, Operation, ReplicationMessage, ReplicationResponse,
    Watermarks,
};
use fidoreg_crypto::IntegritySigner;
use fidoreg_storage::{CredentialStore, StorageError};
use fidoreg_types::Credential;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Applies replicated events to the local store.
///
/// Remembers the highest sequence applied per `(origin, key)`. Anything at
/// or below it is acknowledged without being applied again. With a
/// verifier attached, rows whose integrity signature does not check out
/// are refused.
pub struct ReplicaApplier {
    store: Arc<dyn CredentialStore>,
    watermarks: Arc<dyn Watermarks>,
    verifier: Option<IntegritySigner>,
    serial: Mutex<()>,
}

impl ReplicaApplier {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            watermarks: Arc::new(MemoryJournal::new()),
            verifier: None,
            serial: Mutex::new(()),
        }
    }

    pub fn with_watermarks(mut self, watermarks: Arc<dyn Watermarks>) -> Self {
        self.watermarks = watermarks;
        self
    }

    pub fn with_verifier(mut self, verifier: IntegritySigner) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn apply(&self, message: &ReplicationMessage) -> ReplicationResponse {
        let _serial = self.serial.lock();
        match self
            .watermarks
            .last_applied(message.origin, &message.primary_key)
        {
            Ok(Some(last)) if message.sequence <= last => {
                tracing::debug!(
                    key = %message.primary_key,
                    sequence = message.sequence,
                    last,
                    "ignoring replayed or stale event"
                );
                return ReplicationResponse::ok("already applied");
            }
            Ok(_) => {}
            Err(err) => return ReplicationResponse::failed(format!("watermark unavailable: {err}")),
        }

        let outcome = match message.entity {
            EntityType::FidoKey => self.apply_credential(message),
        };
        match outcome {
            Ok(note) => {
                if let Err(err) =
                    self.watermarks
                        .record(message.origin, &message.primary_key, message.sequence)
                {
                    tracing::warn!(key = %message.primary_key, "watermark not recorded: {err}");
                }
                ReplicationResponse::ok(note)
            }
            Err(reason) => {
                tracing::warn!(
                    key = %message.primary_key,
                    origin = message.origin,
                    operation = ?message.operation,
                    "rejecting replicated event: {reason}"
                );
                ReplicationResponse::failed(reason)
            }
        }
    }

    fn apply_credential(&self, message: &ReplicationMessage) -> Result<&'static str, String> {
        let credential: Credential = serde_json::from_value(message.payload.clone())
            .map_err(|e| format!("undecodable payload: {e}"))?;
        if credential.handle.as_str() != message.primary_key || !credential.handle_is_consistent() {
            return Err("payload does not match its primary key".to_string());
        }
        self.check_signature(&credential)?;

        match message.operation {
            Operation::Add => match self.store.insert(&credential) {
                Ok(()) => Ok("applied"),
                Err(StorageError::Duplicate { .. }) => {
                    let existing = self
                        .store
                        .by_key(
                            credential.key.server_id,
                            credential.domain_id(),
                            credential.key_id(),
                        )
                        .map_err(|e| e.to_string())?;
                    match existing {
                        Some(_) => Ok("already present"),
                        None => Err("key handle already registered under another key".to_string()),
                    }
                }
                Err(err) => Err(err.to_string()),
            },
            Operation::Update => self
                .store
                .put(&credential)
                .map(|()| "applied")
                .map_err(|e| e.to_string()),
            Operation::Remove => match self.store.rollback_insert(&credential) {
                Ok(()) => Ok("removed"),
                Err(StorageError::Conflict { .. }) => {
                    tracing::warn!(
                        key = %message.primary_key,
                        "withdrawn credential changed since it was added; keeping it"
                    );
                    Ok("changed since added")
                }
                Err(err) => Err(err.to_string()),
            },
        }
    }

    fn check_signature(&self, credential: &Credential) -> Result<(), String> {
        let Some(verifier) = self.verifier.as_ref().filter(|v| v.is_enabled()) else {
            return Ok(());
        };
        match verifier.verify(credential) {
            Ok(true) => Ok(()),
            Ok(false) => Err("row signature missing or invalid".to_string()),
            Err(err) => Err(format!("row signature unverifiable: {err}")),
        }
    }

    /// Answer in-process deliveries until the inbox closes.
    pub async fn serve(self: Arc<Self>, mut inbox: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbox.recv().await {
            let response = self.apply(&envelope.message);
            if envelope.reply.send(response).is_err() {
                tracing::debug!("publisher went away before the acknowledgement");
            }
        }
    }
}
