use crate::{LifecycleConfig, LifecycleError};
use fidoreg_crypto::IntegritySigner;
use fidoreg_replication::{Operation, ReplicationPublisher};
use fidoreg_security::validate_registration;
use fidoreg_storage::{CredentialStore, SequenceService, StorageError};
use fidoreg_types::{
    now_seconds, AttestationRef, Credential, CredentialKey, DomainId, FidoProtocol, FidoVersion,
    KeyStatus, RegistrationRequest,
};
use std::sync::Arc;

/// Registration pipeline for new credentials.
///
/// validate, reject duplicates, allocate a key id, assemble, sign (when
/// enabled), persist, then replicate synchronously (in full replication
/// mode). A replication failure removes the freshly persisted row again and
/// queues a `Remove` event so peers that did take the row drop it too.
pub struct CredentialRegistrar {
    config: LifecycleConfig,
    store: Arc<dyn CredentialStore>,
    sequences: Arc<dyn SequenceService>,
    signer: Option<IntegritySigner>,
    replication: Option<Arc<ReplicationPublisher>>,
}

impl CredentialRegistrar {
    pub fn new(
        config: LifecycleConfig,
        store: Arc<dyn CredentialStore>,
        sequences: Arc<dyn SequenceService>,
    ) -> Self {
        Self {
            config,
            store,
            sequences,
            signer: None,
            replication: None,
        }
    }

    pub fn with_signer(mut self, signer: IntegritySigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_replication(mut self, publisher: Arc<ReplicationPublisher>) -> Self {
        self.replication = Some(publisher);
        self
    }

    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<Credential, LifecycleError> {
        validate_registration(request, &self.config.limits)?;
        let fields = Fields::from_request(request)?;
        tracing::debug!(
            domain_id = fields.domain_id,
            username = fields.username,
            "registering credential"
        );

        if self
            .store
            .by_username_and_key_handle(fields.domain_id, fields.username, fields.key_handle)?
            .is_some()
        {
            tracing::warn!(
                domain_id = fields.domain_id,
                username = fields.username,
                "key handle already registered"
            );
            return Err(LifecycleError::DuplicateCredential {
                domain_id: fields.domain_id,
                username: fields.username.to_string(),
            });
        }

        let key_id = self.sequences.next_key_id(fields.domain_id)?;
        let mut credential = self.assemble(request, &fields, key_id);

        if let Some(signer) = self.signer.as_ref().filter(|s| s.is_enabled()) {
            let signature = signer.sign_credential(&credential).map_err(|err| {
                tracing::error!(handle = %credential.handle, "refusing to persist unsigned credential: {err}");
                LifecycleError::SigningFailure(err.to_string())
            })?;
            credential.signature = Some(signature);
        }

        self.store.insert(&credential)?;

        if let Some(publisher) = self.replication.as_ref().filter(|p| p.emits_events()) {
            if let Err(err) = self.replicate(publisher, &credential).await {
                return self.withdraw(publisher, credential, err);
            }
        }

        tracing::info!(
            domain_id = fields.domain_id,
            username = fields.username,
            key_id,
            handle = %credential.handle,
            "credential registered"
        );
        Ok(credential)
    }

    async fn replicate(
        &self,
        publisher: &ReplicationPublisher,
        credential: &Credential,
    ) -> Result<(), LifecycleError> {
        let failure = |err: fidoreg_replication::ReplicationError| {
            LifecycleError::ReplicationFailure(err.to_string())
        };
        let message = publisher.prepare(Operation::Add, credential).map_err(failure)?;
        publisher.publish_and_wait(&message).await.map_err(failure)?;
        Ok(())
    }

    /// Undo a registration whose replication failed.
    ///
    /// A row that its owner already changed while the peers were awaited is
    /// kept: the status change queued its own event, which carries the full
    /// row to every peer.
    fn withdraw(
        &self,
        publisher: &ReplicationPublisher,
        credential: Credential,
        err: LifecycleError,
    ) -> Result<Credential, LifecycleError> {
        tracing::error!(handle = %credential.handle, "replication failed, rolling back: {err}");
        match self.store.rollback_insert(&credential) {
            Ok(()) => {}
            Err(StorageError::Conflict { .. }) => {
                tracing::warn!(
                    handle = %credential.handle,
                    "credential changed while awaiting peers; keeping it"
                );
                return self
                    .store
                    .by_key(
                        credential.key.server_id,
                        credential.domain_id(),
                        credential.key_id(),
                    )?
                    .ok_or_else(|| LifecycleError::NotFound(credential.handle.to_string()));
            }
            Err(rollback) => {
                tracing::error!(handle = %credential.handle, "rollback failed: {rollback}");
                return Err(err);
            }
        }

        let withdrawal = publisher
            .prepare(Operation::Remove, &credential)
            .and_then(|message| publisher.publish_detached(message));
        if let Err(queue) = withdrawal {
            tracing::error!(handle = %credential.handle, "withdrawal not queued for peers: {queue}");
        }
        Err(err)
    }

    fn assemble(&self, request: &RegistrationRequest, fields: &Fields<'_>, key_id: u64) -> Credential {
        let key = CredentialKey::new(self.config.server_id, fields.domain_id, fields.username, key_id);
        Credential {
            handle: key.handle(),
            key,
            user_id: request.user_id.clone(),
            key_handle: fields.key_handle.to_string(),
            public_key: fields.public_key.to_string(),
            app_id: request.app_id.clone(),
            transports: request.transports,
            attestation: request.attestation.map(|a| AttestationRef {
                server_id: a.server_id,
                domain_id: a.domain_id,
                certificate_id: a.certificate_id,
            }),
            counter: request.counter,
            fido_version: fields.fido_version,
            fido_protocol: fields.fido_protocol,
            aaguid: request.aaguid.clone(),
            registration_settings: request.registration_settings.clone(),
            registration_settings_version: request.registration_settings_version,
            create_location: fields.create_location.to_string(),
            create_date: now_seconds(),
            modify_location: None,
            modify_date: None,
            status: KeyStatus::Active,
            signature: None,
        }
    }
}

/// Required request fields, typed.
struct Fields<'a> {
    domain_id: DomainId,
    username: &'a str,
    key_handle: &'a str,
    public_key: &'a str,
    create_location: &'a str,
    fido_version: FidoVersion,
    fido_protocol: FidoProtocol,
}

impl<'a> Fields<'a> {
    fn from_request(request: &'a RegistrationRequest) -> Result<Self, LifecycleError> {
        let domain_id = request
            .domain_id
            .and_then(|d| DomainId::try_from(d).ok())
            .ok_or_else(|| invalid("domain_id", "must be a positive integer"))?;
        Ok(Self {
            domain_id,
            username: required(&request.username, "username")?,
            key_handle: required(&request.key_handle, "key_handle")?,
            public_key: required(&request.public_key, "public_key")?,
            create_location: required(&request.create_location, "create_location")?,
            fido_version: required(&request.fido_version, "fido_version")?
                .parse()
                .map_err(|e| invalid("fido_version", e))?,
            fido_protocol: required(&request.fido_protocol, "fido_protocol")?
                .parse()
                .map_err(|e| invalid("fido_protocol", e))?,
        })
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, LifecycleError> {
    value
        .as_deref()
        .ok_or_else(|| invalid(field, "is required"))
}

fn invalid(field: &str, reason: impl ToString) -> LifecycleError {
    LifecycleError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
