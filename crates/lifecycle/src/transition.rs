use crate::{DirectoryService, LifecycleConfig, LifecycleError, KEYS_ENABLED_ATTRIBUTE};
use fidoreg_crypto::IntegritySigner;
use fidoreg_replication::{Operation, ReplicationPublisher};
use fidoreg_security::validate_transition;
use fidoreg_storage::CredentialStore;
use fidoreg_types::{Credential, DomainId, Handle, KeyStatus, TransitionRequest};
use std::sync::Arc;

/// Status change requested by a credential's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Activate,
    Deactivate,
}

impl Transition {
    pub fn target(self) -> KeyStatus {
        match self {
            Transition::Activate => KeyStatus::Active,
            Transition::Deactivate => KeyStatus::Inactive,
        }
    }

    fn success_message(self) -> &'static str {
        match self {
            Transition::Activate => "Successfully activated the key",
            Transition::Deactivate => "Successfully deactivated the key",
        }
    }
}

/// Moves credentials between `ACTIVE` and `INACTIVE`.
///
/// The presented handle is the only proof of ownership, so it is rebuilt
/// from the caller's own domain and username plus the server and key id it
/// carries; anything but an exact match is an authorization failure. With
/// signing enabled, the stored row must verify before it is changed and
/// re-signed.
pub struct KeyStateMachine {
    config: LifecycleConfig,
    store: Arc<dyn CredentialStore>,
    signer: Option<IntegritySigner>,
    replication: Option<Arc<ReplicationPublisher>>,
    directory: Option<Arc<dyn DirectoryService>>,
}

impl KeyStateMachine {
    pub fn new(config: LifecycleConfig, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            config,
            store,
            signer: None,
            replication: None,
            directory: None,
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

    pub fn with_directory(mut self, directory: Arc<dyn DirectoryService>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub async fn activate(&self, request: &TransitionRequest) -> Result<String, LifecycleError> {
        self.execute(Transition::Activate, request).await
    }

    pub async fn deactivate(&self, request: &TransitionRequest) -> Result<String, LifecycleError> {
        self.execute(Transition::Deactivate, request).await
    }

    pub async fn execute(
        &self,
        transition: Transition,
        request: &TransitionRequest,
    ) -> Result<String, LifecycleError> {
        validate_transition(request, &self.config.limits)?;
        let (domain_id, username, presented) = session_fields(request)?;

        let decoded = Handle::decode(presented).map_err(|err| {
            tracing::warn!(username, handle = presented, "undecodable handle");
            LifecycleError::from(err)
        })?;
        let unauthorized = || LifecycleError::Authorization {
            username: username.to_string(),
            handle: presented.to_string(),
        };
        if decoded.recompute(domain_id, username).as_str() != presented {
            tracing::warn!(username, handle = presented, "handle does not belong to caller");
            return Err(unauthorized());
        }

        let current = self
            .store
            .by_key(decoded.server_id, domain_id, decoded.key_id)?
            .ok_or_else(|| LifecycleError::NotFound(presented.to_string()))?;
        if current.username() != username || current.handle.as_str() != presented {
            tracing::warn!(username, handle = presented, "stored credential has another owner");
            return Err(unauthorized());
        }

        let signer = self.signer.as_ref().filter(|s| s.is_enabled());
        if let Some(signer) = signer {
            verify_row(signer, &current)?;
        }

        let had_active = self.active_count(domain_id, username);

        let mut updated = current.clone();
        updated.transition(transition.target(), request.modify_location.as_deref());
        if let Some(signer) = signer {
            let signature = signer
                .sign_credential(&updated)
                .map_err(|err| LifecycleError::SigningFailure(err.to_string()))?;
            updated.signature = Some(signature);
        }
        self.store.compare_and_swap(&current, &updated)?;
        tracing::info!(
            domain_id,
            username,
            key_id = decoded.key_id,
            status = %updated.status,
            "credential status changed"
        );

        self.replicate(&updated);
        if let Some(before) = had_active {
            self.cascade(domain_id, username, before).await;
        }
        Ok(transition.success_message().to_string())
    }

    /// Active credential count, when directory sync needs it.
    fn active_count(&self, domain_id: DomainId, username: &str) -> Option<usize> {
        if !self.config.directory_sync || self.directory.is_none() {
            return None;
        }
        match self
            .store
            .by_username_and_status(domain_id, username, KeyStatus::Active)
        {
            Ok(active) => Some(active.len()),
            Err(err) => {
                tracing::error!(domain_id, username, "cannot read active credentials: {err}");
                None
            }
        }
    }

    /// Flip the directory flag when the user's set of active credentials
    /// goes from empty to non-empty or back. Failures are only logged.
    async fn cascade(&self, domain_id: DomainId, username: &str, before: usize) {
        let Some(directory) = &self.directory else {
            return;
        };
        let Some(after) = self.active_count(domain_id, username) else {
            return;
        };
        if (before == 0) == (after == 0) {
            return;
        }

        let enabled = if after > 0 { "true" } else { "false" };
        match directory
            .set_attribute(domain_id, username, KEYS_ENABLED_ATTRIBUTE, enabled, false)
            .await
        {
            Ok(()) => tracing::debug!(domain_id, username, enabled, "directory flag updated"),
            Err(err) => {
                tracing::error!(domain_id, username, enabled, "directory update failed: {err}")
            }
        }
    }

    fn replicate(&self, credential: &Credential) {
        let Some(publisher) = self.replication.as_ref().filter(|p| p.emits_events()) else {
            return;
        };
        let queued = publisher
            .prepare(Operation::Update, credential)
            .and_then(|message| publisher.publish_detached(message));
        if let Err(err) = queued {
            tracing::error!(handle = %credential.handle, "status change not queued for replication: {err}");
        }
    }
}

/// Refuse to act on a row whose stored signature no longer matches it.
fn verify_row(signer: &IntegritySigner, credential: &Credential) -> Result<(), LifecycleError> {
    let tampered = |detail: String| {
        tracing::error!(handle = %credential.handle, "integrity check failed: {detail}");
        LifecycleError::IntegrityViolation(credential.handle.to_string())
    };
    match signer.verify(credential) {
        Ok(true) => Ok(()),
        Ok(false) if credential.signature.is_none() => Err(tampered("row is unsigned".into())),
        Ok(false) => Err(tampered("signature does not match".into())),
        Err(err) => Err(tampered(err.to_string())),
    }
}

fn session_fields(request: &TransitionRequest) -> Result<(DomainId, &str, &str), LifecycleError> {
    let missing = |field: &str| LifecycleError::Validation {
        field: field.to_string(),
        reason: "is required".to_string(),
    };
    let domain_id = request
        .domain_id
        .and_then(|d| DomainId::try_from(d).ok())
        .ok_or_else(|| missing("domain_id"))?;
    let username = request.username.as_deref().ok_or_else(|| missing("username"))?;
    let handle = request.handle.as_deref().ok_or_else(|| missing("handle"))?;
    Ok((domain_id, username, handle))
}
