use crate::{
    JournalError, MemoryJournal, Operation, OutboxJournal, ReplicationMessage, ReplicationResponse,
    ReplicationTransport, TransportError,
};
use chrono::Utc;
use fidoreg_types::{Credential, ServerId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// How much of the lifecycle is propagated to peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    #[default]
    Disabled,
    /// Peers converge through bulk state sync; no per-operation events.
    StateOnly,
    Full,
}

/// Configuration for [`ReplicationPublisher`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub mode: ReplicationMode,
    /// Base URLs of peer nodes.
    pub peers: Vec<String>,
    /// Shared secret peers present on the replication listener.
    pub peer_token: Option<String>,
    /// Upper bound on waiting for peer acknowledgements.
    pub ack_timeout_ms: u64,
    /// First retry delay on the asynchronous path; grows linearly per attempt.
    pub retry_backoff_ms: u64,
    /// Cap on the retry delay. Detached events are retried until delivered.
    pub max_backoff_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Disabled,
            peers: Vec::new(),
            peer_token: None,
            ack_timeout_ms: 5_000,
            retry_backoff_ms: 200,
            max_backoff_ms: 30_000,
        }
    }
}

impl fmt::Debug for ReplicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationConfig")
            .field("mode", &self.mode)
            .field("peers", &self.peers)
            .field("peer_token", &self.peer_token.as_ref().map(|_| "<redacted>"))
            .field("ack_timeout_ms", &self.ack_timeout_ms)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .finish()
    }
}

impl ReplicationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let delay = self.retry_backoff_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),
    #[error("peer rejected the event: {0}")]
    Rejected(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode event: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("replication outbox is closed")]
    OutboxClosed,
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Issues replication events for this node.
///
/// Synchronous publishes wait for the acknowledgement (bounded by
/// `ack_timeout_ms`) and leave the failure decision to the caller. Detached
/// publishes are journaled, then drained in issue order by a single
/// [`OutboxWorker`] that retries each event until a delivery succeeds.
pub struct ReplicationPublisher {
    origin: ServerId,
    config: ReplicationConfig,
    transport: Arc<dyn ReplicationTransport>,
    journal: Arc<dyn OutboxJournal>,
    sequence: AtomicU64,
    outbox: mpsc::UnboundedSender<ReplicationMessage>,
}

impl ReplicationPublisher {
    /// Publisher with a process-local journal.
    pub fn new(
        origin: ServerId,
        config: ReplicationConfig,
        transport: Arc<dyn ReplicationTransport>,
    ) -> (Self, OutboxWorker) {
        Self::assemble(origin, config, transport, Arc::new(MemoryJournal::new()), Vec::new())
    }

    /// Publisher whose undelivered events survive restarts. Events left in
    /// the journal by a previous run are delivered first.
    pub fn with_journal(
        origin: ServerId,
        config: ReplicationConfig,
        transport: Arc<dyn ReplicationTransport>,
        journal: Arc<dyn OutboxJournal>,
    ) -> Result<(Self, OutboxWorker), ReplicationError> {
        let backlog = journal.pending()?;
        if !backlog.is_empty() {
            tracing::info!(pending = backlog.len(), "replaying undelivered replication events");
        }
        Ok(Self::assemble(origin, config, transport, journal, backlog))
    }

    fn assemble(
        origin: ServerId,
        config: ReplicationConfig,
        transport: Arc<dyn ReplicationTransport>,
        journal: Arc<dyn OutboxJournal>,
        backlog: Vec<ReplicationMessage>,
    ) -> (Self, OutboxWorker) {
        let (outbox, queue) = mpsc::unbounded_channel();
        // Seeded from the clock so numbering keeps increasing across restarts.
        let clock = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let start = backlog.iter().map(|m| m.sequence).fold(clock, u64::max);
        let worker = OutboxWorker {
            transport: Arc::clone(&transport),
            journal: Arc::clone(&journal),
            queue,
            backlog,
            config: config.clone(),
        };
        let publisher = Self {
            origin,
            config,
            transport,
            journal,
            sequence: AtomicU64::new(start),
            outbox,
        };
        (publisher, worker)
    }

    /// Build a publisher and run its outbox on the current tokio runtime.
    pub fn spawn(
        origin: ServerId,
        config: ReplicationConfig,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Arc<Self> {
        let (publisher, worker) = Self::new(origin, config, transport);
        tokio::spawn(worker.run());
        Arc::new(publisher)
    }

    /// [`spawn`](Self::spawn) over a durable journal.
    pub fn spawn_with_journal(
        origin: ServerId,
        config: ReplicationConfig,
        transport: Arc<dyn ReplicationTransport>,
        journal: Arc<dyn OutboxJournal>,
    ) -> Result<Arc<Self>, ReplicationError> {
        let (publisher, worker) = Self::with_journal(origin, config, transport, journal)?;
        tokio::spawn(worker.run());
        Ok(Arc::new(publisher))
    }

    pub fn mode(&self) -> ReplicationMode {
        self.config.mode
    }

    /// Whether lifecycle operations emit per-operation events.
    pub fn emits_events(&self) -> bool {
        self.config.mode == ReplicationMode::Full
    }

    pub fn prepare(
        &self,
        operation: Operation,
        credential: &Credential,
    ) -> Result<ReplicationMessage, ReplicationError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ReplicationMessage::for_credential(
            self.origin,
            sequence,
            operation,
            credential,
        )?)
    }

    /// Deliver and wait for the acknowledgement.
    pub async fn publish_and_wait(
        &self,
        message: &ReplicationMessage,
    ) -> Result<ReplicationResponse, ReplicationError> {
        let limit = self.config.ack_timeout();
        match timeout(limit, self.transport.publish(message)).await {
            Err(_) => Err(ReplicationError::Timeout(limit)),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(None)) => Ok(ReplicationResponse::ok("no peers configured")),
            Ok(Ok(Some(response))) if !response.status => {
                Err(ReplicationError::Rejected(response.message))
            }
            Ok(Ok(Some(response))) => Ok(response),
        }
    }

    /// Journal, then queue for background delivery.
    pub fn publish_detached(&self, message: ReplicationMessage) -> Result<(), ReplicationError> {
        self.journal.append(&message)?;
        self.outbox
            .send(message)
            .map_err(|_| ReplicationError::OutboxClosed)
    }
}

/// Background delivery loop for detached publishes.
pub struct OutboxWorker {
    transport: Arc<dyn ReplicationTransport>,
    journal: Arc<dyn OutboxJournal>,
    queue: mpsc::UnboundedReceiver<ReplicationMessage>,
    backlog: Vec<ReplicationMessage>,
    config: ReplicationConfig,
}

impl OutboxWorker {
    /// Delivers the journal backlog, then runs until every publisher handle
    /// is dropped and the queue is empty.
    pub async fn run(mut self) {
        for message in std::mem::take(&mut self.backlog) {
            self.deliver(&message).await;
        }
        while let Some(message) = self.queue.recv().await {
            self.deliver(&message).await;
        }
        tracing::debug!("replication outbox drained");
    }

    async fn deliver(&self, message: &ReplicationMessage) {
        let ack_timeout = self.config.ack_timeout();
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let failure = match timeout(ack_timeout, self.transport.publish(message)).await {
                Ok(Ok(None)) => break,
                Ok(Ok(Some(response))) if response.status => {
                    tracing::debug!(
                        key = %message.primary_key,
                        sequence = message.sequence,
                        attempt,
                        "replicated"
                    );
                    break;
                }
                Ok(Ok(Some(response))) => response.message,
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("no acknowledgement within {ack_timeout:?}"),
            };
            let delay = self.config.retry_delay(attempt);
            tracing::warn!(
                key = %message.primary_key,
                sequence = message.sequence,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "replication attempt failed: {failure}"
            );
            sleep(delay).await;
        }

        if let Err(err) = self.journal.acknowledge(message.sequence) {
            tracing::error!(
                sequence = message.sequence,
                "delivered event stays journaled and will be sent again: {err}"
            );
        }
    }
}
