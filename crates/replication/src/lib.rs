//! Propagation of credential changes between appliance nodes.
//!
//! The origin numbers every event it issues. Events reach peers through a
//! [`ReplicationTransport`]; the receiving side feeds them to a
//! [`ReplicaApplier`], which drops redeliveries and out-of-date events per
//! key, so at-least-once delivery is safe. Detached events are journaled
//! until delivered; see [`journal`].

pub mod journal;
pub mod message;
pub mod publisher;
pub mod replica;
pub mod transport;

pub use journal::{JournalError, MemoryJournal, OutboxJournal, SledJournal, Watermarks};
pub use message::{EntityType, Operation, ReplicationMessage, ReplicationResponse};
pub use publisher::{
    OutboxWorker, ReplicationConfig, ReplicationError, ReplicationMode, ReplicationPublisher,
};
pub use replica::ReplicaApplier;
pub use transport::{
    ChannelTransport, Envelope, HttpTransport, ReplicationTransport, TransportError,
    PEER_TOKEN_HEADER, REPLICATION_PATH,
};
