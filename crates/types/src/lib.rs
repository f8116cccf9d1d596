//! Shared types for the FIDO credential registry.
//!
//! A credential (key record) is identified by `(server_id, domain_id,
//! username, key_id)`; its textual form is the [`Handle`], which doubles as
//! the capability token callers present to toggle the credential.

pub mod credential;
pub mod handle;
pub mod protocol;
pub mod request;

pub use credential::*;
pub use handle::*;
pub use protocol::*;
pub use request::*;

/// Identifier of the appliance node that created a record.
pub type ServerId = u16;
/// Tenant (relying party) identifier.
pub type DomainId = u64;
/// Per-domain monotonic credential identifier.
pub type KeyId = u64;
