//! Credential lifecycle: registration and status transitions.
//!
//! [`CredentialRegistrar`] turns a validated request into a persisted,
//! optionally signed and replicated credential. [`KeyStateMachine`] flips a
//! credential between `ACTIVE` and `INACTIVE` for the caller who owns its
//! handle, then updates the user's directory entry on a best-effort basis.
//! Both return typed results; wire formats belong to the caller.

pub mod config;
pub mod directory;
pub mod error;
pub mod registration;
pub mod transition;

pub use config::LifecycleConfig;
pub use directory::{DirectoryError, DirectoryService, MemoryDirectory, KEYS_ENABLED_ATTRIBUTE};
pub use error::LifecycleError;
pub use registration::CredentialRegistrar;
pub use transition::{KeyStateMachine, Transition};
