//! HTTP boundary of the credential engine.
//!
//! Translates JSON requests into lifecycle calls and typed errors back into
//! the response shapes existing clients expect.

pub mod server;

pub use server::{build_peer_router, build_router, start_peer_server, start_server, AppState};
