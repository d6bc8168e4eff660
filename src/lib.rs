//! Meetpoint — meetup-request lifecycle and realtime messaging core
//!
//! Re-exports the workspace members; see `chat_core` for the services and
//! `storage` for the record types and collaborator interfaces.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use chat_core;
pub use storage;
