//! # Mailmirror
//!
//! An IMAP mail synchronization engine tuned for Gmail. Accounts are synced
//! folder by folder through a resumable state machine, messages are
//! deduplicated across folders by provider message id, and conversation
//! threads are materialized through a per-account serialized resolver.
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless
)]

#[macro_use]
pub mod log;

pub mod account;
pub mod blob;
pub mod cache;
pub mod context;
pub mod dedup;
pub mod events;
pub mod folder_uid;
pub mod html;
pub mod imap;
pub mod ingest;
pub mod message;
pub mod sql;
pub mod sync;
pub mod thread;

pub use self::events::{Event, EventEmitter, Events};

#[cfg(test)]
mod test_utils;
