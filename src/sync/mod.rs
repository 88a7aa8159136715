//! # Folder synchronization engine.
//!
//! One [`folder::FolderSyncTask`] runs the per-folder state machine, an
//! [`monitor::AccountMonitor`] owns all folder tasks of one account, and the
//! [`service::SyncService`] starts and stops monitors on operator request.

use std::time::Duration;

use anyhow::{bail, Result};

pub mod folder;
pub mod monitor;
pub mod service;

/// States of the per-folder sync state machine.
///
/// The `*_uidinvalid` states remember that the folder's UIDVALIDITY changed
/// and all locally recorded UIDs must be remapped before the interrupted
/// state can resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Initial,
    InitialUidInvalid,
    Poll,
    PollUidInvalid,
    Finish,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Initial => "initial",
            SyncState::InitialUidInvalid => "initial uidinvalid",
            SyncState::Poll => "poll",
            SyncState::PollUidInvalid => "poll uidinvalid",
            SyncState::Finish => "finish",
        }
    }

    pub fn from_str(s: &str) -> Result<SyncState> {
        Ok(match s {
            "initial" => SyncState::Initial,
            "initial uidinvalid" => SyncState::InitialUidInvalid,
            "poll" => SyncState::Poll,
            "poll uidinvalid" => SyncState::PollUidInvalid,
            "finish" => SyncState::Finish,
            other => bail!("unknown sync state {other:?}"),
        })
    }

    /// The state to enter when UIDVALIDITY changes underneath this state.
    pub fn uidinvalid(self) -> SyncState {
        match self {
            SyncState::Initial | SyncState::InitialUidInvalid => SyncState::InitialUidInvalid,
            _ => SyncState::PollUidInvalid,
        }
    }

    /// The state a finished UID remap returns to.
    pub fn resumed(self) -> SyncState {
        match self {
            SyncState::InitialUidInvalid => SyncState::Initial,
            SyncState::PollUidInvalid => SyncState::Poll,
            other => other,
        }
    }
}

/// Tunables of the sync engine. The defaults are production values; tests
/// shrink the timings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay between poll cycles of an up-to-date folder.
    pub poll_interval: Duration,

    /// Base delay of the exponential retry backoff.
    pub retry_base: Duration,

    /// Transient errors per state step before the folder gives up.
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            poll_interval: Duration::from_secs(30),
            retry_base: Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}
