//! Per-account sync monitor.
//!
//! One monitor task owns everything that runs for an account: it refreshes
//! the special-folder mapping, spawns the thread resolver and the folder
//! sync tasks in priority order, and keeps the account's sync lease renewed
//! until it is told to stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::folder::FolderSyncTask;
use super::{SyncConfig, SyncState};
use crate::account::{Account, SYNC_LEASE_TTL_SECONDS};
use crate::context::Context;
use crate::imap::pool::ConnectionPool;
use crate::imap::session::resolve_folder_names;
use crate::log::LogExt as _;
use crate::thread::ThreadResolver;

/// How often the folder startup sequence re-checks whether the previous
/// folder reached a steady state.
const STARTUP_CHECK: Duration = Duration::from_millis(50);

/// Handle to a running account monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    account_id: i64,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
    statuses: Arc<Mutex<HashMap<String, String>>>,
}

impl MonitorHandle {
    pub fn account_id(&self) -> i64 {
        self.account_id
    }

    /// True once the monitor task exited, e.g. after losing its lease.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Current state string per folder, as last reported by the sync tasks.
    pub fn status_snapshot(&self) -> HashMap<String, String> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Asks the monitor to stop and waits for it and all its folder tasks.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.send(true).ok();
        self.handle.await.context("monitor task panicked")?
    }
}

/// Spawns the monitor task for one account. The caller must already hold
/// the account's sync lease.
pub fn spawn_account_monitor(
    context: Context,
    account: Account,
    pool: ConnectionPool,
    config: SyncConfig,
) -> MonitorHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let statuses: Arc<Mutex<HashMap<String, String>>> = Default::default();
    let account_id = account.id;
    let handle = tokio::spawn(run_monitor(
        context,
        account,
        pool,
        config,
        shutdown_rx,
        Arc::clone(&statuses),
    ));
    MonitorHandle {
        account_id,
        shutdown,
        handle,
        statuses,
    }
}

async fn run_monitor(
    context: Context,
    mut account: Account,
    pool: ConnectionPool,
    config: SyncConfig,
    mut shutdown: watch::Receiver<bool>,
    statuses: Arc<Mutex<HashMap<String, String>>>,
) -> Result<()> {
    refresh_folder_names(&context, &mut account, &pool).await?;

    // Folder tasks get their own channel so a lost lease can stop them even
    // though the external sender lives in the handle.
    let (task_shutdown, task_shutdown_rx) = watch::channel(false);
    let (resolver, resolver_handle) = ThreadResolver::spawn(context.clone(), account.id);

    let poll_set = account.poll_folders();
    let mut tasks: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();
    for folder in account.sync_folders() {
        if *shutdown.borrow() {
            break;
        }
        info!(context, "starting sync of {folder:?}");
        let task = FolderSyncTask::new(
            context.clone(),
            account.clone(),
            folder.clone(),
            pool.clone(),
            resolver.clone(),
            task_shutdown_rx.clone(),
            poll_set.contains(&folder),
            config.clone(),
            Arc::clone(&statuses),
        );
        let handle = tokio::spawn(task.run());

        // Later folders wait until this one settles, so the high-priority
        // folders get the connections first.
        while !handle.is_finished() && !*shutdown.borrow() {
            let settled = statuses
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&folder)
                .map(|s| {
                    s == SyncState::Poll.as_str()
                        || s == SyncState::Finish.as_str()
                        || s.starts_with("error")
                })
                .unwrap_or(false);
            if settled {
                break;
            }
            tokio::time::sleep(STARTUP_CHECK).await;
        }
        tasks.push((folder, handle));
    }
    drop(resolver);

    // Renew the lease until shutdown; losing it means another host took
    // over and this monitor must get out of the way.
    let renew_every = Duration::from_secs(SYNC_LEASE_TTL_SECONDS as u64 / 3);
    let mut lease_lost = false;
    while !*shutdown.borrow() {
        tokio::select! {
            res = shutdown.changed() => {
                // A dropped handle counts as a shutdown request.
                if res.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(renew_every) => {
                let renewed = account
                    .renew_sync_lease(&context, context.sync_host())
                    .await
                    .log_err(&context)
                    .unwrap_or(false);
                if !renewed {
                    error!(
                        context,
                        "sync lease for {} lost, stopping", account.email_address
                    );
                    lease_lost = true;
                    break;
                }
            }
        }
    }

    task_shutdown.send(true).ok();
    for (folder, handle) in tasks {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(context, "sync of {folder:?} ended: {err:#}"),
            Err(err) => warn!(context, "sync task of {folder:?} panicked: {err}"),
        }
    }
    resolver_handle.await.ok();

    if !lease_lost {
        account
            .release_sync_lease(&context, context.sync_host())
            .await?;
    }
    Ok(())
}

/// Re-resolves the folder mapping from LIST on every monitor start; user
/// labels come and go between runs. A renamed special folder makes
/// `save_folder_names` fail and stops the monitor before any sync runs.
async fn refresh_folder_names(
    context: &Context,
    account: &mut Account,
    pool: &ConnectionPool,
) -> Result<()> {
    let mut session = pool.checkout().await?;
    let listing = match session.list_folders().await {
        Ok(listing) => listing,
        Err(err) => {
            session.mark_broken();
            return Err(err);
        }
    };
    let names = resolve_folder_names(&listing);
    account.save_folder_names(context, names).await
}
