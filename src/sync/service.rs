//! Operator-facing sync control.
//!
//! The [`SyncService`] starts and stops [account monitors](super::monitor)
//! on request and answers status queries. Per-account results are plain
//! strings so a control frontend can pass them through verbatim.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};

use super::monitor::{self, MonitorHandle};
use super::SyncConfig;
use crate::account::{Account, LeaseOutcome};
use crate::context::Context;
use crate::imap::pool::{connection_pool, ConnectionPool};

type PoolFactory = Box<dyn Fn(&Context, &Account) -> ConnectionPool + Send + Sync>;

/// Starts and stops account sync monitors.
pub struct SyncService {
    context: Context,
    config: SyncConfig,
    pool_factory: PoolFactory,
    monitors: tokio::sync::Mutex<HashMap<i64, MonitorHandle>>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService").finish_non_exhaustive()
    }
}

impl SyncService {
    pub fn new(context: Context) -> SyncService {
        SyncService::with_pool_factory(
            context,
            SyncConfig::default(),
            Box::new(|context, account| connection_pool(context, account)),
        )
    }

    /// Service with a custom connection source, used by tests to plug in
    /// replay fixtures.
    pub fn with_pool_factory(
        context: Context,
        config: SyncConfig,
        pool_factory: PoolFactory,
    ) -> SyncService {
        SyncService {
            context,
            config,
            pool_factory,
            monitors: Default::default(),
        }
    }

    /// Restarts monitors for every account whose lease this host still
    /// holds, e.g. after a process restart.
    pub async fn resume(&self) -> Result<()> {
        for id in Account::ids_leased_by(&self.context, self.context.sync_host()).await? {
            match self.start_account(id).await {
                Ok(result) => info!(self.context, "resumed account {id}: {result}"),
                Err(err) => warn!(self.context, "failed to resume account {id}: {err:#}"),
            }
        }
        Ok(())
    }

    /// Starts syncing one account, or all accounts if `account_id` is None.
    ///
    /// Returns one result string per account.
    pub async fn start_sync(&self, account_id: Option<i64>) -> Result<BTreeMap<i64, String>> {
        let ids = match account_id {
            Some(id) => vec![id],
            None => Account::all_ids(&self.context).await?,
        };
        let mut res = BTreeMap::new();
        for id in ids {
            // One failing account must not keep the others from starting.
            let result = match self.start_account(id).await {
                Ok(result) => result,
                Err(err) => format!("ERROR {err:#}"),
            };
            res.insert(id, result);
        }
        Ok(res)
    }

    async fn start_account(&self, id: i64) -> Result<String> {
        let mut monitors = self.monitors.lock().await;
        if let Some(handle) = monitors.get(&id) {
            if !handle.is_finished() {
                return Ok("OK sync already started".to_string());
            }
            // The monitor exited on its own, e.g. after losing the lease;
            // drop the stale handle and start over.
            monitors.remove(&id);
        }

        let Some(account) = Account::load(&self.context, id).await? else {
            bail!("no account with id {id}");
        };
        match account
            .try_acquire_sync_lease(&self.context, self.context.sync_host())
            .await?
        {
            LeaseOutcome::Acquired => {}
            LeaseOutcome::OwnedBy(host) => {
                return Ok(format!("{} is syncing on host {host}", account.email_address));
            }
        }

        let pool = (self.pool_factory)(&self.context, &account);
        let handle =
            monitor::spawn_account_monitor(self.context.clone(), account, pool, self.config.clone());
        monitors.insert(id, handle);
        Ok("OK sync started".to_string())
    }

    /// Stops one account's monitor, or all monitors if `account_id` is None.
    pub async fn stop_sync(&self, account_id: Option<i64>) -> Result<BTreeMap<i64, String>> {
        let mut monitors = self.monitors.lock().await;
        let ids: Vec<i64> = match account_id {
            Some(id) => vec![id],
            None => monitors.keys().copied().collect(),
        };
        let mut res = BTreeMap::new();
        for id in ids {
            let result = match monitors.remove(&id) {
                Some(handle) => {
                    handle.stop().await?;
                    "OK sync stopped"
                }
                None => "OK sync not running",
            };
            res.insert(id, result.to_string());
        }
        Ok(res)
    }

    /// The last reported state per folder of a running account, None if no
    /// monitor is running.
    pub async fn sync_status(&self, account_id: i64) -> Option<HashMap<String, String>> {
        self.monitors
            .lock()
            .await
            .get(&account_id)
            .map(|handle| handle.status_snapshot())
    }

    /// Stops all monitors; used during process shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_sync(None).await?;
        Ok(())
    }
}
