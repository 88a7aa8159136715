//! Per-folder sync state machine.
//!
//! A [`FolderSyncTask`] drives one folder of one account through the states
//! of [`SyncState`]: a chunked initial download, then either incremental
//! polling or, for low-traffic folders, `finish`. All writes of one chunk
//! commit in a single transaction and chunks are idempotent, so an
//! interrupted task resumes where it stopped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;

use super::{SyncConfig, SyncState};
use crate::account::{Account, Provider};
use crate::context::Context;
use crate::dedup;
use crate::folder_uid::{self, UidFlags};
use crate::imap::pool::{ConnectionPool, PoolError, PooledSession};
use crate::imap::session::{FlagSet, GmailMetadata, SelectError, SelectInfo};
use crate::ingest::{self, IngestedMessage};
use crate::log::LogExt as _;
use crate::message;
use crate::thread::{ThreadResolver, ThreadSeed};
use crate::Event;

/// Messages downloaded and committed per chunk.
const DOWNLOAD_CHUNK_SIZE: usize = 10;

/// Cache slot for the provider-id map of an unfinished initial sync.
const METADATA_CACHE: &str = "metadata";

/// The folder's UIDVALIDITY no longer matches the recorded one; all local
/// UIDs of the folder are meaningless until remapped.
#[derive(Debug, thiserror::Error)]
#[error("UIDVALIDITY of {folder:?} changed from {cached} to {current}")]
pub struct UidValidityChanged {
    pub folder: String,
    pub cached: u32,
    pub current: u32,
}

/// The task was asked to shut down; not a failure.
#[derive(Debug, thiserror::Error)]
#[error("folder sync interrupted")]
pub struct Interrupted;

/// The persisted position of a folder sync.
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    state: SyncState,
    uid_validity: u32,
    highest_modseq: u64,
}

/// Sync driver for one folder.
pub struct FolderSyncTask {
    context: Context,
    account: Account,
    folder: String,
    pool: ConnectionPool,
    resolver: ThreadResolver,
    shutdown: watch::Receiver<bool>,
    /// False for low-traffic folders which run to `finish` instead of
    /// polling forever.
    keep_polling: bool,
    config: SyncConfig,
    /// Folder name to reported state, shared with the account monitor.
    statuses: Arc<Mutex<HashMap<String, String>>>,
    state: SyncState,
}

impl std::fmt::Debug for FolderSyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderSyncTask")
            .field("account_id", &self.account.id)
            .field("folder", &self.folder)
            .field("state", &self.state)
            .finish()
    }
}

impl FolderSyncTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Context,
        account: Account,
        folder: String,
        pool: ConnectionPool,
        resolver: ThreadResolver,
        shutdown: watch::Receiver<bool>,
        keep_polling: bool,
        config: SyncConfig,
        statuses: Arc<Mutex<HashMap<String, String>>>,
    ) -> Self {
        FolderSyncTask {
            context,
            account,
            folder,
            pool,
            resolver,
            shutdown,
            keep_polling,
            config,
            statuses,
            state: SyncState::Initial,
        }
    }

    /// Runs the state machine until the folder reaches `finish`, shutdown is
    /// requested, or an error exhausts its retries.
    pub async fn run(mut self) -> Result<()> {
        loop {
            if self.shutdown_requested() {
                return Ok(());
            }
            let checkpoint = self.load_checkpoint().await?;
            self.state = checkpoint.state;
            self.report(None);
            if checkpoint.state == SyncState::Finish {
                return Ok(());
            }

            let mut attempt = 0;
            let step = loop {
                match self.run_state(checkpoint).await {
                    Err(err)
                        if attempt + 1 < self.config.max_attempts
                            && is_transient(&err)
                            && !self.shutdown_requested() =>
                    {
                        attempt += 1;
                        warn!(
                            self.context,
                            "sync of {:?} failed (attempt {attempt}): {err:#}", self.folder
                        );
                        tokio::time::sleep(self.config.retry_base * 2u32.pow(attempt - 1)).await;
                    }
                    other => break other,
                }
            };

            match step {
                Ok(next) => self.save_state(next).await?,
                Err(err) if err.downcast_ref::<Interrupted>().is_some() => return Ok(()),
                Err(err) => {
                    if let Some(change) = err.downcast_ref::<UidValidityChanged>() {
                        warn!(self.context, "{change}");
                        self.save_state(checkpoint.state.uidinvalid()).await?;
                        continue;
                    }
                    let message = format!("{err:#}");
                    self.set_status(format!("error: {message}"));
                    self.context.emit_event(Event::FolderSyncErrored {
                        account_id: self.account.id,
                        folder: self.folder.clone(),
                        message,
                    });
                    return Err(err);
                }
            }
        }
    }

    async fn run_state(&mut self, checkpoint: Checkpoint) -> Result<SyncState> {
        match checkpoint.state {
            SyncState::Initial => self.initial_sync(checkpoint).await,
            SyncState::InitialUidInvalid | SyncState::PollUidInvalid => {
                self.resync_uids(checkpoint).await
            }
            SyncState::Poll => self.poll(checkpoint).await,
            SyncState::Finish => Ok(SyncState::Finish),
        }
    }

    fn shutdown_requested(&self) -> bool {
        // A dropped sender counts as a shutdown request.
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    fn set_status(&self, status: String) {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(self.folder.clone(), status);
    }

    fn report(&self, progress: Option<f64>) {
        let status = match progress {
            Some(pct) => format!("{} {pct:.0}%", self.state.as_str()),
            None => self.state.as_str().to_string(),
        };
        self.set_status(status);
        self.context.emit_event(Event::SyncProgress {
            account_id: self.account.id,
            folder: self.folder.clone(),
            state: self.state.as_str().to_string(),
            progress,
        });
    }

    /// Checks out a session and runs `initial_sync_with` on it. Protocol
    /// errors leave the connection in an unknown state, so the session is
    /// discarded on failure.
    async fn initial_sync(&mut self, checkpoint: Checkpoint) -> Result<SyncState> {
        let mut session = self.pool.checkout().await?;
        let res = self.initial_sync_with(&mut session, checkpoint).await;
        if let Err(err) = &res {
            if is_transient(err) {
                session.mark_broken();
            }
        }
        res
    }

    async fn initial_sync_with(
        &mut self,
        session: &mut PooledSession,
        checkpoint: Checkpoint,
    ) -> Result<SyncState> {
        let select = self.select_checked(session, &checkpoint).await?;

        // Resuming an interrupted run: re-check flags of memberships
        // recorded before the interruption.
        if checkpoint.highest_modseq > 0
            && select
                .highest_modseq
                .map_or(true, |m| m > checkpoint.highest_modseq)
        {
            self.update_changed_flags(session, checkpoint.highest_modseq)
                .await?;
        }

        let remote = session.all_uids().await?;
        let metadata = self
            .folder_metadata(session, &checkpoint, &select, &remote)
            .await?;

        // Checkpoint before downloading: chunks are idempotent, and changes
        // arriving during the download carry a higher MODSEQ which the next
        // poll picks up.
        self.save_marks(select.uid_validity, select.highest_modseq.unwrap_or(0))
            .await?;

        let local: BTreeSet<u32> = folder_uid::local_uids(&self.context, self.account.id, &self.folder)
            .await?
            .into_iter()
            .collect();
        let remote_set: BTreeSet<u32> = remote.iter().copied().collect();

        let stale: Vec<u32> = local.difference(&remote_set).copied().collect();
        if !stale.is_empty() {
            let removed =
                folder_uid::remove_uids(&self.context, self.account.id, &self.folder, &stale)
                    .await?;
            info!(
                self.context,
                "removed {removed} stale memberships from {:?}", self.folder
            );
            self.context.schedule_index_update(self.account.id);
        }

        let unknown: BTreeSet<u32> = remote_set.difference(&local).copied().collect();
        let thrids = self.download_new(session, &metadata, &unknown).await?;
        self.expand_threads(session, &thrids).await?;

        self.context
            .cache
            .remove(self.account.id, &self.folder, METADATA_CACHE)
            .await
            .log_err(&self.context);
        self.report(Some(100.0));
        Ok(if self.keep_polling {
            SyncState::Poll
        } else {
            SyncState::Finish
        })
    }

    /// Returns provider metadata for all remote UIDs, reusing the cached map
    /// of an interrupted run where its generation still matches.
    async fn folder_metadata(
        &self,
        session: &mut PooledSession,
        checkpoint: &Checkpoint,
        select: &SelectInfo,
        remote: &[u32],
    ) -> Result<BTreeMap<u32, GmailMetadata>> {
        if self.account.provider != Provider::Gmail {
            return Ok(BTreeMap::new());
        }
        let mut metadata: BTreeMap<u32, GmailMetadata> =
            if checkpoint.uid_validity == select.uid_validity {
                self.context
                    .cache
                    .get(self.account.id, &self.folder, METADATA_CACHE)
                    .await
                    .unwrap_or_default()
            } else {
                BTreeMap::new()
            };

        let missing: Vec<u32> = remote
            .iter()
            .copied()
            .filter(|uid| !metadata.contains_key(uid))
            .collect();
        if !missing.is_empty() {
            metadata.extend(session.fetch_provider_ids(&missing).await?);
        }
        metadata.retain(|uid, _| remote.binary_search(uid).is_ok());

        // The cache only saves work on a rerun; failing to write it is not
        // worth failing the sync.
        self.context
            .cache
            .set(self.account.id, &self.folder, METADATA_CACHE, &metadata)
            .await
            .log_err(&self.context);
        Ok(metadata)
    }

    /// Classifies unknown UIDs, links the already stored ones and downloads
    /// the rest. Returns the thread ids of the downloaded messages.
    async fn download_new(
        &mut self,
        session: &mut PooledSession,
        metadata: &BTreeMap<u32, GmailMetadata>,
        unknown: &BTreeSet<u32>,
    ) -> Result<Vec<u64>> {
        if unknown.is_empty() {
            return Ok(Vec::new());
        }
        let classified =
            dedup::classify_for_download(&self.context, self.account.id, metadata, unknown).await?;

        if !classified.link_only.is_empty() {
            let flags = session.fetch_flags(&classified.link_only).await?;
            let linked = dedup::link_existing(
                &self.context,
                self.account.id,
                &self.folder,
                &classified.link_only,
                metadata,
                &flags,
            )
            .await?;
            if linked > 0 {
                self.context.schedule_index_update(self.account.id);
            }
        }

        let folder = self.folder.clone();
        self.download_chunks(session, &folder, &classified.full_download)
            .await
    }

    /// Downloads full bodies in chunks; each chunk commits atomically.
    async fn download_chunks(
        &mut self,
        session: &mut PooledSession,
        folder: &str,
        uids: &[u32],
    ) -> Result<Vec<u64>> {
        let total = uids.len();
        let mut done = 0usize;
        let mut thrids: Vec<u64> = Vec::new();

        for chunk in uids.chunks(DOWNLOAD_CHUNK_SIZE) {
            if self.shutdown_requested() {
                return Err(Interrupted.into());
            }

            let raws = session.fetch_bodies(chunk).await?;
            let mut parsed: Vec<(u32, FlagSet, IngestedMessage, Vec<u8>)> = Vec::new();
            for raw in raws {
                match ingest::ingest(&raw.body, raw.internal_date, raw.ids, &raw.flags.labels) {
                    Ok(msg) => parsed.push((raw.uid, raw.flags, msg, raw.body)),
                    Err(err) => {
                        let path = self
                            .context
                            .save_ingest_error(self.account.id, folder, raw.uid, &raw.body)
                            .await?;
                        warn!(
                            self.context,
                            "failed to ingest {folder:?} uid {}: {err:#}, raw kept at {}",
                            raw.uid,
                            path.display()
                        );
                    }
                }
            }
            if parsed.is_empty() {
                done += chunk.len();
                continue;
            }

            // Thread rows first; the resolver serializes creation across
            // all folder tasks of the account.
            let mut thread_ids: Vec<Option<i64>> = vec![None; parsed.len()];
            let seeds: Vec<(usize, ThreadSeed)> = parsed
                .iter()
                .enumerate()
                .filter_map(|(i, (_, flags, msg, _))| {
                    msg.g_thrid.map(|g_thrid| {
                        (
                            i,
                            ThreadSeed {
                                g_thrid,
                                subject: msg.subject.clone(),
                                received_date: msg.received_date,
                                labels: flags.labels.clone(),
                            },
                        )
                    })
                })
                .collect();
            if !seeds.is_empty() {
                let resolved = self
                    .resolver
                    .resolve(seeds.iter().map(|(_, s)| s.clone()).collect())
                    .await?;
                for ((i, _), id) in seeds.iter().zip(resolved) {
                    thread_ids[*i] = Some(id);
                }
            }

            // Blobs must be on disk before the rows commit; a blob failure
            // aborts the whole chunk so no committed row ever references a
            // missing file.
            for (_, _, msg, body) in &parsed {
                self.context.blobs.save(&msg.data_sha256, body).await?;
                for block in &msg.blocks {
                    self.context
                        .blobs
                        .save(&block.data_sha256, &block.data)
                        .await?;
                }
            }

            for (_, _, msg, _) in &parsed {
                if let Some(g_thrid) = msg.g_thrid {
                    thrids.push(g_thrid);
                }
            }

            let account_id = self.account.id;
            let folder_name = folder.to_string();
            let rows: Vec<(u32, UidFlags, IngestedMessage, Option<i64>)> = parsed
                .into_iter()
                .zip(thread_ids)
                .map(|((uid, flags, msg, _), thread_id)| {
                    (uid, UidFlags::from_imap(&flags), msg, thread_id)
                })
                .collect();
            self.context
                .sql
                .transaction(move |tx| {
                    for (uid, uid_flags, msg, thread_id) in &rows {
                        let existing = msg
                            .g_msgid
                            .map(|id| message::find_by_g_msgid(tx, account_id, id))
                            .transpose()?
                            .flatten();
                        let message_id = match existing {
                            // Another folder stored the body since
                            // classification.
                            Some(id) => id,
                            None => {
                                let local = msg
                                    .local_id
                                    .as_deref()
                                    .map(|lid| message::find_by_local_id(tx, account_id, lid))
                                    .transpose()?
                                    .flatten();
                                match local {
                                    Some(id) => {
                                        message::update_reconciled(tx, id, *thread_id, msg)?;
                                        id
                                    }
                                    None => {
                                        message::insert_ingested(tx, account_id, *thread_id, msg)?
                                    }
                                }
                            }
                        };
                        folder_uid::insert_membership(
                            tx,
                            account_id,
                            &folder_name,
                            *uid,
                            message_id,
                            uid_flags,
                        )?;
                    }
                    Ok(())
                })
                .await?;

            done += chunk.len();
            self.report(Some(done as f64 / total as f64 * 100.0));
            self.context.schedule_index_update(self.account.id);
        }

        thrids.sort_unstable();
        thrids.dedup();
        Ok(thrids)
    }

    /// Pulls the remaining members of the given threads out of "All Mail" so
    /// stored conversations are never partial.
    async fn expand_threads(
        &mut self,
        session: &mut PooledSession,
        thrids: &[u64],
    ) -> Result<()> {
        if thrids.is_empty() || self.account.provider != Provider::Gmail {
            return Ok(());
        }
        let Some(all_folder) = self.account.folders.all.clone() else {
            return Ok(());
        };
        if all_folder == self.folder {
            return Ok(());
        }

        session.select_folder(&all_folder).await?;
        let members = session.expand_thread_members(thrids).await?;

        let local: BTreeSet<u32> = folder_uid::local_uids(&self.context, self.account.id, &all_folder)
            .await?
            .into_iter()
            .collect();
        let unknown: BTreeSet<u32> = members
            .iter()
            .copied()
            .filter(|uid| !local.contains(uid))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }

        let uids: Vec<u32> = unknown.iter().copied().collect();
        let metadata = session.fetch_provider_ids(&uids).await?;
        let classified =
            dedup::classify_for_download(&self.context, self.account.id, &metadata, &unknown)
                .await?;

        if !classified.link_only.is_empty() {
            let flags = session.fetch_flags(&classified.link_only).await?;
            let linked = dedup::link_existing(
                &self.context,
                self.account.id,
                &all_folder,
                &classified.link_only,
                &metadata,
                &flags,
            )
            .await?;
            if linked > 0 {
                self.context.schedule_index_update(self.account.id);
            }
        }

        // No further expansion: these downloads are already scoped to whole
        // threads.
        self.download_chunks(session, &all_folder, &classified.full_download)
            .await?;
        Ok(())
    }

    /// One poll cycle followed by the poll delay.
    async fn poll(&mut self, checkpoint: Checkpoint) -> Result<SyncState> {
        {
            let mut session = self.pool.checkout().await?;
            let res = self.poll_with(&mut session, checkpoint).await;
            if let Err(err) = &res {
                if is_transient(err) {
                    session.mark_broken();
                }
            }
            res?;
        }

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
        Ok(SyncState::Poll)
    }

    async fn poll_with(
        &mut self,
        session: &mut PooledSession,
        checkpoint: Checkpoint,
    ) -> Result<()> {
        // STATUS first; an unchanged HIGHESTMODSEQ makes the whole cycle a
        // single cheap command.
        let status = session.folder_status(&self.folder).await?;
        if let Some(validity) = status.uid_validity {
            if checkpoint.uid_validity != 0 && validity != checkpoint.uid_validity {
                return Err(UidValidityChanged {
                    folder: self.folder.clone(),
                    cached: checkpoint.uid_validity,
                    current: validity,
                }
                .into());
            }
        }
        if status.highest_modseq.is_some()
            && status.highest_modseq == Some(checkpoint.highest_modseq)
        {
            return Ok(());
        }

        let select = self.select_checked(session, &checkpoint).await?;
        self.incremental_update(session, &checkpoint, &select).await
    }

    /// Applies everything that changed since the checkpointed MODSEQ: new
    /// mail, flag changes and deletions.
    async fn incremental_update(
        &mut self,
        session: &mut PooledSession,
        checkpoint: &Checkpoint,
        select: &SelectInfo,
    ) -> Result<()> {
        let changed = session.fetch_changed_uids(checkpoint.highest_modseq).await?;
        let remote = session.all_uids().await?;
        let local: BTreeSet<u32> = folder_uid::local_uids(&self.context, self.account.id, &self.folder)
            .await?
            .into_iter()
            .collect();

        let (updated, new): (Vec<u32>, Vec<u32>) =
            changed.into_iter().partition(|uid| local.contains(uid));

        if !updated.is_empty() {
            let flags = session.fetch_flags(&updated).await?;
            let map: BTreeMap<u32, UidFlags> = flags
                .iter()
                .map(|(uid, f)| (*uid, UidFlags::from_imap(f)))
                .collect();
            folder_uid::update_flags(&self.context, self.account.id, &self.folder, &map).await?;
            self.context.schedule_index_update(self.account.id);
        }

        if !new.is_empty() {
            let unknown: BTreeSet<u32> = new.into_iter().collect();
            let uids: Vec<u32> = unknown.iter().copied().collect();
            let metadata = session.fetch_provider_ids(&uids).await?;
            let thrids = self.download_new(session, &metadata, &unknown).await?;
            self.expand_threads(session, &thrids).await?;
        }

        let remote_set: BTreeSet<u32> = remote.into_iter().collect();
        let gone: Vec<u32> = local.difference(&remote_set).copied().collect();
        if !gone.is_empty() {
            let removed =
                folder_uid::remove_uids(&self.context, self.account.id, &self.folder, &gone)
                    .await?;
            info!(
                self.context,
                "removed {removed} memberships deleted from {:?}", self.folder
            );
            self.context.schedule_index_update(self.account.id);
        }

        self.save_marks(select.uid_validity, select.highest_modseq.unwrap_or(0))
            .await
    }

    /// Rebuilds the folder's UID mapping after a UIDVALIDITY change, then
    /// returns to the interrupted state.
    async fn resync_uids(&mut self, checkpoint: Checkpoint) -> Result<SyncState> {
        let mut session = self.pool.checkout().await?;
        let res = self.resync_uids_with(&mut session, checkpoint).await;
        if res.is_err() {
            session.mark_broken();
        }
        res
    }

    async fn resync_uids_with(
        &mut self,
        session: &mut PooledSession,
        checkpoint: Checkpoint,
    ) -> Result<SyncState> {
        let select = session.select_folder(&self.folder).await?;
        let remote = session.all_uids().await?;

        if self.account.provider == Provider::Gmail {
            let metadata = session.fetch_provider_ids(&remote).await?;
            let new_uids: BTreeMap<u64, u32> = metadata
                .iter()
                .map(|(uid, meta)| (meta.g_msgid, *uid))
                .collect();
            let (remapped, removed) =
                folder_uid::remap_uids(&self.context, self.account.id, &self.folder, &new_uids)
                    .await?;
            info!(
                self.context,
                "remapped {remapped} and removed {removed} memberships of {:?} after UIDVALIDITY change",
                self.folder
            );
        } else {
            // Without provider ids there is nothing to match old and new
            // UIDs on; drop the memberships and let the resumed state
            // rebuild them.
            let local = folder_uid::local_uids(&self.context, self.account.id, &self.folder).await?;
            folder_uid::remove_uids(&self.context, self.account.id, &self.folder, &local).await?;
        }

        // The cached metadata belongs to the old generation.
        self.context
            .cache
            .remove(self.account.id, &self.folder, METADATA_CACHE)
            .await
            .log_err(&self.context);
        self.save_marks(select.uid_validity, select.highest_modseq.unwrap_or(0))
            .await?;
        self.context.schedule_index_update(self.account.id);
        Ok(checkpoint.state.resumed())
    }

    /// Re-checks flags of known memberships changed since `since_modseq`.
    async fn update_changed_flags(
        &mut self,
        session: &mut PooledSession,
        since_modseq: u64,
    ) -> Result<()> {
        let changed = session.fetch_changed_uids(since_modseq).await?;
        let local: BTreeSet<u32> = folder_uid::local_uids(&self.context, self.account.id, &self.folder)
            .await?
            .into_iter()
            .collect();
        let updated: Vec<u32> = changed
            .into_iter()
            .filter(|uid| local.contains(uid))
            .collect();
        if updated.is_empty() {
            return Ok(());
        }
        let flags = session.fetch_flags(&updated).await?;
        let map: BTreeMap<u32, UidFlags> = flags
            .iter()
            .map(|(uid, f)| (*uid, UidFlags::from_imap(f)))
            .collect();
        folder_uid::update_flags(&self.context, self.account.id, &self.folder, &map).await?;
        self.context.schedule_index_update(self.account.id);
        Ok(())
    }

    async fn select_checked(
        &self,
        session: &mut PooledSession,
        checkpoint: &Checkpoint,
    ) -> Result<SelectInfo> {
        let select = session.select_folder(&self.folder).await?;
        if checkpoint.uid_validity != 0 && select.uid_validity != checkpoint.uid_validity {
            return Err(UidValidityChanged {
                folder: self.folder.clone(),
                cached: checkpoint.uid_validity,
                current: select.uid_validity,
            }
            .into());
        }
        Ok(select)
    }

    async fn load_checkpoint(&self) -> Result<Checkpoint> {
        self.context
            .sql
            .execute(
                "INSERT OR IGNORE INTO folder_sync_state (account_id, folder_name) VALUES (?,?)",
                (self.account.id, &self.folder),
            )
            .await?;
        let (state, uid_validity, highest_modseq): (String, i64, i64) = self
            .context
            .sql
            .query_row(
                "SELECT state, uid_validity, highest_modseq FROM folder_sync_state
                 WHERE account_id=? AND folder_name=?",
                (self.account.id, &self.folder),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .await?;
        Ok(Checkpoint {
            state: SyncState::from_str(&state)?,
            uid_validity: uid_validity as u32,
            highest_modseq: highest_modseq as u64,
        })
    }

    async fn save_state(&self, state: SyncState) -> Result<()> {
        self.context
            .sql
            .execute(
                "UPDATE folder_sync_state SET state=? WHERE account_id=? AND folder_name=?",
                (state.as_str(), self.account.id, &self.folder),
            )
            .await?;
        Ok(())
    }

    async fn save_marks(&self, uid_validity: u32, highest_modseq: u64) -> Result<()> {
        self.context
            .sql
            .execute(
                "UPDATE folder_sync_state SET uid_validity=?, highest_modseq=?
                 WHERE account_id=? AND folder_name=?",
                (
                    uid_validity,
                    highest_modseq as i64,
                    self.account.id,
                    &self.folder,
                ),
            )
            .await?;
        Ok(())
    }
}

/// True for errors worth retrying with the same session setup.
///
/// State-machine markers, structural errors (a folder that does not exist
/// will not appear on the next attempt either) and rejected credentials are
/// not transient.
fn is_transient(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<UidValidityChanged>().is_some()
        || err.downcast_ref::<Interrupted>().is_some()
    {
        return false;
    }
    if let Some(select) = err.downcast_ref::<SelectError>() {
        return !matches!(select, SelectError::NoFolder(_));
    }
    if let Some(pool) = err.downcast_ref::<PoolError>() {
        return !matches!(pool, PoolError::AuthFailure(_));
    }
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::blob::data_sha256;
    use crate::imap::replay::{ReplayConnector, ReplayFixture};
    use crate::ingest::{ingest, ProviderIds};
    use crate::message::Message;
    use crate::test_utils::{build_mail, TestContext, TEST_DATE};
    use crate::thread::Thread;

    fn test_config() -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(5),
            retry_base: Duration::from_millis(5),
            max_attempts: 2,
        }
    }

    struct TestTask {
        task: FolderSyncTask,
        _shutdown: watch::Sender<bool>,
    }

    async fn make_task(
        t: &TestContext,
        fixture: &ReplayFixture,
        folder: &str,
        keep_polling: bool,
    ) -> TestTask {
        let mut acc = t.create_account("me@example.com").await;
        acc.save_folder_names(&t.ctx, crate::test_utils::gmail_folder_names())
            .await
            .unwrap();
        make_task_for(t, &acc, fixture, folder, keep_polling)
    }

    fn make_task_for(
        t: &TestContext,
        acc: &crate::account::Account,
        fixture: &ReplayFixture,
        folder: &str,
        keep_polling: bool,
    ) -> TestTask {
        let (resolver, _handle) = ThreadResolver::spawn(t.ctx.clone(), acc.id);
        make_task_with(t, acc, fixture, folder, keep_polling, resolver)
    }

    /// Like [`make_task_for`], but sharing a caller-owned resolver the way
    /// the monitor wires its folder tasks.
    fn make_task_with(
        t: &TestContext,
        acc: &crate::account::Account,
        fixture: &ReplayFixture,
        folder: &str,
        keep_polling: bool,
        resolver: ThreadResolver,
    ) -> TestTask {
        let pool = ConnectionPool::new(Box::new(ReplayConnector::new(fixture.clone())), 2);
        let (sender, receiver) = watch::channel(false);
        let task = FolderSyncTask::new(
            t.ctx.clone(),
            acc.clone(),
            folder.to_string(),
            pool,
            resolver,
            receiver,
            keep_polling,
            test_config(),
            Arc::new(Mutex::new(HashMap::new())),
        );
        TestTask {
            task,
            _shutdown: sender,
        }
    }

    async fn message_count(t: &TestContext) -> i64 {
        t.ctx
            .sql
            .count("SELECT COUNT(*) FROM messages", ())
            .await
            .unwrap() as i64
    }

    fn mail_in_both(fixture: &ReplayFixture, n: u64, subject: &str) -> Vec<u8> {
        let body = build_mail("alice@example.com", "me@example.com", subject, "hi\n");
        fixture.add_message("INBOX", &body, n, n, &["\\Inbox"]);
        fixture.add_message("[Gmail]/All Mail", &body, n, n, &["\\Inbox"]);
        body
    }

    #[tokio::test]
    async fn test_initial_sync_downloads_and_expands() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        mail_in_both(&fixture, 1, "first");
        mail_in_both(&fixture, 2, "second");
        // A thread sibling living only in All Mail.
        let sibling = build_mail("bob@example.com", "me@example.com", "Re: second", "reply\n");
        fixture.add_message("[Gmail]/All Mail", &sibling, 3, 2, &[]);

        let tt = make_task(&t, &fixture, "INBOX", false).await;
        tt.task.run().await?;

        let acc_id = 1;
        assert_eq!(
            folder_uid::local_uids(&t.ctx, acc_id, "INBOX").await?,
            vec![1, 2]
        );
        // Thread expansion pulled the sibling out of All Mail, and the inbox
        // copies were linked there without a second download.
        assert_eq!(
            folder_uid::local_uids(&t.ctx, acc_id, "[Gmail]/All Mail").await?,
            vec![1, 2, 3]
        );
        assert_eq!(message_count(&t).await, 3);

        let thread = Thread::load_by_thrid(&t.ctx, acc_id, 2).await?.unwrap();
        assert_eq!(thread.subject.as_deref(), Some("second"));

        let id = Message::id_by_g_msgid(&t.ctx, acc_id, 1).await?.unwrap();
        let msg = Message::load(&t.ctx, id).await?.unwrap();
        assert_eq!(msg.snippet, "hi");
        assert!(t.ctx.blobs.exists(&msg.data_sha256).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        mail_in_both(&fixture, 10, "only once");

        let tt = make_task(&t, &fixture, "INBOX", false).await;
        let acc = tt.task.account.clone();
        tt.task.run().await?;
        assert_eq!(message_count(&t).await, 1);

        // Force the state machine back to the start; nothing may duplicate.
        t.ctx
            .sql
            .execute(
                "UPDATE folder_sync_state SET state='initial' WHERE account_id=?",
                (acc.id,),
            )
            .await?;
        let tt = make_task_for(&t, &acc, &fixture, "INBOX", false);
        tt.task.run().await?;

        assert_eq!(message_count(&t).await, 1);
        assert_eq!(folder_uid::local_uids(&t.ctx, acc.id, "INBOX").await?, vec![1]);
        let thread_rows = t
            .ctx
            .sql
            .count("SELECT COUNT(*) FROM threads WHERE account_id=?", (acc.id,))
            .await?;
        assert_eq!(thread_rows, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_cross_folder_dedup() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        let body = build_mail("me@example.com", "bob@example.com", "out", "sent\n");
        fixture.add_message("INBOX", &body, 20, 20, &[]);
        fixture.add_message("[Gmail]/Sent Mail", &body, 20, 20, &["\\Sent"]);

        let tt = make_task(&t, &fixture, "INBOX", false).await;
        let acc = tt.task.account.clone();
        tt.task.run().await?;
        let tt = make_task_for(&t, &acc, &fixture, "[Gmail]/Sent Mail", false);
        tt.task.run().await?;

        // One stored body, two memberships.
        assert_eq!(message_count(&t).await, 1);
        assert_eq!(folder_uid::local_uids(&t.ctx, acc.id, "INBOX").await?, vec![1]);
        assert_eq!(
            folder_uid::local_uids(&t.ctx, acc.id, "[Gmail]/Sent Mail").await?,
            vec![1]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_folders_share_one_thread() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        // One conversation scattered over three folders, every copy carrying
        // the same X-GM-THRID.
        let thrid = 77;
        for (n, folder, subject) in [
            (70, "INBOX", "race"),
            (71, "[Gmail]/Sent Mail", "Re: race"),
            (72, "[Gmail]/Trash", "Re: race"),
        ] {
            let body = build_mail("alice@example.com", "me@example.com", subject, "hi\n");
            fixture.add_message(folder, &body, n, thrid, &[]);
        }

        let mut acc = t.create_account("me@example.com").await;
        acc.save_folder_names(&t.ctx, crate::test_utils::gmail_folder_names())
            .await?;
        let (resolver, resolver_handle) = ThreadResolver::spawn(t.ctx.clone(), acc.id);
        let mut handles = Vec::new();
        let mut guards = Vec::new();
        for folder in ["INBOX", "[Gmail]/Sent Mail", "[Gmail]/Trash"] {
            let tt = make_task_with(&t, &acc, &fixture, folder, false, resolver.clone());
            handles.push(tokio::spawn(tt.task.run()));
            guards.push(tt._shutdown);
        }
        for handle in handles {
            handle.await??;
        }
        drop(resolver);
        resolver_handle.await?;

        // Every machine raced to create the thread; exactly one row won.
        let thread_rows = t
            .ctx
            .sql
            .count(
                "SELECT COUNT(*) FROM threads WHERE account_id=? AND g_thrid=?",
                (acc.id, thrid as i64),
            )
            .await?;
        assert_eq!(thread_rows, 1);
        assert_eq!(message_count(&t).await, 3);

        // All three copies point at the winning row.
        let thread = Thread::load_by_thrid(&t.ctx, acc.id, thrid).await?.unwrap();
        for g_msgid in [70, 71, 72] {
            let id = Message::id_by_g_msgid(&t.ctx, acc.id, g_msgid)
                .await?
                .unwrap();
            let msg = Message::load(&t.ctx, id).await?.unwrap();
            assert_eq!(msg.thread_id, Some(thread.id));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_picks_up_new_flags_and_deletions() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        mail_in_both(&fixture, 30, "a");
        mail_in_both(&fixture, 31, "b");

        let mut tt = make_task(&t, &fixture, "INBOX", true).await;
        let acc = tt.task.account.clone();

        // Initial pass.
        let checkpoint = tt.task.load_checkpoint().await?;
        assert_eq!(tt.task.run_state(checkpoint).await?, SyncState::Poll);
        tt.task.save_state(SyncState::Poll).await?;
        assert_eq!(
            folder_uid::local_uids(&t.ctx, acc.id, "INBOX").await?,
            vec![1, 2]
        );

        // New mail, a flag change and a deletion arrive.
        let body = build_mail("carol@example.com", "me@example.com", "c", "new\n");
        fixture.add_message("INBOX", &body, 32, 32, &[]);
        fixture.set_flags("INBOX", 1, &["\\Seen"], &[]);
        fixture.remove_message("INBOX", 2);

        let checkpoint = tt.task.load_checkpoint().await?;
        assert_eq!(tt.task.run_state(checkpoint).await?, SyncState::Poll);

        assert_eq!(
            folder_uid::local_uids(&t.ctx, acc.id, "INBOX").await?,
            vec![1, 3]
        );
        let seen: bool = t
            .ctx
            .sql
            .query_get_value(
                "SELECT is_seen FROM folder_uids WHERE account_id=? AND folder_name='INBOX' AND uid=1",
                (acc.id,),
            )
            .await?
            .unwrap_or_default();
        assert!(seen);
        // The deleted copy is gone from the folder but the message stays;
        // All Mail still references it.
        assert!(Message::id_by_g_msgid(&t.ctx, acc.id, 31).await?.is_some());

        // An unchanged folder polls without touching the checkpoint.
        let before = tt.task.load_checkpoint().await?;
        assert_eq!(tt.task.run_state(before).await?, SyncState::Poll);
        let after = tt.task.load_checkpoint().await?;
        assert_eq!(after.highest_modseq, before.highest_modseq);
        Ok(())
    }

    #[tokio::test]
    async fn test_uidvalidity_change_remaps() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        mail_in_both(&fixture, 40, "kept");

        let mut tt = make_task(&t, &fixture, "INBOX", true).await;
        let acc = tt.task.account.clone();
        let checkpoint = tt.task.load_checkpoint().await?;
        assert_eq!(tt.task.run_state(checkpoint).await?, SyncState::Poll);
        tt.task.save_state(SyncState::Poll).await?;

        fixture.bump_uid_validity("INBOX");
        let new_uids = fixture.uids("INBOX");

        // The poll cycle trips over the new generation.
        let checkpoint = tt.task.load_checkpoint().await?;
        let err = tt.task.run_state(checkpoint).await.unwrap_err();
        assert!(err.downcast_ref::<UidValidityChanged>().is_some());
        tt.task.save_state(checkpoint.state.uidinvalid()).await?;

        // The remap state rewrites the UIDs and resumes polling.
        let checkpoint = tt.task.load_checkpoint().await?;
        assert_eq!(checkpoint.state, SyncState::PollUidInvalid);
        assert_eq!(tt.task.run_state(checkpoint).await?, SyncState::Poll);

        assert_eq!(folder_uid::local_uids(&t.ctx, acc.id, "INBOX").await?, new_uids);
        assert_eq!(message_count(&t).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_blob_failure_aborts_chunk() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        let body = build_mail("alice@example.com", "me@example.com", "poison", "bad\n");
        fixture.add_message("INBOX", &body, 50, 50, &[]);
        t.ctx.blobs.fail_on(&data_sha256(&body));

        let tt = make_task(&t, &fixture, "INBOX", false).await;
        let acc = tt.task.account.clone();
        assert!(tt.task.run().await.is_err());

        // Nothing committed: no message row and no membership.
        assert_eq!(message_count(&t).await, 0);
        assert_eq!(
            folder_uid::local_uids(&t.ctx, acc.id, "INBOX").await?,
            Vec::<u32>::new()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_send_reconcile_attaches_to_local_row() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();

        let raw = concat!(
            "From: me@example.com\r\n",
            "To: bob@example.com\r\n",
            "Subject: composed here\r\n",
            "X-Mailmirror-Id: draft-42\r\n",
            "\r\n",
            "typed locally\r\n",
        );
        let tt = make_task(&t, &fixture, "INBOX", false).await;
        let acc = tt.task.account.clone();

        // The locally composed copy is stored before the server echo
        // arrives over IMAP.
        let parsed = ingest(raw.as_bytes(), *TEST_DATE, ProviderIds::default(), &[])?;
        let account_id = acc.id;
        let local_row = t
            .ctx
            .sql
            .transaction(move |tx| message::insert_ingested(tx, account_id, None, &parsed))
            .await?;

        fixture.add_message("INBOX", raw.as_bytes(), 60, 60, &[]);
        tt.task.run().await?;

        // No duplicate; the server copy reconciled onto the local row.
        assert_eq!(message_count(&t).await, 1);
        let msg = Message::load(&t.ctx, local_row).await?.unwrap();
        assert_eq!(msg.g_msgid, Some(60));
        assert!(msg.thread_id.is_some());
        assert_eq!(
            Message::id_by_g_msgid(&t.ctx, acc.id, 60).await?,
            Some(local_row)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_run_loop_polls_until_shutdown() -> Result<()> {
        let t = TestContext::new().await;
        let fixture = ReplayFixture::with_gmail_folders();
        mail_in_both(&fixture, 70, "live");

        let tt = make_task(&t, &fixture, "INBOX", true).await;
        let acc = tt.task.account.clone();
        let shutdown = tt._shutdown;
        let handle = tokio::spawn(tt.task.run());

        // Wait for the initial download, then feed new mail through a poll
        // cycle.
        wait_for(|| {
            let ctx = t.ctx.clone();
            async move {
                folder_uid::local_uids(&ctx, acc.id, "INBOX")
                    .await
                    .map(|uids| uids == vec![1])
                    .unwrap_or(false)
            }
        })
        .await;
        let body = build_mail("dave@example.com", "me@example.com", "late", "more\n");
        fixture.add_message("INBOX", &body, 71, 71, &[]);
        wait_for(|| {
            let ctx = t.ctx.clone();
            async move {
                folder_uid::local_uids(&ctx, acc.id, "INBOX")
                    .await
                    .map(|uids| uids == vec![1, 2])
                    .unwrap_or(false)
            }
        })
        .await;

        shutdown.send(true).ok();
        handle.await??;
        Ok(())
    }

    #[test]
    fn test_structural_errors_are_not_retried() {
        let no_folder: anyhow::Error = SelectError::NoFolder("Gone".to_string()).into();
        assert!(!is_transient(&no_folder));

        let auth: anyhow::Error = PoolError::AuthFailure("token expired".to_string()).into();
        assert!(!is_transient(&auth));

        let remap: anyhow::Error = UidValidityChanged {
            folder: "INBOX".to_string(),
            cached: 1,
            current: 2,
        }
        .into();
        assert!(!is_transient(&remap));
        assert!(!is_transient(&Interrupted.into()));

        // Connection-class trouble is retried, context wrapping included.
        assert!(is_transient(&anyhow::anyhow!("connection reset by peer")));
        let select_io: anyhow::Error = SelectError::Other(anyhow::anyhow!("broken pipe")).into();
        assert!(is_transient(&select_io.context("failed to select INBOX")));
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..1000 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }
}
