//! Mail accounts and their sync leases.

use anyhow::{bail, Context as _, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::context::Context;

/// Mail provider of an account. Gmail accounts get provider-id based
/// deduplication and thread expansion; generic IMAP accounts do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Gmail over IMAP with the X-GM extensions.
    Gmail,
    /// Plain IMAP.
    Imap,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::Imap => "imap",
        }
    }

    pub fn from_str(s: &str) -> Result<Provider> {
        match s {
            "gmail" => Ok(Provider::Gmail),
            "imap" => Ok(Provider::Imap),
            other => bail!("unknown provider {other:?}"),
        }
    }
}

/// Login material, stored opaquely in the accounts table as JSON.
///
/// Token refresh is not done by the sync core; an external process updates
/// the stored credentials and the connection layer re-reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    /// Plain LOGIN.
    Password { user: String, password: String },
    /// XOAUTH2 with a previously obtained access token.
    OAuth2 { user: String, access_token: String },
}

impl Credentials {
    pub fn user(&self) -> &str {
        match self {
            Credentials::Password { user, .. } => user,
            Credentials::OAuth2 { user, .. } => user,
        }
    }
}

/// Resolved special-folder names of an account.
///
/// Gmail exposes these as XLIST/SPECIAL-USE attributes on `[Gmail]/...`
/// folders; for the sync engine only the mapping matters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderNames {
    pub inbox: Option<String>,
    pub drafts: Option<String>,
    pub sent: Option<String>,
    pub spam: Option<String>,
    pub trash: Option<String>,
    pub archive: Option<String>,
    pub all: Option<String>,
    pub important: Option<String>,
    pub starred: Option<String>,
    /// User-created label folders, sorted by name.
    pub labels: Vec<String>,
}

impl FolderNames {
    /// Checks that every required special folder was found.
    ///
    /// Archive, All Mail, Important and Starred are optional; Gmail accounts
    /// without "All Mail" have the archive folder disabled in settings.
    pub fn check_complete(&self) -> Result<()> {
        for (role, name) in [
            ("inbox", &self.inbox),
            ("drafts", &self.drafts),
            ("sent", &self.sent),
            ("spam", &self.spam),
            ("trash", &self.trash),
        ] {
            if name.is_none() {
                bail!("no {role} folder found on the server");
            }
        }
        Ok(())
    }
}

/// Outcome of trying to take an account's sync lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    /// This host now holds the lease.
    Acquired,
    /// Another host holds an unexpired lease.
    OwnedBy(String),
}

/// How long an acquired sync lease is valid without renewal.
pub const SYNC_LEASE_TTL_SECONDS: i64 = 300;

/// A mail account row.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub email_address: String,
    pub provider: Provider,
    pub imap_host: String,
    pub imap_port: u16,
    pub credentials: Credentials,
    pub folders: FolderNames,
}

impl Account {
    /// Inserts a new account and returns it.
    pub async fn create(
        context: &Context,
        email_address: &str,
        provider: Provider,
        imap_host: &str,
        imap_port: u16,
        credentials: &Credentials,
    ) -> Result<Account> {
        let id = context
            .sql
            .insert(
                "INSERT INTO accounts (email_address, provider, imap_host, imap_port, credentials)
                 VALUES (?, ?, ?, ?, ?)",
                (
                    email_address,
                    provider.as_str(),
                    imap_host,
                    imap_port,
                    serde_json::to_string(credentials)?,
                ),
            )
            .await
            .with_context(|| format!("failed to create account {email_address}"))?;
        Ok(Account {
            id,
            email_address: email_address.to_string(),
            provider,
            imap_host: imap_host.to_string(),
            imap_port,
            credentials: credentials.clone(),
            folders: FolderNames::default(),
        })
    }

    /// Loads an account by id.
    pub async fn load(context: &Context, id: i64) -> Result<Option<Account>> {
        context
            .sql
            .query_row_optional(
                "SELECT id, email_address, provider, imap_host, imap_port, credentials,
                        inbox_folder, drafts_folder, sent_folder, spam_folder, trash_folder,
                        archive_folder, all_folder, important_folder, starred_folder,
                        label_folders
                 FROM accounts WHERE id=?",
                (id,),
                Self::from_row,
            )
            .await?
            .transpose()
    }

    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Result<Account>> {
        let provider: String = row.get(2)?;
        let credentials: String = row.get(5)?;
        let labels: String = row.get(15)?;
        let folders = FolderNames {
            inbox: row.get(6)?,
            drafts: row.get(7)?,
            sent: row.get(8)?,
            spam: row.get(9)?,
            trash: row.get(10)?,
            archive: row.get(11)?,
            all: row.get(12)?,
            important: row.get(13)?,
            starred: row.get(14)?,
            labels: Vec::new(),
        };
        Ok((move || {
            let mut folders = folders;
            folders.labels =
                serde_json::from_str(&labels).context("corrupt account label folders")?;
            Ok(Account {
                id: row.get(0)?,
                email_address: row.get(1)?,
                provider: Provider::from_str(&provider)?,
                imap_host: row.get(3)?,
                imap_port: row.get(4)?,
                credentials: serde_json::from_str(&credentials)
                    .context("corrupt account credentials")?,
                folders,
            })
        })())
    }

    /// Returns ids of all accounts, ordered by id.
    pub async fn all_ids(context: &Context) -> Result<Vec<i64>> {
        context
            .sql
            .query_map(
                "SELECT id FROM accounts ORDER BY id",
                (),
                |row| row.get(0),
                |rows| rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into),
            )
            .await
    }

    /// Returns ids of accounts whose sync lease is held by `host`.
    pub async fn ids_leased_by(context: &Context, host: &str) -> Result<Vec<i64>> {
        context
            .sql
            .query_map(
                "SELECT id FROM accounts WHERE sync_host=? ORDER BY id",
                (host,),
                |row| row.get(0),
                |rows| rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into),
            )
            .await
    }

    /// Re-reads credentials from the database.
    ///
    /// Called after an authentication failure in case an external refresher
    /// has stored a new access token meanwhile.
    pub async fn reload_credentials(&mut self, context: &Context) -> Result<()> {
        let raw: String = context
            .sql
            .query_row(
                "SELECT credentials FROM accounts WHERE id=?",
                (self.id,),
                |row| row.get(0),
            )
            .await?;
        self.credentials = serde_json::from_str(&raw).context("corrupt account credentials")?;
        Ok(())
    }

    /// Persists resolved special-folder names.
    ///
    /// A special folder that was already saved under a different name is an
    /// error: sync state is keyed by folder name, silently following a rename
    /// would orphan the existing checkpoints.
    pub async fn save_folder_names(&mut self, context: &Context, names: FolderNames) -> Result<()> {
        names.check_complete()?;
        for (role, old, new) in [
            ("inbox", &self.folders.inbox, &names.inbox),
            ("drafts", &self.folders.drafts, &names.drafts),
            ("sent", &self.folders.sent, &names.sent),
            ("spam", &self.folders.spam, &names.spam),
            ("trash", &self.folders.trash, &names.trash),
            ("all", &self.folders.all, &names.all),
        ] {
            if let (Some(old), Some(new)) = (old, new) {
                if old != new {
                    bail!("{role} folder changed from {old:?} to {new:?}");
                }
            }
        }
        context
            .sql
            .execute(
                "UPDATE accounts SET inbox_folder=?, drafts_folder=?, sent_folder=?,
                        spam_folder=?, trash_folder=?, archive_folder=?, all_folder=?,
                        important_folder=?, starred_folder=?, label_folders=?
                 WHERE id=?",
                (
                    &names.inbox,
                    &names.drafts,
                    &names.sent,
                    &names.spam,
                    &names.trash,
                    &names.archive,
                    &names.all,
                    &names.important,
                    &names.starred,
                    serde_json::to_string(&names.labels)?,
                    self.id,
                ),
            )
            .await?;
        self.folders = names;
        Ok(())
    }

    /// Tries to take this account's sync lease for `host`.
    ///
    /// The lease transfers if it is free, already held by `host`, or expired.
    /// A single conditional UPDATE keeps the check-and-take atomic.
    pub async fn try_acquire_sync_lease(
        &self,
        context: &Context,
        host: &str,
    ) -> Result<LeaseOutcome> {
        let now = Utc::now().timestamp();
        let expires = now + SYNC_LEASE_TTL_SECONDS;
        let updated = context
            .sql
            .execute(
                "UPDATE accounts SET sync_host=?, sync_lease_expires=?
                 WHERE id=?
                   AND (sync_host IS NULL OR sync_host=? OR sync_lease_expires<?)",
                (host, expires, self.id, host, now),
            )
            .await?;
        if updated > 0 {
            return Ok(LeaseOutcome::Acquired);
        }
        let owner: Option<String> = context
            .sql
            .query_get_value("SELECT sync_host FROM accounts WHERE id=?", (self.id,))
            .await?;
        Ok(LeaseOutcome::OwnedBy(owner.unwrap_or_default()))
    }

    /// Extends the lease held by `host`. Returns false if the lease was lost.
    pub async fn renew_sync_lease(&self, context: &Context, host: &str) -> Result<bool> {
        let expires = Utc::now().timestamp() + SYNC_LEASE_TTL_SECONDS;
        let updated = context
            .sql
            .execute(
                "UPDATE accounts SET sync_lease_expires=? WHERE id=? AND sync_host=?",
                (expires, self.id, host),
            )
            .await?;
        Ok(updated > 0)
    }

    /// Releases the lease if held by `host`.
    pub async fn release_sync_lease(&self, context: &Context, host: &str) -> Result<()> {
        context
            .sql
            .execute(
                "UPDATE accounts SET sync_host=NULL, sync_lease_expires=NULL
                 WHERE id=? AND sync_host=?",
                (self.id, host),
            )
            .await?;
        Ok(())
    }

    /// Folders to sync, highest priority first.
    ///
    /// The interactive folders come first so new mail shows up quickly;
    /// All Mail, which carries the bulk of the account, only starts once
    /// they are done.
    pub fn sync_folders(&self) -> Vec<String> {
        let f = &self.folders;
        let ordered = [&f.inbox, &f.drafts, &f.sent, &f.starred, &f.important];
        let mut res: Vec<String> = Vec::new();
        for name in ordered
            .into_iter()
            .flatten()
            .chain(f.labels.iter())
            .chain([&f.all, &f.trash, &f.spam].into_iter().flatten())
        {
            if !res.contains(name) {
                res.push(name.clone());
            }
        }
        res
    }

    /// Folders that stay in the poll set after their initial sync finished.
    ///
    /// Low-traffic folders run to `finish` instead of polling forever.
    pub fn poll_folders(&self) -> Vec<String> {
        let f = &self.folders;
        let mut res: Vec<String> = Vec::new();
        for name in [&f.inbox, &f.all, &f.drafts, &f.sent].into_iter().flatten() {
            if !res.contains(name) {
                res.push(name.clone());
            }
        }
        res
    }
}
