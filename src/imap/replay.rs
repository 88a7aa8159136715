//! Deterministic in-memory IMAP implementation.
//!
//! [`ReplaySession`] serves a [`ReplayFixture`] through the
//! [`MailSession`] trait, so the whole sync engine can run against scripted
//! mailbox contents without a network. The fixture is shared and mutable:
//! tests mutate it between sync passes to simulate server-side changes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use super::pool::{PoolError, SessionConnector};
use super::session::{
    FlagSet, FolderListing, FolderStatus, GmailMetadata, MailSession, RawMessage, SelectError,
    SelectInfo,
};
use crate::ingest::ProviderIds;

/// One message stored in a fixture folder.
#[derive(Debug, Clone)]
pub struct ReplayMessage {
    pub body: Vec<u8>,
    pub internal_date: DateTime<Utc>,
    pub flags: Vec<String>,
    pub labels: Vec<String>,
    pub g_msgid: Option<u64>,
    pub g_thrid: Option<u64>,
    modseq: u64,
}

#[derive(Debug, Default)]
struct ReplayFolder {
    uid_validity: u32,
    highest_modseq: u64,
    next_uid: u32,
    messages: BTreeMap<u32, ReplayMessage>,
}

#[derive(Debug, Default)]
struct FixtureInner {
    folders: BTreeMap<String, ReplayFolder>,
    listing: Vec<FolderListing>,
}

/// Scripted mailbox contents shared by all sessions of one fixture.
#[derive(Debug, Clone, Default)]
pub struct ReplayFixture {
    inner: Arc<Mutex<FixtureInner>>,
}

impl ReplayFixture {
    /// An empty fixture without folders.
    pub fn new() -> ReplayFixture {
        Default::default()
    }

    /// A fixture with the standard Gmail folder set.
    pub fn with_gmail_folders() -> ReplayFixture {
        let fixture = ReplayFixture::new();
        fixture.add_folder("INBOX", &[]);
        fixture.add_folder("[Gmail]", &["\\Noselect"]);
        fixture.add_folder("[Gmail]/All Mail", &["\\All"]);
        fixture.add_folder("[Gmail]/Drafts", &["\\Drafts"]);
        fixture.add_folder("[Gmail]/Sent Mail", &["\\Sent"]);
        fixture.add_folder("[Gmail]/Spam", &["\\Junk"]);
        fixture.add_folder("[Gmail]/Trash", &["\\Trash"]);
        fixture
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FixtureInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a folder; `\Noselect` folders appear in the listing only.
    pub fn add_folder(&self, name: &str, flags: &[&str]) {
        let mut inner = self.lock();
        inner.listing.push(FolderListing {
            name: name.to_string(),
            delimiter: Some("/".to_string()),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        });
        if !flags.contains(&"\\Noselect") {
            inner.folders.insert(
                name.to_string(),
                ReplayFolder {
                    uid_validity: 1,
                    highest_modseq: 1,
                    next_uid: 1,
                    messages: BTreeMap::new(),
                },
            );
        }
    }

    /// Stores a message in a folder and returns its UID.
    pub fn add_message(
        &self,
        folder: &str,
        body: &[u8],
        g_msgid: u64,
        g_thrid: u64,
        labels: &[&str],
    ) -> u32 {
        let mut inner = self.lock();
        let folder = inner
            .folders
            .get_mut(folder)
            .unwrap_or_else(|| panic!("no fixture folder {folder:?}"));
        let uid = folder.next_uid;
        folder.next_uid += 1;
        folder.highest_modseq += 1;
        let modseq = folder.highest_modseq;
        folder.messages.insert(
            uid,
            ReplayMessage {
                body: body.to_vec(),
                internal_date: Utc
                    .timestamp_opt(1_600_000_000 + i64::from(uid) * 60, 0)
                    .single()
                    .unwrap_or_default(),
                flags: Vec::new(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
                g_msgid: Some(g_msgid),
                g_thrid: Some(g_thrid),
                modseq,
            },
        );
        uid
    }

    /// Removes a message, as an expunged deletion would.
    pub fn remove_message(&self, folder: &str, uid: u32) {
        let mut inner = self.lock();
        if let Some(folder) = inner.folders.get_mut(folder) {
            folder.highest_modseq += 1;
            folder.messages.remove(&uid);
        }
    }

    /// Replaces the flags and labels of a message, bumping its modseq.
    pub fn set_flags(&self, folder: &str, uid: u32, flags: &[&str], labels: &[&str]) {
        let mut inner = self.lock();
        if let Some(folder) = inner.folders.get_mut(folder) {
            folder.highest_modseq += 1;
            let modseq = folder.highest_modseq;
            if let Some(msg) = folder.messages.get_mut(&uid) {
                msg.flags = flags.iter().map(|s| s.to_string()).collect();
                msg.labels = labels.iter().map(|s| s.to_string()).collect();
                msg.modseq = modseq;
            }
        }
    }

    /// Starts a new UIDVALIDITY generation: all messages keep their content
    /// but get fresh UIDs.
    pub fn bump_uid_validity(&self, folder: &str) {
        let mut inner = self.lock();
        if let Some(folder) = inner.folders.get_mut(folder) {
            folder.uid_validity += 1;
            folder.highest_modseq += 1;
            let old = std::mem::take(&mut folder.messages);
            // Renumber with a gap so old and new UIDs never collide.
            let mut uid = 1000 * folder.uid_validity;
            for (_, msg) in old {
                folder.messages.insert(uid, msg);
                uid += 1;
            }
            folder.next_uid = uid;
        }
    }

    /// Current HIGHESTMODSEQ of a folder, for test assertions.
    pub fn highest_modseq(&self, folder: &str) -> u64 {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.highest_modseq)
            .unwrap_or_default()
    }

    /// Current UIDs of a folder, for test assertions.
    pub fn uids(&self, folder: &str) -> Vec<u32> {
        self.lock()
            .folders
            .get(folder)
            .map(|f| f.messages.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// A [`MailSession`] backed by a [`ReplayFixture`].
#[derive(Debug)]
pub struct ReplaySession {
    fixture: ReplayFixture,
    selected: Option<(String, SelectInfo)>,
}

impl ReplaySession {
    pub fn new(fixture: ReplayFixture) -> ReplaySession {
        ReplaySession {
            fixture,
            selected: None,
        }
    }

    fn selected_name(&self) -> Result<String> {
        self.selected
            .as_ref()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| anyhow::anyhow!("no folder selected"))
    }

    fn with_folder<T>(
        &self,
        name: &str,
        f: impl FnOnce(&ReplayFolder) -> T,
    ) -> Result<T> {
        let inner = self.fixture.lock();
        let folder = inner
            .folders
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("no folder {name:?}"))?;
        Ok(f(folder))
    }
}

#[async_trait]
impl MailSession for ReplaySession {
    async fn list_folders(&mut self) -> Result<Vec<FolderListing>> {
        Ok(self.fixture.lock().listing.clone())
    }

    async fn select_folder(&mut self, folder: &str) -> Result<SelectInfo, SelectError> {
        self.selected = None;
        let info = {
            let inner = self.fixture.lock();
            let Some(state) = inner.folders.get(folder) else {
                return Err(SelectError::NoFolder(folder.to_string()));
            };
            SelectInfo {
                uid_validity: state.uid_validity,
                highest_modseq: Some(state.highest_modseq),
                exists: state.messages.len() as u32,
            }
        };
        self.selected = Some((folder.to_string(), info));
        Ok(info)
    }

    fn selected(&self) -> Option<(&str, &SelectInfo)> {
        self.selected
            .as_ref()
            .map(|(name, info)| (name.as_str(), info))
    }

    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus> {
        self.with_folder(folder, |f| FolderStatus {
            uid_validity: Some(f.uid_validity),
            highest_modseq: Some(f.highest_modseq),
        })
    }

    async fn all_uids(&mut self) -> Result<Vec<u32>> {
        let name = self.selected_name()?;
        self.with_folder(&name, |f| {
            f.messages
                .iter()
                .filter(|(_, m)| !m.flags.iter().any(|fl| fl == "\\Deleted"))
                .map(|(&uid, _)| uid)
                .collect()
        })
    }

    async fn fetch_provider_ids(
        &mut self,
        uids: &[u32],
    ) -> Result<BTreeMap<u32, GmailMetadata>> {
        let name = self.selected_name()?;
        self.with_folder(&name, |f| {
            uids.iter()
                .filter_map(|uid| {
                    let msg = f.messages.get(uid)?;
                    Some((
                        *uid,
                        GmailMetadata {
                            g_msgid: msg.g_msgid?,
                            g_thrid: msg.g_thrid?,
                        },
                    ))
                })
                .collect()
        })
    }

    async fn fetch_changed_uids(&mut self, since_modseq: u64) -> Result<Vec<u32>> {
        let name = self.selected_name()?;
        self.with_folder(&name, |f| {
            f.messages
                .iter()
                .filter(|(_, m)| m.modseq > since_modseq)
                .filter(|(_, m)| !m.flags.iter().any(|fl| fl == "\\Deleted"))
                .map(|(&uid, _)| uid)
                .collect()
        })
    }

    async fn fetch_flags(&mut self, uids: &[u32]) -> Result<BTreeMap<u32, FlagSet>> {
        let name = self.selected_name()?;
        self.with_folder(&name, |f| {
            uids.iter()
                .filter_map(|uid| {
                    let msg = f.messages.get(uid)?;
                    Some((
                        *uid,
                        FlagSet {
                            flags: msg.flags.clone(),
                            labels: msg.labels.clone(),
                        },
                    ))
                })
                .collect()
        })
    }

    async fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>> {
        let name = self.selected_name()?;
        self.with_folder(&name, |f| {
            uids.iter()
                .filter_map(|uid| {
                    let msg = f.messages.get(uid)?;
                    if msg.flags.iter().any(|fl| fl == "\\Deleted") {
                        return None;
                    }
                    Some(RawMessage {
                        uid: *uid,
                        internal_date: msg.internal_date,
                        flags: FlagSet {
                            flags: msg.flags.clone(),
                            labels: msg.labels.clone(),
                        },
                        body: msg.body.clone(),
                        ids: ProviderIds {
                            g_msgid: msg.g_msgid,
                            g_thrid: msg.g_thrid,
                        },
                    })
                })
                .collect()
        })
    }

    async fn expand_thread_members(&mut self, thrids: &[u64]) -> Result<Vec<u32>> {
        let name = self.selected_name()?;
        self.with_folder(&name, |f| {
            let mut uids: Vec<u32> = f
                .messages
                .iter()
                .filter(|(_, m)| m.g_thrid.map(|t| thrids.contains(&t)).unwrap_or(false))
                .filter(|(_, m)| !m.flags.iter().any(|fl| fl == "\\Deleted"))
                .map(|(&uid, _)| uid)
                .collect();
            uids.reverse();
            uids
        })
    }

    async fn noop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }
}

/// Creates [`ReplaySession`]s for a pool, with scriptable login failures.
#[derive(Debug)]
pub struct ReplayConnector {
    fixture: ReplayFixture,
    connects: Arc<AtomicUsize>,
    refreshes: Arc<AtomicUsize>,
    remaining_login_failures: Arc<AtomicUsize>,
}

impl ReplayConnector {
    pub fn new(fixture: ReplayFixture) -> ReplayConnector {
        ReplayConnector {
            fixture,
            connects: Arc::new(AtomicUsize::new(0)),
            refreshes: Arc::new(AtomicUsize::new(0)),
            remaining_login_failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next `n` login attempts fail with an auth error.
    pub fn fail_logins(&self, n: usize) {
        self.remaining_login_failures.store(n, Ordering::SeqCst);
    }

    /// Counter of successful connects.
    pub fn connect_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }

    /// Counter of credential refreshes.
    pub fn refresh_count(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.refreshes)
    }
}

#[async_trait]
impl SessionConnector for ReplayConnector {
    async fn connect(&self) -> Result<Box<dyn MailSession>, PoolError> {
        let remaining = self.remaining_login_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != usize::MAX {
                self.remaining_login_failures
                    .store(remaining - 1, Ordering::SeqCst);
            }
            return Err(PoolError::AuthFailure(
                "[AUTHENTICATIONFAILED] Invalid credentials (Failure)".to_string(),
            ));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ReplaySession::new(self.fixture.clone())))
    }

    async fn refresh_credentials(&self) -> Result<(), PoolError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_replay_select_and_fetch() -> Result<()> {
        let fixture = ReplayFixture::with_gmail_folders();
        let uid = fixture.add_message("INBOX", b"From: a@b\r\n\r\nhi", 1, 1, &["\\Inbox"]);

        let mut session = ReplaySession::new(fixture.clone());
        assert!(matches!(
            session.select_folder("nope").await,
            Err(SelectError::NoFolder(_))
        ));

        let info = session.select_folder("INBOX").await?;
        assert_eq!(info.uid_validity, 1);
        assert_eq!(info.exists, 1);

        assert_eq!(session.all_uids().await?, vec![uid]);
        let ids = session.fetch_provider_ids(&[uid]).await?;
        assert_eq!(ids[&uid].g_msgid, 1);

        let bodies = session.fetch_bodies(&[uid]).await?;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].body, b"From: a@b\r\n\r\nhi".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_modseq_tracking() -> Result<()> {
        let fixture = ReplayFixture::with_gmail_folders();
        let uid1 = fixture.add_message("INBOX", b"m1", 1, 1, &[]);
        let mut session = ReplaySession::new(fixture.clone());
        session.select_folder("INBOX").await?;
        let baseline = fixture.highest_modseq("INBOX");

        let uid2 = fixture.add_message("INBOX", b"m2", 2, 2, &[]);
        fixture.set_flags("INBOX", uid1, &["\\Seen"], &[]);

        let changed = session.fetch_changed_uids(baseline).await?;
        assert_eq!(changed, vec![uid1, uid2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_replay_uid_validity_bump() -> Result<()> {
        let fixture = ReplayFixture::with_gmail_folders();
        fixture.add_message("INBOX", b"m1", 1, 1, &[]);
        fixture.bump_uid_validity("INBOX");

        let mut session = ReplaySession::new(fixture.clone());
        let info = session.select_folder("INBOX").await?;
        assert_eq!(info.uid_validity, 2);
        let uids = session.all_uids().await?;
        assert_eq!(uids, vec![2000]);
        Ok(())
    }
}
