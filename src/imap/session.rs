//! IMAP session abstraction and the provider-backed implementation.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, bail, ensure, Context as _, Result};
use async_imap::imap_proto::{AttributeValue, NameAttribute, Response, Status};
use async_imap::types::Name;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};

use super::build_sequence_set;
use crate::account::FolderNames;
use crate::ingest::ProviderIds;

/// How many thread ids go into one `X-GM-THRID` OR search.
const THRID_SEARCH_CHUNK: usize = 100;

/// One folder returned by LIST.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderListing {
    pub name: String,
    pub delimiter: Option<String>,
    /// Name attributes in canonical backslash form, e.g. `\All`.
    pub flags: Vec<String>,
}

/// What SELECT told us about a folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectInfo {
    pub uid_validity: u32,
    /// None if the server does not support CONDSTORE.
    pub highest_modseq: Option<u64>,
    pub exists: u32,
}

/// What STATUS told us about a folder, without selecting it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStatus {
    pub uid_validity: Option<u32>,
    pub highest_modseq: Option<u64>,
}

/// Gmail's folder-independent identifiers of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmailMetadata {
    pub g_msgid: u64,
    pub g_thrid: u64,
}

/// Raw flags and Gmail labels of one folder copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagSet {
    pub flags: Vec<String>,
    pub labels: Vec<String>,
}

/// One fully fetched message.
#[derive(Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub internal_date: DateTime<Utc>,
    pub flags: FlagSet,
    pub body: Vec<u8>,
    pub ids: ProviderIds,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("uid", &self.uid)
            .field("size", &self.body.len())
            .field("ids", &self.ids)
            .finish()
    }
}

/// Error of folder selection.
#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    /// The folder does not exist on the server.
    #[error("no folder {0:?}")]
    NoFolder(String),

    /// Any other error, e.g. connection loss.
    #[error("failed to select folder")]
    Other(#[from] anyhow::Error),
}

/// The operations the sync engine needs from an IMAP server.
///
/// All UID commands require a prior [`MailSession::select_folder`]; folder
/// selection is always explicit, implementations never select on their own.
#[async_trait]
pub trait MailSession: Send + fmt::Debug {
    /// Lists all folders of the account.
    async fn list_folders(&mut self) -> Result<Vec<FolderListing>>;

    /// Selects a folder, preferring `SELECT (CONDSTORE)`.
    async fn select_folder(&mut self, folder: &str) -> Result<SelectInfo, SelectError>;

    /// The currently selected folder, if any.
    fn selected(&self) -> Option<(&str, &SelectInfo)>;

    /// UIDVALIDITY and HIGHESTMODSEQ of a folder without selecting it.
    async fn folder_status(&mut self, folder: &str) -> Result<FolderStatus>;

    /// All UIDs of undeleted messages in the selected folder, ascending.
    async fn all_uids(&mut self) -> Result<Vec<u32>>;

    /// X-GM-MSGID and X-GM-THRID for the given UIDs.
    ///
    /// Empty on servers without the Gmail extensions.
    async fn fetch_provider_ids(&mut self, uids: &[u32])
        -> Result<BTreeMap<u32, GmailMetadata>>;

    /// UIDs of undeleted messages changed after `since_modseq`.
    async fn fetch_changed_uids(&mut self, since_modseq: u64) -> Result<Vec<u32>>;

    /// Current flags and labels of the given UIDs.
    async fn fetch_flags(&mut self, uids: &[u32]) -> Result<BTreeMap<u32, FlagSet>>;

    /// Full bodies with flags, internal dates and provider ids.
    ///
    /// Messages flagged `\Deleted` or returned without a body are skipped.
    async fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>>;

    /// UIDs in the selected folder of all messages belonging to the given
    /// threads, descending.
    async fn expand_thread_members(&mut self, thrids: &[u64]) -> Result<Vec<u32>>;

    /// NOOP, used as a keepalive probe.
    async fn noop(&mut self) -> Result<()>;

    /// Logs out; the session is unusable afterwards.
    async fn logout(&mut self) -> Result<()>;
}

/// Derives the special-folder mapping from a LIST response.
///
/// Gmail marks its system folders with SPECIAL-USE attributes; the INBOX is
/// identified by name. On Gmail, "All Mail" doubles as the archive.
pub fn resolve_folder_names(listing: &[FolderListing]) -> FolderNames {
    let mut names = FolderNames::default();
    for folder in listing {
        if folder.flags.iter().any(|f| f == "\\Noselect") {
            continue;
        }
        if folder.name.eq_ignore_ascii_case("INBOX") {
            names.inbox = Some(folder.name.clone());
            continue;
        }
        let mut special = false;
        for flag in &folder.flags {
            let target = match flag.as_str() {
                "\\Drafts" => &mut names.drafts,
                "\\Sent" => &mut names.sent,
                "\\Spam" | "\\Junk" => &mut names.spam,
                "\\Trash" => &mut names.trash,
                "\\All" | "\\AllMail" => &mut names.all,
                "\\Important" => &mut names.important,
                "\\Flagged" | "\\Starred" => &mut names.starred,
                _ => continue,
            };
            special = true;
            if target.is_none() {
                *target = Some(folder.name.clone());
            }
        }
        if !special {
            names.labels.push(folder.name.clone());
        }
    }
    names.labels.sort();
    if names.archive.is_none() {
        names.archive = names.all.clone();
    }
    names
}

pub(crate) type TlsStream = async_native_tls::TlsStream<tokio::net::TcpStream>;

/// A logged-in session talking to a real IMAP server.
pub struct ImapSession {
    pub(crate) inner: async_imap::Session<TlsStream>,

    /// True if the server announced CONDSTORE.
    pub can_condstore: bool,

    /// True if the server announced the Gmail extensions (X-GM-EXT-1).
    pub is_gmail: bool,

    selected: Option<(String, SelectInfo)>,
}

impl fmt::Debug for ImapSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapSession")
            .field("can_condstore", &self.can_condstore)
            .field("is_gmail", &self.is_gmail)
            .field("selected", &self.selected)
            .finish()
    }
}

impl ImapSession {
    pub(crate) fn new(
        inner: async_imap::Session<TlsStream>,
        can_condstore: bool,
        is_gmail: bool,
    ) -> Self {
        Self {
            inner,
            can_condstore,
            is_gmail,
            selected: None,
        }
    }

    fn require_selected(&self) -> Result<()> {
        if self.selected.is_none() {
            return Err(anyhow!("no folder selected"));
        }
        Ok(())
    }

    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>> {
        let uids = self
            .inner
            .uid_search(query)
            .await
            .with_context(|| format!("UID SEARCH {query:?} failed"))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Runs a raw UID FETCH and collects the per-message attributes.
    ///
    /// async-imap's typed `Fetch` does not surface the `X-GM-*` attributes,
    /// so the untagged responses are drained by hand here.
    async fn uid_fetch_items(&mut self, uids: &[u32], query: &str) -> Result<Vec<FetchItem>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = build_sequence_set(uids);
        let command = format!("UID FETCH {set} {query}");
        let tag = self
            .inner
            .run_command(&command)
            .await
            .with_context(|| format!("{command} failed"))?;
        let mut items = Vec::new();
        loop {
            let response = self
                .inner
                .read_response()
                .await
                .context("connection closed during FETCH")?
                .context("failed to read FETCH response")?;
            match response.parsed() {
                Response::Fetch(_, attrs) => items.push(FetchItem::from_attrs(attrs)),
                Response::Done {
                    tag: done,
                    status,
                    information,
                    ..
                } => {
                    ensure!(*done == tag, "response to unexpected command {done:?}");
                    if *status != Status::Ok {
                        bail!(
                            "{command} failed: {}",
                            information.as_deref().unwrap_or("no information")
                        );
                    }
                    return Ok(items);
                }
                // EXISTS and friends, sent at the server's whim.
                _ => {}
            }
        }
    }
}

/// INTERNALDATE format of RFC 3501.
const INTERNAL_DATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

/// Attributes of one message in a UID FETCH response.
#[derive(Debug, Default)]
struct FetchItem {
    uid: Option<u32>,
    flags: Vec<String>,
    labels: Vec<String>,
    internal_date: Option<DateTime<Utc>>,
    body: Option<Vec<u8>>,
    g_msgid: Option<u64>,
    g_thrid: Option<u64>,
}

impl FetchItem {
    fn from_attrs(attrs: &[AttributeValue<'_>]) -> FetchItem {
        let mut item = FetchItem::default();
        for attr in attrs {
            match attr {
                AttributeValue::Uid(uid) => item.uid = Some(*uid),
                AttributeValue::Flags(flags) => {
                    item.flags = flags.iter().map(|f| f.to_string()).collect();
                }
                AttributeValue::GmailLabels(labels) => {
                    item.labels = labels.iter().map(|l| l.to_string()).collect();
                }
                AttributeValue::GmailMsgId(id) => item.g_msgid = Some(*id),
                AttributeValue::GmailThrId(id) => item.g_thrid = Some(*id),
                AttributeValue::InternalDate(raw) => {
                    item.internal_date = DateTime::parse_from_str(raw, INTERNAL_DATE_FORMAT)
                        .ok()
                        .map(|d| d.with_timezone(&Utc));
                }
                AttributeValue::BodySection {
                    data: Some(data), ..
                }
                | AttributeValue::Rfc822(Some(data)) => item.body = Some(data.to_vec()),
                _ => {}
            }
        }
        item
    }

    fn flagset(&self) -> FlagSet {
        FlagSet {
            flags: self.flags.clone(),
            labels: self.labels.clone(),
        }
    }
}

fn attr_to_string(attr: &NameAttribute<'_>) -> Option<String> {
    let flag = match attr {
        NameAttribute::All => "\\All",
        NameAttribute::Archive => "\\Archive",
        NameAttribute::Drafts => "\\Drafts",
        NameAttribute::Flagged => "\\Flagged",
        NameAttribute::Junk => "\\Junk",
        NameAttribute::Sent => "\\Sent",
        NameAttribute::Trash => "\\Trash",
        NameAttribute::Marked => "\\Marked",
        NameAttribute::Unmarked => "\\Unmarked",
        NameAttribute::NoInferiors => "\\NoInferiors",
        NameAttribute::NoSelect => "\\Noselect",
        NameAttribute::Extension(s) => return Some(s.to_string()),
        _ => return None,
    };
    Some(flag.to_string())
}

fn listing_from_name(name: &Name) -> FolderListing {
    FolderListing {
        name: name.name().to_string(),
        delimiter: name.delimiter().map(|d| d.to_string()),
        flags: name.attributes().iter().filter_map(attr_to_string).collect(),
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn list_folders(&mut self) -> Result<Vec<FolderListing>> {
        let names: Vec<Name> = self
            .inner
            .list(Some(""), Some("*"))
            .await
            .context("LIST failed")?
            .try_collect()
            .await
            .context("failed to read LIST responses")?;
        Ok(names.iter().map(listing_from_name).collect())
    }

    async fn select_folder(&mut self, folder: &str) -> Result<SelectInfo, SelectError> {
        // A session may carry folder knowledge from what it saw while
        // another folder was selected; selecting drops it.
        self.selected = None;

        let mailbox = if self.can_condstore {
            self.inner.select_condstore(folder).await
        } else {
            self.inner.select(folder).await
        };
        let mailbox = match mailbox {
            Ok(mailbox) => mailbox,
            Err(err) => {
                let msg = err.to_string();
                if msg.to_ascii_lowercase().contains("[nonexistent]")
                    || msg.contains("Unknown Mailbox")
                {
                    return Err(SelectError::NoFolder(folder.to_string()));
                }
                return Err(SelectError::Other(
                    anyhow::Error::new(err).context(format!("failed to select {folder:?}")),
                ));
            }
        };

        let info = SelectInfo {
            uid_validity: mailbox
                .uid_validity
                .ok_or_else(|| anyhow!("SELECT {folder:?} returned no UIDVALIDITY"))?,
            highest_modseq: mailbox.highest_modseq,
            exists: mailbox.exists,
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
        let mailbox = self
            .inner
            .status(folder, "(UIDVALIDITY HIGHESTMODSEQ)")
            .await
            .with_context(|| format!("STATUS {folder:?} failed"))?;
        Ok(FolderStatus {
            uid_validity: mailbox.uid_validity,
            highest_modseq: mailbox.highest_modseq,
        })
    }

    async fn all_uids(&mut self) -> Result<Vec<u32>> {
        self.require_selected()?;
        self.uid_search("NOT DELETED").await
    }

    async fn fetch_provider_ids(
        &mut self,
        uids: &[u32],
    ) -> Result<BTreeMap<u32, GmailMetadata>> {
        self.require_selected()?;
        if !self.is_gmail {
            return Ok(BTreeMap::new());
        }
        let items = self
            .uid_fetch_items(uids, "(UID X-GM-MSGID X-GM-THRID)")
            .await?;
        let mut res = BTreeMap::new();
        for item in &items {
            let (Some(uid), Some(g_msgid), Some(g_thrid)) =
                (item.uid, item.g_msgid, item.g_thrid)
            else {
                continue;
            };
            res.insert(uid, GmailMetadata { g_msgid, g_thrid });
        }
        Ok(res)
    }

    async fn fetch_changed_uids(&mut self, since_modseq: u64) -> Result<Vec<u32>> {
        self.require_selected()?;
        if !self.can_condstore {
            return self.all_uids().await;
        }
        self.uid_search(&format!("NOT DELETED MODSEQ {}", since_modseq + 1))
            .await
    }

    async fn fetch_flags(&mut self, uids: &[u32]) -> Result<BTreeMap<u32, FlagSet>> {
        self.require_selected()?;
        let query = if self.is_gmail {
            "(UID FLAGS X-GM-LABELS)"
        } else {
            "(UID FLAGS)"
        };
        let items = self.uid_fetch_items(uids, query).await?;
        let mut res = BTreeMap::new();
        for item in &items {
            let Some(uid) = item.uid else { continue };
            res.insert(uid, item.flagset());
        }
        Ok(res)
    }

    async fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>> {
        self.require_selected()?;
        let query = if self.is_gmail {
            "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[] X-GM-MSGID X-GM-THRID X-GM-LABELS)"
        } else {
            "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])"
        };
        let items = self.uid_fetch_items(uids, query).await?;
        let mut res = Vec::new();
        for item in items {
            let Some(uid) = item.uid else { continue };
            if item.flags.iter().any(|f| f == "\\Deleted") {
                continue;
            }
            // A message deleted between SEARCH and FETCH comes back
            // without a body.
            let Some(body) = item.body else { continue };
            res.push(RawMessage {
                uid,
                internal_date: item.internal_date.unwrap_or_else(Utc::now),
                flags: FlagSet {
                    flags: item.flags,
                    labels: item.labels,
                },
                body,
                ids: ProviderIds {
                    g_msgid: item.g_msgid,
                    g_thrid: item.g_thrid,
                },
            });
        }
        Ok(res)
    }

    async fn expand_thread_members(&mut self, thrids: &[u64]) -> Result<Vec<u32>> {
        self.require_selected()?;
        if !self.is_gmail {
            return Ok(Vec::new());
        }
        let mut uids = Vec::new();
        for chunk in thrids.chunks(THRID_SEARCH_CHUNK) {
            // Polish notation: n-1 ORs in front of n criteria.
            let mut query = String::from("NOT DELETED ");
            for _ in 0..chunk.len().saturating_sub(1) {
                query.push_str("OR ");
            }
            for (i, thrid) in chunk.iter().enumerate() {
                if i > 0 {
                    query.push(' ');
                }
                query.push_str(&format!("X-GM-THRID {thrid}"));
            }
            uids.extend(self.uid_search(&query).await?);
        }
        uids.sort_unstable();
        uids.dedup();
        uids.reverse();
        Ok(uids)
    }

    async fn noop(&mut self) -> Result<()> {
        self.inner.noop().await.context("NOOP failed")
    }

    async fn logout(&mut self) -> Result<()> {
        self.inner.logout().await.context("LOGOUT failed")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn listing(name: &str, flags: &[&str]) -> FolderListing {
        FolderListing {
            name: name.to_string(),
            delimiter: Some("/".to_string()),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_resolve_folder_names() {
        let listings = vec![
            listing("INBOX", &["\\HasNoChildren"]),
            listing("[Gmail]", &["\\Noselect", "\\HasChildren"]),
            listing("[Gmail]/All Mail", &["\\All", "\\HasNoChildren"]),
            listing("[Gmail]/Drafts", &["\\Drafts"]),
            listing("[Gmail]/Sent Mail", &["\\Sent"]),
            listing("[Gmail]/Spam", &["\\Junk"]),
            listing("[Gmail]/Trash", &["\\Trash"]),
            listing("[Gmail]/Important", &["\\Important"]),
            listing("[Gmail]/Starred", &["\\Flagged"]),
            listing("work/projects", &["\\HasNoChildren"]),
            listing("Receipts", &["\\HasNoChildren"]),
        ];
        let names = resolve_folder_names(&listings);
        assert_eq!(names.inbox.as_deref(), Some("INBOX"));
        assert_eq!(names.all.as_deref(), Some("[Gmail]/All Mail"));
        // All Mail doubles as the archive.
        assert_eq!(names.archive.as_deref(), Some("[Gmail]/All Mail"));
        assert_eq!(names.drafts.as_deref(), Some("[Gmail]/Drafts"));
        assert_eq!(names.sent.as_deref(), Some("[Gmail]/Sent Mail"));
        assert_eq!(names.spam.as_deref(), Some("[Gmail]/Spam"));
        assert_eq!(names.trash.as_deref(), Some("[Gmail]/Trash"));
        assert_eq!(names.important.as_deref(), Some("[Gmail]/Important"));
        assert_eq!(names.starred.as_deref(), Some("[Gmail]/Starred"));
        // Everything else is a user label, sorted.
        assert_eq!(names.labels, ["Receipts", "work/projects"]);
        names.check_complete().unwrap();
    }

    #[test]
    fn test_resolve_folder_names_incomplete() {
        let names = resolve_folder_names(&[listing("INBOX", &[])]);
        assert_eq!(names.inbox.as_deref(), Some("INBOX"));
        assert!(names.check_complete().is_err());
    }

    #[test]
    fn test_fetch_item_collects_gmail_attributes() {
        use std::borrow::Cow;

        let attrs = vec![
            AttributeValue::Uid(42),
            AttributeValue::Flags(vec![Cow::from("\\Seen"), Cow::from("$Phishing")]),
            AttributeValue::GmailLabels(vec![Cow::from("\\Inbox"), Cow::from("work")]),
            AttributeValue::GmailMsgId(1_371_261_376_714_000_001),
            AttributeValue::GmailThrId(1_371_261_376_714_000_000),
            AttributeValue::InternalDate(Cow::from("17-Jul-2020 12:34:56 +0200")),
            AttributeValue::BodySection {
                section: None,
                index: None,
                data: Some(Cow::from(&b"raw mail"[..])),
            },
            // Servers send RFC822.SIZE and friends unasked.
            AttributeValue::Rfc822Size(8),
        ];
        let item = FetchItem::from_attrs(&attrs);
        assert_eq!(item.uid, Some(42));
        assert_eq!(item.flags, ["\\Seen", "$Phishing"]);
        assert_eq!(item.labels, ["\\Inbox", "work"]);
        assert_eq!(item.g_msgid, Some(1_371_261_376_714_000_001));
        assert_eq!(item.g_thrid, Some(1_371_261_376_714_000_000));
        assert_eq!(
            item.internal_date.map(|d| d.timestamp()),
            Some(1_594_982_096)
        );
        assert_eq!(item.body.as_deref(), Some(&b"raw mail"[..]));

        let flags = item.flagset();
        assert!(flags.flags.contains(&"\\Seen".to_string()));
        assert!(flags.labels.contains(&"work".to_string()));
    }
}
