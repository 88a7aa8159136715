//! Folder membership tracking.
//!
//! A `folder_uids` row ties a stored message to one folder under one UID of
//! the folder's current UIDVALIDITY generation. Flags live on the membership,
//! not the message, because IMAP flags are per-folder-copy.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::imap::session::FlagSet;

/// Canonicalized flags of one folder membership.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidFlags {
    pub is_seen: bool,
    pub is_draft: bool,
    pub is_flagged: bool,
    pub is_answered: bool,
    pub is_recent: bool,
    /// Flags with no dedicated column, e.g. user keywords.
    pub extra: Vec<String>,
}

impl UidFlags {
    /// Canonicalizes raw IMAP flags, folding Gmail labels in.
    ///
    /// Gmail reports a draft in "All Mail" only through the `\Draft` label,
    /// the `\Draft` system flag is not set there; either source marks the
    /// membership as a draft.
    pub fn from_imap(flags: &FlagSet) -> UidFlags {
        let mut res = UidFlags::default();
        for flag in &flags.flags {
            match flag.as_str() {
                "\\Seen" => res.is_seen = true,
                "\\Draft" => res.is_draft = true,
                "\\Flagged" => res.is_flagged = true,
                "\\Answered" => res.is_answered = true,
                "\\Recent" => res.is_recent = true,
                other => res.extra.push(other.to_string()),
            }
        }
        if flags.labels.iter().any(|l| l == "\\Draft") {
            res.is_draft = true;
        }
        res.extra.sort();
        res.extra.dedup();
        res
    }
}

/// One folder membership row.
#[derive(Debug, Clone)]
pub struct FolderUid {
    pub id: i64,
    pub account_id: i64,
    pub folder_name: String,
    pub uid: u32,
    pub message_id: i64,
    pub flags: UidFlags,
}

/// Returns all locally recorded UIDs of a folder, ascending.
pub async fn local_uids(context: &Context, account_id: i64, folder: &str) -> Result<Vec<u32>> {
    context
        .sql
        .query_map(
            "SELECT uid FROM folder_uids WHERE account_id=? AND folder_name=? ORDER BY uid",
            (account_id, folder),
            |row| row.get(0),
            |rows| rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into),
        )
        .await
}

/// Returns the provider msgids of all messages referenced from any folder of
/// the account, restricted to `candidates`.
pub async fn known_g_msgids(
    context: &Context,
    account_id: i64,
    candidates: &HashSet<u64>,
) -> Result<HashSet<u64>> {
    // The candidate set can be large; filtering client-side keeps the
    // statement simple.
    let all: HashSet<u64> = context
        .sql
        .query_map(
            "SELECT g_msgid FROM messages WHERE account_id=? AND g_msgid IS NOT NULL",
            (account_id,),
            |row| row.get::<_, i64>(0),
            |rows| {
                rows.map(|v| v.map(|v| v as u64))
                    .collect::<std::result::Result<HashSet<_>, _>>()
                    .map_err(Into::into)
            },
        )
        .await?;
    Ok(all.intersection(candidates).copied().collect())
}

/// Inserts one membership within the chunk commit transaction.
///
/// Re-running a chunk after an interrupted sync hits the same
/// `(account, folder, uid)` again; the insert is a no-op then.
pub fn insert_membership(
    tx: &rusqlite::Transaction<'_>,
    account_id: i64,
    folder: &str,
    uid: u32,
    message_id: i64,
    flags: &UidFlags,
) -> Result<bool> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO folder_uids
                (account_id, folder_name, uid, message_id,
                 is_seen, is_draft, is_flagged, is_answered, is_recent, extra_flags)
         VALUES (?,?,?,?,?,?,?,?,?,?)",
        rusqlite::params![
            account_id,
            folder,
            uid,
            message_id,
            flags.is_seen,
            flags.is_draft,
            flags.is_flagged,
            flags.is_answered,
            flags.is_recent,
            serde_json::to_string(&flags.extra)?,
        ],
    )?;
    Ok(inserted > 0)
}

/// Overwrites the flags of the given memberships.
pub async fn update_flags(
    context: &Context,
    account_id: i64,
    folder: &str,
    flags: &BTreeMap<u32, UidFlags>,
) -> Result<usize> {
    let folder = folder.to_string();
    let flags = flags.clone();
    context
        .sql
        .transaction(move |tx| {
            let mut updated = 0;
            for (uid, f) in &flags {
                updated += tx.execute(
                    "UPDATE folder_uids SET is_seen=?, is_draft=?, is_flagged=?,
                            is_answered=?, is_recent=?, extra_flags=?
                     WHERE account_id=? AND folder_name=? AND uid=?",
                    rusqlite::params![
                        f.is_seen,
                        f.is_draft,
                        f.is_flagged,
                        f.is_answered,
                        f.is_recent,
                        serde_json::to_string(&f.extra)?,
                        account_id,
                        folder,
                        uid,
                    ],
                )?;
            }
            Ok(updated)
        })
        .await
}

/// Removes memberships whose UIDs vanished from the folder.
///
/// Only the membership goes away; the message row stays as long as another
/// folder still references it.
pub async fn remove_uids(
    context: &Context,
    account_id: i64,
    folder: &str,
    uids: &[u32],
) -> Result<usize> {
    let folder = folder.to_string();
    let uids = uids.to_vec();
    context
        .sql
        .transaction(move |tx| {
            let mut removed = 0;
            for uid in &uids {
                removed += tx.execute(
                    "DELETE FROM folder_uids WHERE account_id=? AND folder_name=? AND uid=?",
                    rusqlite::params![account_id, folder, uid],
                )?;
            }
            Ok(removed)
        })
        .await
}

/// Rewrites the folder's memberships after a UIDVALIDITY change.
///
/// `new_uids` maps provider msgid to the UID of the new generation.
/// Memberships whose message has no UID in the new generation are removed.
/// Returns (remapped, removed).
pub async fn remap_uids(
    context: &Context,
    account_id: i64,
    folder: &str,
    new_uids: &BTreeMap<u64, u32>,
) -> Result<(usize, usize)> {
    let folder = folder.to_string();
    let new_uids = new_uids.clone();
    context
        .sql
        .transaction(move |tx| {
            let rows: Vec<(i64, Option<i64>)> = {
                let mut stmt = tx.prepare(
                    "SELECT f.id, m.g_msgid FROM folder_uids f
                     JOIN messages m ON m.id=f.message_id
                     WHERE f.account_id=? AND f.folder_name=?",
                )?;
                let rows = stmt
                    .query_map((account_id, &folder), |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            let mut remapped = 0;
            let mut removed = 0;
            for (membership_id, g_msgid) in rows {
                let new_uid = g_msgid.and_then(|id| new_uids.get(&(id as u64)).copied());
                match new_uid {
                    Some(uid) => {
                        remapped += tx.execute(
                            "UPDATE folder_uids SET uid=? WHERE id=?",
                            rusqlite::params![uid, membership_id],
                        )?;
                    }
                    None => {
                        removed += tx.execute(
                            "DELETE FROM folder_uids WHERE id=?",
                            rusqlite::params![membership_id],
                        )?;
                    }
                }
            }
            Ok((remapped, removed))
        })
        .await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test_utils::{store_test_message, TestContext};

    fn flagset(flags: &[&str], labels: &[&str]) -> FlagSet {
        FlagSet {
            flags: flags.iter().map(|s| s.to_string()).collect(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_flags_from_imap() {
        let f = UidFlags::from_imap(&flagset(&["\\Seen", "\\Flagged", "$Work"], &[]));
        assert!(f.is_seen);
        assert!(f.is_flagged);
        assert!(!f.is_draft);
        assert_eq!(f.extra, vec!["$Work".to_string()]);

        // Draft signalled only through the Gmail label.
        let f = UidFlags::from_imap(&flagset(&[], &["\\Draft", "\\Inbox"]));
        assert!(f.is_draft);
    }

    #[tokio::test]
    async fn test_membership_lifecycle() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;
        let msg_id = store_test_message(&t.ctx, acc.id, 500, "flags").await?;

        let account_id = acc.id;
        let flags = UidFlags::default();
        let inserted = t
            .ctx
            .sql
            .transaction(move |tx| {
                let first = insert_membership(tx, account_id, "INBOX", 7, msg_id, &flags)?;
                // Second insert of the same UID is ignored.
                let second = insert_membership(tx, account_id, "INBOX", 7, msg_id, &flags)?;
                Ok((first, second))
            })
            .await?;
        assert_eq!(inserted, (true, false));
        assert_eq!(local_uids(&t.ctx, acc.id, "INBOX").await?, vec![7]);

        let mut updates = BTreeMap::new();
        updates.insert(
            7,
            UidFlags {
                is_seen: true,
                ..Default::default()
            },
        );
        assert_eq!(update_flags(&t.ctx, acc.id, "INBOX", &updates).await?, 1);

        assert_eq!(remove_uids(&t.ctx, acc.id, "INBOX", &[7, 8]).await?, 1);
        assert_eq!(local_uids(&t.ctx, acc.id, "INBOX").await?, Vec::<u32>::new());
        Ok(())
    }

    #[tokio::test]
    async fn test_remap_uids() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;
        let kept = store_test_message(&t.ctx, acc.id, 600, "kept").await?;
        let gone = store_test_message(&t.ctx, acc.id, 601, "gone").await?;

        let account_id = acc.id;
        t.ctx
            .sql
            .transaction(move |tx| {
                insert_membership(tx, account_id, "INBOX", 1, kept, &UidFlags::default())?;
                insert_membership(tx, account_id, "INBOX", 2, gone, &UidFlags::default())?;
                Ok(())
            })
            .await?;

        let mut new_uids = BTreeMap::new();
        new_uids.insert(600u64, 41u32);
        let (remapped, removed) = remap_uids(&t.ctx, acc.id, "INBOX", &new_uids).await?;
        assert_eq!((remapped, removed), (1, 1));
        assert_eq!(local_uids(&t.ctx, acc.id, "INBOX").await?, vec![41]);
        Ok(())
    }

    #[tokio::test]
    async fn test_known_g_msgids() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;
        store_test_message(&t.ctx, acc.id, 700, "a").await?;
        store_test_message(&t.ctx, acc.id, 701, "b").await?;

        let candidates: HashSet<u64> = [700, 702].into_iter().collect();
        let known = known_g_msgids(&t.ctx, acc.id, &candidates).await?;
        assert_eq!(known, [700].into_iter().collect());
        Ok(())
    }
}
