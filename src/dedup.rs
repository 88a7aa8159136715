//! Cross-folder message deduplication.
//!
//! Gmail exposes one message in many folders (labels). The raw body is
//! downloaded only once per account; every further folder occurrence is
//! recorded as a membership pointing at the already stored message.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::Result;

use crate::context::Context;
use crate::folder_uid::{self, UidFlags};
use crate::imap::session::{FlagSet, GmailMetadata};
use crate::message::Message;

/// The download plan for a set of candidate UIDs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Classified {
    /// UIDs whose message body is not stored yet, descending so the newest
    /// mail lands first.
    pub full_download: Vec<u32>,
    /// UIDs whose body is already stored under another folder; only a
    /// membership needs to be created.
    pub link_only: Vec<u32>,
}

/// Splits candidate UIDs by whether their message body must be downloaded.
///
/// UIDs without provider metadata (non-Gmail accounts) always download.
pub async fn classify_for_download(
    context: &Context,
    account_id: i64,
    metadata: &BTreeMap<u32, GmailMetadata>,
    candidates: &BTreeSet<u32>,
) -> Result<Classified> {
    let candidate_msgids: HashSet<u64> = candidates
        .iter()
        .filter_map(|uid| metadata.get(uid).map(|m| m.g_msgid))
        .collect();
    let known = folder_uid::known_g_msgids(context, account_id, &candidate_msgids).await?;

    let mut res = Classified::default();
    for &uid in candidates.iter().rev() {
        match metadata.get(&uid) {
            Some(meta) if known.contains(&meta.g_msgid) => res.link_only.push(uid),
            _ => res.full_download.push(uid),
        }
    }
    res.link_only.sort_unstable();
    Ok(res)
}

/// Creates folder memberships for UIDs whose message is already stored.
///
/// UIDs already recorded in this folder, and UIDs whose message vanished
/// from the store since classification, are skipped. Returns the number of
/// memberships created.
pub async fn link_existing(
    context: &Context,
    account_id: i64,
    folder: &str,
    uids: &[u32],
    metadata: &BTreeMap<u32, GmailMetadata>,
    flags: &BTreeMap<u32, FlagSet>,
) -> Result<usize> {
    let local: BTreeSet<u32> = folder_uid::local_uids(context, account_id, folder)
        .await?
        .into_iter()
        .collect();

    let mut rows: Vec<(u32, i64, UidFlags)> = Vec::new();
    for &uid in uids {
        if local.contains(&uid) {
            continue;
        }
        let Some(meta) = metadata.get(&uid) else {
            continue;
        };
        let Some(message_id) = Message::id_by_g_msgid(context, account_id, meta.g_msgid).await?
        else {
            // Raced with a deletion; the poll cycle picks it up again.
            continue;
        };
        let uid_flags = flags
            .get(&uid)
            .map(UidFlags::from_imap)
            .unwrap_or_default();
        rows.push((uid, message_id, uid_flags));
    }

    if rows.is_empty() {
        return Ok(0);
    }
    let folder = folder.to_string();
    context
        .sql
        .transaction(move |tx| {
            let mut linked = 0;
            for (uid, message_id, uid_flags) in &rows {
                if folder_uid::insert_membership(
                    tx, account_id, &folder, *uid, *message_id, uid_flags,
                )? {
                    linked += 1;
                }
            }
            Ok(linked)
        })
        .await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::folder_uid::local_uids;
    use crate::test_utils::{store_test_message, TestContext};

    fn meta(entries: &[(u32, u64)]) -> BTreeMap<u32, GmailMetadata> {
        entries
            .iter()
            .map(|&(uid, g_msgid)| {
                (
                    uid,
                    GmailMetadata {
                        g_msgid,
                        g_thrid: g_msgid,
                    },
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_classify_for_download() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;
        store_test_message(&t.ctx, acc.id, 900, "already here").await?;

        let metadata = meta(&[(1, 900), (2, 901), (3, 902)]);
        let candidates: BTreeSet<u32> = [1, 2, 3].into_iter().collect();
        let classified = classify_for_download(&t.ctx, acc.id, &metadata, &candidates).await?;

        assert_eq!(classified.link_only, vec![1]);
        // Newest first.
        assert_eq!(classified.full_download, vec![3, 2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_classify_without_metadata_downloads() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;

        let metadata = BTreeMap::new();
        let candidates: BTreeSet<u32> = [4, 5].into_iter().collect();
        let classified = classify_for_download(&t.ctx, acc.id, &metadata, &candidates).await?;
        assert_eq!(classified.full_download, vec![5, 4]);
        assert!(classified.link_only.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_link_existing() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;
        let msg_id = store_test_message(&t.ctx, acc.id, 910, "shared body").await?;

        let metadata = meta(&[(21, 910), (22, 911)]);
        let mut flags = BTreeMap::new();
        flags.insert(
            21,
            FlagSet {
                flags: vec!["\\Seen".to_string()],
                labels: vec![],
            },
        );

        // uid 22 has no stored message and is skipped.
        let linked =
            link_existing(&t.ctx, acc.id, "work", &[21, 22], &metadata, &flags).await?;
        assert_eq!(linked, 1);
        assert_eq!(local_uids(&t.ctx, acc.id, "work").await?, vec![21]);

        // Linking again is a no-op.
        let linked =
            link_existing(&t.ctx, acc.id, "work", &[21], &metadata, &flags).await?;
        assert_eq!(linked, 0);

        let _ = msg_id;
        Ok(())
    }
}
