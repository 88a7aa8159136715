//! Message table access.
//!
//! One `messages` row exists per distinct message body; folder memberships
//! live in `folder_uids` (see [`crate::folder_uid`]). Inserts happen inside
//! the per-chunk commit transaction, so the writers here operate on an open
//! [`rusqlite::Transaction`].

use anyhow::{Context as _, Result};
use chrono::{DateTime, TimeZone, Utc};

use crate::context::Context;
use crate::ingest::{Address, IngestedMessage};

/// A stored message.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: i64,
    pub account_id: i64,
    pub thread_id: Option<i64>,
    pub g_msgid: Option<u64>,
    pub g_thrid: Option<u64>,
    pub subject: Option<String>,
    pub from_addr: Vec<Address>,
    pub to_addr: Vec<Address>,
    pub received_date: DateTime<Utc>,
    pub size: usize,
    pub data_sha256: String,
    pub sanitized_body: String,
    pub snippet: String,
    pub decode_error: bool,
    pub is_draft: bool,
    pub is_sent: bool,
    pub local_id: Option<String>,
}

impl Message {
    /// Loads a message by id.
    pub async fn load(context: &Context, id: i64) -> Result<Option<Message>> {
        context
            .sql
            .query_row_optional(
                "SELECT id, account_id, thread_id, g_msgid, g_thrid, subject,
                        from_addr, to_addr, received_date, size, data_sha256,
                        sanitized_body, snippet, decode_error, is_draft, is_sent, local_id
                 FROM messages WHERE id=?",
                (id,),
                |row| {
                    let g_msgid: Option<i64> = row.get(3)?;
                    let g_thrid: Option<i64> = row.get(4)?;
                    let from_addr: Option<String> = row.get(6)?;
                    let to_addr: Option<String> = row.get(7)?;
                    let received: i64 = row.get(8)?;
                    let size: i64 = row.get(9)?;
                    Ok(Message {
                        id: row.get(0)?,
                        account_id: row.get(1)?,
                        thread_id: row.get(2)?,
                        g_msgid: g_msgid.map(|v| v as u64),
                        g_thrid: g_thrid.map(|v| v as u64),
                        subject: row.get(5)?,
                        from_addr: decode_addrs(from_addr),
                        to_addr: decode_addrs(to_addr),
                        received_date: Utc
                            .timestamp_opt(received, 0)
                            .single()
                            .unwrap_or_default(),
                        size: size as usize,
                        data_sha256: row.get(10)?,
                        sanitized_body: row.get(11)?,
                        snippet: row.get(12)?,
                        decode_error: row.get(13)?,
                        is_draft: row.get(14)?,
                        is_sent: row.get(15)?,
                        local_id: row.get(16)?,
                    })
                },
            )
            .await
    }

    /// Returns the id of the message with the given provider msgid, if stored.
    pub async fn id_by_g_msgid(
        context: &Context,
        account_id: i64,
        g_msgid: u64,
    ) -> Result<Option<i64>> {
        context
            .sql
            .query_get_value(
                "SELECT id FROM messages WHERE account_id=? AND g_msgid=?",
                (account_id, g_msgid as i64),
            )
            .await
    }
}

fn decode_addrs(raw: Option<String>) -> Vec<Address> {
    raw.and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn encode_addrs(addrs: &[Address]) -> Result<String> {
    serde_json::to_string(addrs).context("failed to encode addresses")
}

/// Inserts a fully parsed message within the chunk commit transaction and
/// returns its row id.
pub fn insert_ingested(
    tx: &rusqlite::Transaction<'_>,
    account_id: i64,
    thread_id: Option<i64>,
    msg: &IngestedMessage,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO messages (account_id, thread_id, g_msgid, g_thrid, subject,
                from_addr, sender_addr, reply_to, to_addr, cc_addr, bcc_addr,
                in_reply_to, message_id_header, local_id, received_date, size,
                data_sha256, sanitized_body, snippet, decode_error, is_draft, is_sent)
         VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        rusqlite::params![
            account_id,
            thread_id,
            msg.g_msgid.map(|v| v as i64),
            msg.g_thrid.map(|v| v as i64),
            msg.subject,
            encode_addrs(&msg.from_addr)?,
            encode_addrs(&msg.sender_addr)?,
            encode_addrs(&msg.reply_to)?,
            encode_addrs(&msg.to_addr)?,
            encode_addrs(&msg.cc_addr)?,
            encode_addrs(&msg.bcc_addr)?,
            msg.in_reply_to,
            msg.message_id_header,
            msg.local_id,
            msg.received_date.timestamp(),
            msg.size as i64,
            msg.data_sha256,
            msg.sanitized_body,
            msg.snippet,
            msg.decode_error,
            msg.is_draft,
            msg.is_sent,
        ],
    )?;
    let message_id = tx.last_insert_rowid();

    for block in &msg.blocks {
        tx.execute(
            "INSERT INTO blocks (message_id, walk_index, content_type, filename,
                    content_disposition, content_id, size, data_sha256)
             VALUES (?,?,?,?,?,?,?,?)",
            rusqlite::params![
                message_id,
                block.walk_index,
                block.content_type,
                block.filename,
                block.content_disposition,
                block.content_id,
                block.size as i64,
                block.data_sha256,
            ],
        )?;
    }
    Ok(message_id)
}

/// Like [`Message::id_by_g_msgid`], but within the chunk commit transaction.
pub fn find_by_g_msgid(
    tx: &rusqlite::Transaction<'_>,
    account_id: i64,
    g_msgid: u64,
) -> Result<Option<i64>> {
    match tx.query_row(
        "SELECT id FROM messages WHERE account_id=? AND g_msgid=?",
        (account_id, g_msgid as i64),
        |row| row.get(0),
    ) {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Looks up a locally composed message by its client-assigned id.
///
/// Used for send-then-reconcile: when the server copy of a message we
/// composed ourselves arrives over IMAP, it must attach to the stored row
/// instead of creating a duplicate.
pub fn find_by_local_id(
    tx: &rusqlite::Transaction<'_>,
    account_id: i64,
    local_id: &str,
) -> Result<Option<i64>> {
    match tx.query_row(
        "SELECT id FROM messages WHERE account_id=? AND local_id=?",
        (account_id, local_id),
        |row| row.get(0),
    ) {
        Ok(id) => Ok(Some(id)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Fills in provider ids and thread assignment on a reconciled local
/// message once the server copy is known.
pub fn update_reconciled(
    tx: &rusqlite::Transaction<'_>,
    message_id: i64,
    thread_id: Option<i64>,
    msg: &IngestedMessage,
) -> Result<()> {
    tx.execute(
        "UPDATE messages SET thread_id=?, g_msgid=?, g_thrid=?, data_sha256=?, size=?
         WHERE id=?",
        rusqlite::params![
            thread_id,
            msg.g_msgid.map(|v| v as i64),
            msg.g_thrid.map(|v| v as i64),
            msg.data_sha256,
            msg.size as i64,
            message_id,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ingest::{ingest, ProviderIds};
    use crate::test_utils::{build_mail, TestContext, TEST_DATE};

    #[tokio::test]
    async fn test_insert_and_load() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;

        let raw = build_mail("alice@example.com", "me@example.com", "Hi", "hello\n");
        let parsed = ingest(
            &raw,
            *TEST_DATE,
            ProviderIds {
                g_msgid: Some(101),
                g_thrid: Some(101),
            },
            &[],
        )?;
        let account_id = acc.id;
        let parsed2 = parsed.clone();
        let message_id = t
            .ctx
            .sql
            .transaction(move |tx| insert_ingested(tx, account_id, None, &parsed2))
            .await?;

        let msg = Message::load(&t.ctx, message_id).await?.unwrap();
        assert_eq!(msg.account_id, acc.id);
        assert_eq!(msg.g_msgid, Some(101));
        assert_eq!(msg.subject.as_deref(), Some("Hi"));
        assert_eq!(msg.from_addr[0].addr, "alice@example.com");
        assert_eq!(msg.received_date, *TEST_DATE);
        assert_eq!(msg.data_sha256, parsed.data_sha256);
        assert_eq!(msg.snippet, "hello");

        assert_eq!(
            Message::id_by_g_msgid(&t.ctx, acc.id, 101).await?,
            Some(message_id)
        );
        assert_eq!(Message::id_by_g_msgid(&t.ctx, acc.id, 102).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_find_by_local_id() -> Result<()> {
        let t = TestContext::new().await;
        let acc = t.create_account("me@example.com").await;

        let raw = concat!(
            "From: me@example.com\r\n",
            "To: b@example.com\r\n",
            "Subject: out\r\n",
            "X-Mailmirror-Id: local-7\r\n",
            "\r\n",
            "sent body\r\n",
        )
        .as_bytes();
        let parsed = ingest(raw, *TEST_DATE, ProviderIds::default(), &[])?;
        let account_id = acc.id;
        let parsed2 = parsed.clone();
        let message_id = t
            .ctx
            .sql
            .transaction(move |tx| insert_ingested(tx, account_id, None, &parsed2))
            .await?;

        let found = t
            .ctx
            .sql
            .transaction(move |tx| find_by_local_id(tx, account_id, "local-7"))
            .await?;
        assert_eq!(found, Some(message_id));

        let missing = t
            .ctx
            .sql
            .transaction(move |tx| find_by_local_id(tx, account_id, "local-8"))
            .await?;
        assert_eq!(missing, None);
        Ok(())
    }
}
