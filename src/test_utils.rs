//! Helpers shared by the unit tests.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use tempfile::TempDir;

use crate::account::{Account, Credentials, FolderNames, Provider};
use crate::context::Context;
use crate::ingest::{ingest, ProviderIds};
use crate::message;

/// A fixed receive date so assertions stay deterministic.
pub static TEST_DATE: Lazy<DateTime<Utc>> = Lazy::new(|| {
    Utc.timestamp_opt(1_601_000_000, 0)
        .single()
        .expect("valid timestamp")
});

/// A [`Context`] over a temporary directory.
pub struct TestContext {
    pub ctx: Context,
    /// Deleted together with the test context.
    pub dir: TempDir,
}

impl TestContext {
    pub async fn new() -> TestContext {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let ctx = Context::new(dir.path(), "testhost")
            .await
            .expect("failed to create context");
        TestContext { ctx, dir }
    }

    /// Creates a Gmail account with dummy credentials.
    pub async fn create_account(&self, email: &str) -> Account {
        Account::create(
            &self.ctx,
            email,
            Provider::Gmail,
            "imap.example.org",
            993,
            &Credentials::OAuth2 {
                user: email.to_string(),
                access_token: "test-token".to_string(),
            },
        )
        .await
        .expect("failed to create account")
    }
}

/// The folder mapping matching [`crate::imap::replay::ReplayFixture::with_gmail_folders`].
pub fn gmail_folder_names() -> FolderNames {
    FolderNames {
        inbox: Some("INBOX".to_string()),
        drafts: Some("[Gmail]/Drafts".to_string()),
        sent: Some("[Gmail]/Sent Mail".to_string()),
        spam: Some("[Gmail]/Spam".to_string()),
        trash: Some("[Gmail]/Trash".to_string()),
        archive: Some("[Gmail]/All Mail".to_string()),
        all: Some("[Gmail]/All Mail".to_string()),
        important: None,
        starred: None,
        labels: Vec::new(),
    }
}

/// Builds a minimal plain-text message.
pub fn build_mail(from: &str, to: &str, subject: &str, body: &str) -> Vec<u8> {
    let crlf_body = body.replace('\n', "\r\n");
    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         Message-ID: <{subject_id}@example.com>\r\n\
         Date: Thu, 24 Sep 2020 12:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {crlf_body}",
        subject_id = subject.replace(' ', "-"),
    )
    .into_bytes()
}

/// Ingests and stores a small message, returning its row id.
pub async fn store_test_message(
    ctx: &Context,
    account_id: i64,
    g_msgid: u64,
    body: &str,
) -> Result<i64> {
    let raw = build_mail(
        "alice@example.com",
        "me@example.com",
        &format!("msg {g_msgid}"),
        &format!("{body}\n"),
    );
    let parsed = ingest(
        &raw,
        *TEST_DATE,
        ProviderIds {
            g_msgid: Some(g_msgid),
            g_thrid: Some(g_msgid),
        },
        &[],
    )?;
    ctx.sql
        .transaction(move |tx| message::insert_ingested(tx, account_id, None, &parsed))
        .await
}
