//! Context module.
//!
//! The [`Context`] owns the database, the blob store, the metadata cache and
//! the event channel. It is cheap to clone and shared by every sync task of
//! the process.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context as _, Result};

use crate::blob::BlobStore;
use crate::cache::Cache;
use crate::events::{Event, EventEmitter, Events};
use crate::sql::Sql;

/// The context for a mailmirror process.
#[derive(Debug, Clone)]
pub struct Context {
    pub(crate) inner: Arc<InnerContext>,
}

impl Deref for Context {
    type Target = InnerContext;

    fn deref(&self) -> &InnerContext {
        &self.inner
    }
}

/// The actual context, expensive to create.
#[derive(Debug)]
pub struct InnerContext {
    /// Database handle.
    pub sql: Sql,

    /// Content-addressed store for raw message and part payloads.
    pub blobs: BlobStore,

    /// Disk cache for per-folder remote UID metadata snapshots.
    pub cache: Cache,

    /// Event channel.
    pub events: Events,

    dir: PathBuf,
    sync_host: String,
}

impl Context {
    /// Creates a new context rooted at `dir` and opens the database.
    ///
    /// `sync_host` identifies this process for account sync leases; two
    /// processes sharing a database must use distinct values.
    pub async fn new(dir: &Path, sync_host: &str) -> Result<Context> {
        ensure!(!sync_host.is_empty(), "sync_host must not be empty");

        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create context dir {}", dir.display()))?;
        let blobs = BlobStore::new(dir.join("blobs")).await?;
        let cache = Cache::new(dir.join("cache")).await?;
        tokio::fs::create_dir_all(dir.join("errors")).await?;

        let inner = InnerContext {
            sql: Sql::new(dir.join("mailmirror.db")),
            blobs,
            cache,
            events: Events::new(),
            dir: dir.to_path_buf(),
            sync_host: sync_host.to_string(),
        };
        let context = Context {
            inner: Arc::new(inner),
        };
        context.sql.open(&context).await?;
        Ok(context)
    }

    /// Emits a single event.
    pub fn emit_event(&self, event: Event) {
        self.events.emit(event);
    }

    /// Returns the event emitter.
    pub fn get_event_emitter(&self) -> EventEmitter {
        self.events.get_emitter()
    }

    /// Identifier of this process for account sync leases.
    pub fn sync_host(&self) -> &str {
        &self.sync_host
    }

    /// Root directory of this context.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Notifies downstream consumers that committed data for `account_id` changed.
    pub fn schedule_index_update(&self, account_id: i64) {
        self.emit_event(Event::IndexUpdateRequested { account_id });
    }

    /// Writes a raw message that failed to ingest to the error sink on disk
    /// so it can be inspected and replayed later.
    pub async fn save_ingest_error(
        &self,
        account_id: i64,
        folder: &str,
        uid: u32,
        raw: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.dir.join("errors").join(format!("{account_id}"));
        tokio::fs::create_dir_all(&dir).await?;
        let safe_folder: String = folder
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = dir.join(format!("{safe_folder}-{uid}.eml"));
        tokio::fs::write(&path, raw)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestContext;

    #[tokio::test]
    async fn test_save_ingest_error() -> Result<()> {
        let t = TestContext::new().await;
        let path = t
            .ctx
            .save_ingest_error(1, "[Gmail]/All Mail", 23, b"broken mail")
            .await?;
        assert!(path.ends_with("_Gmail__All_Mail-23.eml"));
        assert_eq!(tokio::fs::read(&path).await?, b"broken mail".to_vec());
        Ok(())
    }
}
