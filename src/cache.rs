//! # Sync metadata disk cache.
//!
//! During an initial folder sync the remote UID metadata snapshot can be
//! large; it is cached on disk between runs so an interrupted sync does not
//! refetch it. Entries are JSON files keyed by account, folder and purpose.
//! The cache is strictly an optimization, a missing entry is never an error.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Disk cache rooted at one directory.
#[derive(Debug)]
pub struct Cache {
    root: PathBuf,
}

impl Cache {
    /// Opens (and creates if needed) the cache at `root`.
    pub async fn new(root: PathBuf) -> Result<Cache> {
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cachedir {}", root.display()))?;
        Ok(Cache { root })
    }

    fn path_for(&self, account_id: i64, folder: &str, purpose: &str) -> PathBuf {
        let safe_folder: String = folder
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.root
            .join(format!("{account_id}"))
            .join(format!("{safe_folder}-{purpose}.json"))
    }

    /// Reads a cached value, `None` if missing or unreadable.
    pub async fn get<T: DeserializeOwned>(
        &self,
        account_id: i64,
        folder: &str,
        purpose: &str,
    ) -> Option<T> {
        let path = self.path_for(account_id, folder, purpose);
        let data = tokio::fs::read(&path).await.ok()?;
        // A corrupt cache entry is treated as absent.
        serde_json::from_slice(&data).ok()
    }

    /// Writes a cached value.
    pub async fn set<T: Serialize>(
        &self,
        account_id: i64,
        folder: &str,
        purpose: &str,
        value: &T,
    ) -> Result<()> {
        let path = self.path_for(account_id, folder, purpose);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec(value)?;
        let tmp = path.with_extension("json.part");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Removes a cached value. Missing entries are fine.
    pub async fn remove(&self, account_id: i64, folder: &str, purpose: &str) -> Result<()> {
        let path = self.path_for(account_id, folder, purpose);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
