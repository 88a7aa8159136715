//! # Blob directory management.
//!
//! Raw message bodies and decoded MIME parts are stored on disk addressed by
//! their SHA-256 hash. Saving is idempotent; two messages sharing a part
//! share one file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use sha2::{Digest, Sha256};

/// Content-addressed blob store rooted at one directory.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,

    #[cfg(test)]
    fail_hashes: std::sync::Mutex<std::collections::HashSet<String>>,
}

/// Returns the lowercase hex SHA-256 digest of `data`.
pub fn data_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

impl BlobStore {
    /// Opens (and creates if needed) the blob store at `root`.
    pub async fn new(root: PathBuf) -> Result<BlobStore> {
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create blobdir {}", root.display()))?;
        Ok(BlobStore {
            root,
            #[cfg(test)]
            fail_hashes: Default::default(),
        })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        // Two-level fanout keeps directory sizes manageable.
        self.root.join(&hash[..2]).join(hash)
    }

    /// Saves `data` under `hash`; `hash` must be the SHA-256 of `data`.
    ///
    /// Re-saving an already stored blob is a no-op.
    pub async fn save(&self, hash: &str, data: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self.fail_hashes.lock().unwrap().contains(hash) {
            bail!("injected blob store failure for {hash}");
        }

        if hash.len() < 3 || data_sha256(data) != hash {
            bail!("blob hash mismatch for {hash}");
        }
        let path = self.path_for(hash);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a temporary file first so a crash never leaves a
        // truncated blob under its final name.
        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write blob {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Loads the blob stored under `hash`, or `None` if it does not exist.
    pub async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        if hash.len() < 3 {
            bail!("invalid blob hash {hash:?}");
        }
        match tokio::fs::read(self.path_for(hash)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns whether a blob with the given hash is stored.
    pub async fn exists(&self, hash: &str) -> bool {
        if hash.len() < 3 {
            return false;
        }
        tokio::fs::try_exists(self.path_for(hash))
            .await
            .unwrap_or(false)
    }

    /// Removes the blob stored under `hash`. Missing blobs are fine.
    pub async fn delete(&self, hash: &str) -> Result<()> {
        if hash.len() < 3 {
            bail!("invalid blob hash {hash:?}");
        }
        match tokio::fs::remove_file(self.path_for(hash)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Makes the next save of `hash` fail, to exercise abort paths.
    #[cfg(test)]
    pub(crate) fn fail_on(&self, hash: &str) {
        self.fail_hashes.lock().unwrap().insert(hash.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_get() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BlobStore::new(dir.path().join("blobs")).await?;
        let data = b"hello blob";
        let hash = data_sha256(data);

        store.save(&hash, data).await?;
        // idempotent
        store.save(&hash, data).await?;

        assert!(store.exists(&hash).await);
        assert_eq!(store.get(&hash).await?, Some(data.to_vec()));
        assert_eq!(store.get(&data_sha256(b"other")).await?, None);

        store.delete(&hash).await?;
        assert!(!store.exists(&hash).await);
        // Deleting again is fine.
        store.delete(&hash).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_save_rejects_wrong_hash() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = BlobStore::new(dir.path().join("blobs")).await?;
        let hash = data_sha256(b"right");
        assert!(store.save(&hash, b"wrong").await.is_err());
        assert!(!store.exists(&hash).await);
        Ok(())
    }
}
