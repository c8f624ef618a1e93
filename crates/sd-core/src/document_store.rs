//! Wholesale handling of per-note document directories.
//!
//! A note's document is an opaque directory of CRDT state. This module never
//! interprets it: it copies, renames and deletes whole directories and
//! reports presence and size.

use crate::fs::{join, FileSystem, FsError};
use crate::layout;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// Size and recency of a document directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentStats {
    /// Total bytes across all files
    pub size: u64,
    /// Newest file mtime in ms since epoch (0 if the directory is empty)
    pub modified: u64,
    pub files: usize,
}

pub struct DocumentStore<F: FileSystem> {
    fs: F,
}

impl<F: FileSystem> DocumentStore<F> {
    pub fn new(fs: F) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.fs.exists(path).await?)
    }

    /// Recursively copy the directory at `from` into `to`, returning the number
    /// of files copied. Existing files under `to` are overwritten.
    pub async fn copy_dir(&self, from: &str, to: &str) -> Result<usize> {
        if !self.fs.exists(from).await? {
            return Err(DocumentError::NotFound(from.to_string()));
        }

        let mut copied = 0;
        let mut pending = vec![(from.to_string(), to.to_string())];
        self.fs.mkdir(to).await?;

        while let Some((src_dir, dst_dir)) = pending.pop() {
            for entry in self.fs.list(&src_dir).await? {
                let src = join(&src_dir, &entry.name);
                let dst = join(&dst_dir, &entry.name);
                if entry.is_dir {
                    self.fs.mkdir(&dst).await?;
                    pending.push((src, dst));
                } else {
                    let bytes = self.fs.read(&src).await?;
                    self.fs.write(&dst, &bytes).await?;
                    copied += 1;
                }
            }
        }

        debug!("Copied {} file(s) from {} to {}", copied, from, to);
        Ok(copied)
    }

    /// Delete a document directory. Deleting an absent path is not an error.
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.fs.remove_all(path).await?;
        Ok(())
    }

    /// Rename a whole document directory to a name that must be free.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        match self.fs.rename(from, to).await {
            Ok(()) => Ok(()),
            Err(FsError::NotFound(_)) => Err(DocumentError::NotFound(from.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the staging directory of `note_id` in `sd_path` to its final name.
    ///
    /// Tries an atomic rename first. If the platform refuses (e.g. the rename
    /// crosses devices), copies instead: the promotion marker is written
    /// before the copy and removed after the staging directory, so an
    /// interrupted copy is recognised and redone. The final name must be free
    /// unless the marker says it holds such a partial copy.
    pub async fn promote(&self, sd_path: &str, note_id: &str) -> Result<()> {
        if self.promotion_interrupted(sd_path, note_id).await? {
            debug!("Redoing interrupted copy of staging for {}", note_id);
            return self.promote_by_copy(sd_path, note_id).await;
        }

        let staging = layout::staging_dir(sd_path, note_id);
        let final_path = layout::note_dir(sd_path, note_id);
        match self.fs.rename(&staging, &final_path).await {
            Ok(()) => Ok(()),
            Err(FsError::NotFound(_)) => Err(DocumentError::NotFound(staging)),
            Err(e @ FsError::Io(_)) => {
                if self.fs.exists(&final_path).await? {
                    return Err(FsError::AlreadyExists(final_path).into());
                }
                debug!("Rename {} -> {} failed ({}), copying instead", staging, final_path, e);
                self.promote_by_copy(sd_path, note_id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True if a copying promotion of `note_id` was interrupted.
    pub async fn promotion_interrupted(&self, sd_path: &str, note_id: &str) -> Result<bool> {
        Ok(self.fs.exists(&layout::promotion_marker(sd_path, note_id)).await?)
    }

    /// Drop the partial copy left by an interrupted promotion, if any.
    pub async fn discard_partial_promotion(&self, sd_path: &str, note_id: &str) -> Result<()> {
        if self.promotion_interrupted(sd_path, note_id).await? {
            self.fs.remove_all(&layout::note_dir(sd_path, note_id)).await?;
            self.fs.remove_all(&layout::promotion_marker(sd_path, note_id)).await?;
        }
        Ok(())
    }

    async fn promote_by_copy(&self, sd_path: &str, note_id: &str) -> Result<()> {
        let marker = layout::promotion_marker(sd_path, note_id);
        let staging = layout::staging_dir(sd_path, note_id);
        let final_path = layout::note_dir(sd_path, note_id);

        self.fs.write(&marker, b"").await?;
        self.fs.remove_all(&final_path).await?;
        self.copy_dir(&staging, &final_path).await?;
        self.fs.remove_all(&staging).await?;
        self.fs.remove_all(&marker).await?;
        Ok(())
    }

    pub async fn stats(&self, path: &str) -> Result<DocumentStats> {
        if !self.fs.exists(path).await? {
            return Err(DocumentError::NotFound(path.to_string()));
        }

        let mut stats = DocumentStats::default();
        let mut pending = vec![path.to_string()];

        while let Some(dir) = pending.pop() {
            for entry in self.fs.list(&dir).await? {
                let child = join(&dir, &entry.name);
                if entry.is_dir {
                    pending.push(child);
                } else {
                    let stat = self.fs.stat(&child).await?;
                    stats.size += stat.size;
                    stats.modified = stats.modified.max(stat.mtime_millis);
                    stats.files += 1;
                }
            }
        }

        Ok(stats)
    }

    /// Ids of finished note documents in a storage directory.
    ///
    /// Staging directories and other dot-prefixed entries are excluded.
    pub async fn list_note_ids(&self, sd_path: &str) -> Result<Vec<String>> {
        let notes = layout::notes_dir(sd_path);
        if !self.fs.exists(&notes).await? {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = self
            .fs
            .list(&notes)
            .await?
            .into_iter()
            .filter(|e| e.is_dir && !layout::is_reserved_name(&e.name))
            .map(|e| e.name)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;

    async fn seed_document(fs: &InMemoryFs, dir: &str) {
        fs.write(&format!("{}/logs/0001.crdtlog", dir), b"update-1").await.unwrap();
        fs.write(&format!("{}/logs/0002.crdtlog", dir), b"update-22").await.unwrap();
        fs.write(&format!("{}/snapshot.bin", dir), b"snap").await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_dir_is_recursive_and_repeatable() {
        let store = DocumentStore::new(InMemoryFs::new());
        seed_document(store.fs(), "/a/notes/n1").await;

        assert_eq!(store.copy_dir("/a/notes/n1", "/b/notes/.moving-n1").await.unwrap(), 3);
        assert_eq!(store.copy_dir("/a/notes/n1", "/b/notes/.moving-n1").await.unwrap(), 3);

        let copied = store.fs().read("/b/notes/.moving-n1/logs/0002.crdtlog").await.unwrap();
        assert_eq!(copied, b"update-22");
    }

    #[tokio::test]
    async fn test_copy_missing_source_is_not_found() {
        let store = DocumentStore::new(InMemoryFs::new());
        assert!(matches!(
            store.copy_dir("/a/notes/missing", "/b/notes/x").await,
            Err(DocumentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_promote_and_stats() {
        let store = DocumentStore::new(InMemoryFs::new());
        seed_document(store.fs(), "/b/notes/.moving-n1").await;

        store.promote("/b", "n1").await.unwrap();

        assert!(!store.exists("/b/notes/.moving-n1").await.unwrap());
        let stats = store.stats("/b/notes/n1").await.unwrap();
        assert_eq!(stats.files, 3);
        assert_eq!(stats.size, (8 + 9 + 4) as u64);
    }

    #[tokio::test]
    async fn test_list_note_ids_skips_staging() {
        let store = DocumentStore::new(InMemoryFs::new());
        seed_document(store.fs(), "/b/notes/n2").await;
        seed_document(store.fs(), "/b/notes/n1").await;
        seed_document(store.fs(), "/b/notes/.moving-n3").await;

        let ids = store.list_note_ids("/b").await.unwrap();
        assert_eq!(ids, vec!["n1".to_string(), "n2".to_string()]);
        assert!(store.list_note_ids("/nowhere").await.unwrap().is_empty());
    }
}
