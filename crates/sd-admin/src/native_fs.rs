//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use sd_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Native filesystem for the admin tool.
///
/// Relative paths resolve against `base_path`; absolute paths (storage
/// directories live anywhere on disk) are used as given.
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn map_io(path: &Path, e: std::io::Error) -> FsError {
    let shown = path.display().to_string();
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(shown),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(shown),
        ErrorKind::DirectoryNotEmpty => FsError::NotEmpty(shown),
        _ => FsError::Io(format!("{}: {}", shown, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        fs::read(&full_path).await.map_err(|e| map_io(&full_path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(parent, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_io(&full_path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let full_path = self.full_path(path);
        let mut entries = Vec::new();

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| map_io(&full_path, e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| map_io(&full_path, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| map_io(&entry.path(), e))?;

            entries.push(FileEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(&full_path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .map_err(|e| map_io(&full_path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| map_io(&full_path, e))
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        fs::try_exists(&full_path)
            .await
            .map_err(|e| map_io(&full_path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_io(&full_path, e))?;

        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::create_dir_all(&full_path)
            .await
            .map_err(|e| map_io(&full_path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from);
        let to_path = self.full_path(to);

        // rename(2) silently replaces files and empty directories
        if fs::try_exists(&to_path).await.map_err(|e| map_io(&to_path, e))? {
            return Err(FsError::AlreadyExists(to_path.display().to_string()));
        }
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(parent, e))?;
        }

        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| map_io(&from_path, e))
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = match fs::symlink_metadata(&full_path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(map_io(&full_path, e)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(map_io(&full_path, e)),
        }
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_io(parent, e))?;
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full_path)
            .await
            .map_err(|e| map_io(&full_path, e))?;
        file.write_all(content)
            .await
            .map_err(|e| map_io(&full_path, e))?;
        file.sync_all().await.map_err(|e| map_io(&full_path, e))
    }
}
