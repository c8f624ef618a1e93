//! Storage directory snapshots and their retention.
//!
//! ```text
//! <backups>/<backupId>/metadata.json   BackupMetadata, written last
//! <backups>/<backupId>/notes.json      index rows of the backed-up notes
//! <backups>/<backupId>/sd/notes/<id>/  copied document directories
//! ```
//!
//! A backup without `metadata.json` was interrupted and is not listed.

use crate::clock::{Clock, SystemClock};
use crate::document_store::{DocumentError, DocumentStore};
use crate::fs::{join, FileSystem, FsError};
use crate::index::{IndexError, NoteIndex};
use crate::layout;
use crate::model::{Note, SdId, SdRef, StorageDirectory};
use crate::ownership::{resolve_sd, write_sd_identity};
use crate::registry::{RegistryError, StorageDirectoryRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "metadata.json";
const NOTES_FILE: &str = "notes.json";
const DATA_DIR: &str = "sd";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Storage directory {sd} not accessible: {reason}")]
    SdNotAccessible { sd: String, reason: String },

    #[error("Restore target is not empty: {0}")]
    TargetNotEmpty(String),

    #[error("Storage directory {0} is already registered; restore it with a new identity")]
    IdentityInUse(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    /// Selected notes, taken automatically before a risky operation
    PreOperation,
    /// Whole SD, taken on request; never pruned automatically
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub sd_uuid: String,
    pub sd_name: String,
    pub sd_path: String,
    pub timestamp: u64,
    pub note_count: usize,
    pub total_size: u64,
    pub backup_type: BackupType,
    pub description: Option<String>,
}

/// Identity of a restored storage directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreIdentity {
    /// Reuse the backed-up uuid; it must not be registered any more
    Preserve,
    /// Mint a fresh uuid so the restore can live next to the original
    New,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub pre_operation_retention: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            pre_operation_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

pub struct BackupManager<F: FileSystem> {
    documents: DocumentStore<F>,
    index: Arc<dyn NoteIndex>,
    registry: Arc<dyn StorageDirectoryRegistry>,
    backups_dir: String,
    clock: Arc<dyn Clock>,
    config: BackupConfig,
    /// Last metadata successfully parsed per backup id
    cache: Mutex<HashMap<String, BackupMetadata>>,
}

impl<F: FileSystem> BackupManager<F> {
    pub fn new(
        fs: F,
        index: Arc<dyn NoteIndex>,
        registry: Arc<dyn StorageDirectoryRegistry>,
        backups_dir: impl Into<String>,
    ) -> Self {
        Self {
            documents: DocumentStore::new(fs),
            index,
            registry,
            backups_dir: backups_dir.into(),
            clock: Arc::new(SystemClock),
            config: BackupConfig::default(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: BackupConfig) -> Self {
        self.config = config;
        self
    }

    /// Snapshot selected notes ahead of an operation. Notes without a
    /// document are skipped.
    pub async fn create_pre_operation_snapshot(
        &self,
        sd_id: SdId,
        note_ids: &[String],
        description: Option<String>,
    ) -> Result<BackupMetadata> {
        let sd = self.accessible_sd(sd_id).await?;
        self.snapshot(&sd, note_ids, BackupType::PreOperation, description)
            .await
    }

    /// Snapshot every note of a storage directory.
    pub async fn create_manual_backup(
        &self,
        sd_id: SdId,
        description: Option<String>,
    ) -> Result<BackupMetadata> {
        let sd = self.accessible_sd(sd_id).await?;
        let mut note_ids = self.documents.list_note_ids(&sd.path).await?;
        for row in self.index.get_notes_by_sd(sd.id).await? {
            if !note_ids.contains(&row.id) {
                note_ids.push(row.id);
            }
        }
        self.snapshot(&sd, &note_ids, BackupType::Manual, description)
            .await
    }

    async fn snapshot(
        &self,
        sd: &StorageDirectory,
        note_ids: &[String],
        backup_type: BackupType,
        description: Option<String>,
    ) -> Result<BackupMetadata> {
        let timestamp = self.clock.now_ms();
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let backup_id = format!("{}-{}", timestamp, suffix);
        let dir = join(&self.backups_dir, &backup_id);
        let data_notes = layout::notes_dir(&join(&dir, DATA_DIR));
        let fs = self.documents.fs();
        fs.mkdir(&data_notes).await?;

        let mut rows = Vec::new();
        let mut note_count = 0;
        let mut total_size = 0;
        for note_id in note_ids {
            let src = layout::note_dir(&sd.path, note_id);
            if self.documents.exists(&src).await? {
                self.documents
                    .copy_dir(&src, &join(&data_notes, note_id))
                    .await?;
                total_size += self.documents.stats(&src).await?.size;
                note_count += 1;
            } else {
                debug!("Skipping note {} with no document in {}", note_id, sd.uuid);
            }
            if let Some(row) = self.index.get_note(sd.id, note_id).await? {
                rows.push(row);
            }
        }

        let metadata = BackupMetadata {
            backup_id: backup_id.clone(),
            sd_uuid: sd.uuid.clone(),
            sd_name: sd.name.clone(),
            sd_path: sd.path.clone(),
            timestamp,
            note_count,
            total_size,
            backup_type,
            description,
        };
        fs.write(&join(&dir, NOTES_FILE), &serde_json::to_vec_pretty(&rows)?)
            .await?;
        fs.write(&join(&dir, METADATA_FILE), &serde_json::to_vec_pretty(&metadata)?)
            .await?;
        self.remember(&metadata);

        info!(
            "Created {:?} backup {} of {} ({} notes, {} bytes)",
            backup_type, backup_id, sd.uuid, note_count, total_size
        );
        Ok(metadata)
    }

    /// Every complete backup, newest first.
    ///
    /// Unreadable metadata falls back to the last value parsed by this
    /// manager; backups with neither are skipped.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let fs = self.documents.fs();
        if !fs.exists(&self.backups_dir).await? {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in fs.list(&self.backups_dir).await? {
            if !entry.is_dir {
                continue;
            }
            if let Some(metadata) = self.read_metadata(&entry.name).await {
                backups.push(metadata);
            }
        }
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(backups)
    }

    /// Restore a backup into an empty directory and register it.
    pub async fn restore_from_backup(
        &self,
        backup_id: &str,
        target_path: &str,
        identity: RestoreIdentity,
    ) -> Result<StorageDirectory> {
        let metadata = self
            .read_metadata(backup_id)
            .await
            .ok_or_else(|| BackupError::NotFound(backup_id.to_string()))?;
        let fs = self.documents.fs();
        if fs.exists(target_path).await? && !fs.list(target_path).await?.is_empty() {
            return Err(BackupError::TargetNotEmpty(target_path.to_string()));
        }

        let dir = join(&self.backups_dir, backup_id);
        let rows: Vec<Note> = match fs.read(&join(&dir, NOTES_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(FsError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (uuid, name) = match identity {
            RestoreIdentity::Preserve => (metadata.sd_uuid.clone(), metadata.sd_name.clone()),
            RestoreIdentity::New => (
                uuid::Uuid::new_v4().to_string(),
                format!("{} (restored)", metadata.sd_name),
            ),
        };
        if self
            .registry
            .get_storage_dir(&SdRef::Uuid(uuid.clone()))
            .await?
            .is_some()
        {
            return Err(BackupError::IdentityInUse(uuid));
        }

        let target_existed = fs.exists(target_path).await?;
        let sd = match self.restore_into(&dir, target_path, &uuid, &name).await {
            Ok(sd) => sd,
            Err(e) => {
                warn!(
                    "Restore of backup {} into {} failed, removing partial restore: {}",
                    backup_id, target_path, e
                );
                self.discard_target(target_path, target_existed).await;
                return Err(e);
            }
        };

        let restored = rows.len();
        for mut row in rows {
            row.sd_id = sd.id;
            if let Err(e) = self.index.upsert_note(row).await {
                warn!("Restoring index rows for {} failed: {}", sd.uuid, e);
                self.unregister(&sd).await;
                self.discard_target(target_path, target_existed).await;
                return Err(e.into());
            }
        }

        info!(
            "Restored backup {} to {} as {} ({} index rows)",
            backup_id, target_path, sd.uuid, restored
        );
        Ok(sd)
    }

    /// Copy the backed-up tree into `target_path`, stamp it and register it.
    async fn restore_into(
        &self,
        dir: &str,
        target_path: &str,
        uuid: &str,
        name: &str,
    ) -> Result<StorageDirectory> {
        let fs = self.documents.fs();
        fs.mkdir(target_path).await?;
        let data = join(dir, DATA_DIR);
        if fs.exists(&data).await? {
            self.documents.copy_dir(&data, target_path).await?;
        }
        write_sd_identity(fs, target_path, uuid).await?;
        Ok(self
            .registry
            .create_storage_dir(uuid, name, target_path)
            .await?)
    }

    /// Return a failed restore target to its prior state: absent, or empty.
    async fn discard_target(&self, target_path: &str, existed: bool) {
        let fs = self.documents.fs();
        let result = match fs.remove_all(target_path).await {
            Ok(()) if existed => fs.mkdir(target_path).await,
            other => other,
        };
        if let Err(e) = result {
            warn!("Could not clean up restore target {}: {}", target_path, e);
        }
    }

    async fn unregister(&self, sd: &StorageDirectory) {
        if let Ok(rows) = self.index.get_notes_by_sd(sd.id).await {
            for row in rows {
                if let Err(e) = self.index.purge_note(sd.id, &row.id).await {
                    warn!("Could not remove restored row {}: {}", row.id, e);
                }
            }
        }
        if let Err(e) = self.registry.remove_storage_dir(sd.id).await {
            warn!("Could not unregister {}: {}", sd.uuid, e);
        }
    }

    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let dir = join(&self.backups_dir, backup_id);
        if !self.documents.exists(&dir).await? {
            return Err(BackupError::NotFound(backup_id.to_string()));
        }
        self.documents.remove(&dir).await?;
        self.forget(backup_id);
        info!("Deleted backup {}", backup_id);
        Ok(())
    }

    /// Delete pre-operation snapshots past their retention. Manual backups
    /// are never touched. Returns how many were deleted.
    pub async fn cleanup_old_snapshots(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let retention = self.config.pre_operation_retention.as_millis() as u64;

        let mut deleted = 0;
        for backup in self.list_backups().await? {
            if backup.backup_type != BackupType::PreOperation {
                continue;
            }
            if now.saturating_sub(backup.timestamp) > retention {
                self.delete_backup(&backup.backup_id).await?;
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!("Pruned {} pre-operation snapshot(s)", deleted);
        }
        Ok(deleted)
    }

    async fn read_metadata(&self, backup_id: &str) -> Option<BackupMetadata> {
        let path = join(&join(&self.backups_dir, backup_id), METADATA_FILE);
        let parsed = match self.documents.fs().read(&path).await {
            Ok(bytes) => serde_json::from_slice::<BackupMetadata>(&bytes).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match parsed {
            Ok(metadata) => {
                self.remember(&metadata);
                Some(metadata)
            }
            Err(reason) => {
                let cached = self.cached(backup_id);
                if cached.is_some() {
                    warn!("Backup {} metadata unreadable ({}), using cached copy", backup_id, reason);
                } else {
                    debug!("Ignoring backup {}: {}", backup_id, reason);
                }
                cached
            }
        }
    }

    fn remember(&self, metadata: &BackupMetadata) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(metadata.backup_id.clone(), metadata.clone());
        }
    }

    fn forget(&self, backup_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(backup_id);
        }
    }

    fn cached(&self, backup_id: &str) -> Option<BackupMetadata> {
        self.cache.lock().ok()?.get(backup_id).cloned()
    }

    async fn accessible_sd(&self, sd_id: SdId) -> Result<StorageDirectory> {
        let sd = self
            .registry
            .get_storage_dir(&SdRef::Id(sd_id))
            .await?
            .ok_or_else(|| BackupError::SdNotAccessible {
                sd: sd_id.to_string(),
                reason: "not registered".to_string(),
            })?;
        resolve_sd(self.registry.as_ref(), self.documents.fs(), &sd.uuid)
            .await
            .map_err(|e| BackupError::SdNotAccessible {
                sd: sd.uuid.clone(),
                reason: e.to_string(),
            })
    }
}
