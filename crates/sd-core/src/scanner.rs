//! ConsistencyScanner: finds divergence between the note index and the
//! document store, plus abandoned housekeeping markers.
//!
//! `scan` never mutates anything. Every repair is a separate call naming one
//! finding, since another device's in-flight state must never be removed
//! implicitly.

use crate::clock::{Clock, SystemClock};
use crate::document_store::{DocumentError, DocumentStore};
use crate::fs::{FileSystem, FsError};
use crate::index::{IndexError, MoveLog, NoteIndex};
use crate::instance_id::InstanceId;
use crate::layout;
use crate::model::{Note, SdId, SdRef, StorageDirectory};
use crate::ownership::resolve_sd;
use crate::registry::{RegistryError, StorageDirectoryRegistry};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Storage directory {sd} not accessible: {reason}")]
    SdNotAccessible { sd: String, reason: String },

    #[error("Note {note_id} not found in storage directory {sd_id}")]
    NoteNotFound { sd_id: SdId, note_id: String },

    #[error("Note {0} is not duplicated")]
    NotDuplicate(String),

    #[error("Note {note_id} is already indexed in storage directory {sd_id}")]
    AlreadyIndexed { sd_id: SdId, note_id: String },

    #[error("Document for note {note_id} is present in storage directory {sd_id}")]
    DocumentPresent { sd_id: SdId, note_id: String },

    #[error("Note {note_id} has an active move: {move_id}")]
    MoveInProgress { note_id: String, move_id: String },

    #[error("Migration lock {path} is only {age_ms}ms old")]
    LockNotStale { path: String, age_ms: u64 },

    #[error("Refusing to delete this instance's own activity log {0}")]
    OwnActivityLog(String),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Migration lock markers older than this are reported
    pub migration_lock_max_age: Duration,
    /// Activity logs whose newest entry is older than this are reported
    pub activity_log_max_age: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            migration_lock_max_age: Duration::from_secs(60 * 60),
            activity_log_max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// One SD's copy of a duplicated note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateCopy {
    pub sd_id: SdId,
    pub sd_uuid: String,
    pub sd_name: String,
    pub path: String,
    pub title: String,
    pub modified: u64,
    /// Document size, `None` when the SD is not accessible here
    pub size: Option<u64>,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateNote {
    pub note_id: String,
    pub copies: Vec<DuplicateCopy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedDocument {
    pub sd_id: SdId,
    pub sd_uuid: String,
    pub note_id: String,
    pub path: String,
    pub size: u64,
    pub modified: u64,
    pub files: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingDocument {
    pub sd_id: SdId,
    pub sd_uuid: String,
    pub note_id: String,
    pub expected_path: String,
    pub title: String,
    pub modified: u64,
    pub preview: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleMigrationLock {
    pub sd_id: SdId,
    pub sd_uuid: String,
    pub path: String,
    pub modified: u64,
    pub age_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedActivityLog {
    pub sd_id: SdId,
    pub sd_uuid: String,
    /// Instance id taken from the log's file name
    pub instance: String,
    pub path: String,
    pub size: u64,
    /// Newest recorded timestamp, or the file mtime when no entry parses
    pub last_activity: u64,
    pub age_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSd {
    pub sd_id: SdId,
    pub sd_uuid: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub duplicates: Vec<DuplicateNote>,
    pub orphaned_documents: Vec<OrphanedDocument>,
    pub missing_documents: Vec<MissingDocument>,
    pub stale_migration_locks: Vec<StaleMigrationLock>,
    pub orphaned_activity_logs: Vec<OrphanedActivityLog>,
    /// SDs that could not be inspected; never reported as missing documents
    pub skipped_sds: Vec<SkippedSd>,
}

impl ScanReport {
    pub fn finding_count(&self) -> usize {
        self.duplicates.len()
            + self.orphaned_documents.len()
            + self.missing_documents.len()
            + self.stale_migration_locks.len()
            + self.orphaned_activity_logs.len()
    }

    pub fn is_clean(&self) -> bool {
        self.finding_count() == 0
    }
}

pub struct ConsistencyScanner<F: FileSystem> {
    documents: DocumentStore<F>,
    index: Arc<dyn NoteIndex>,
    moves: Arc<dyn MoveLog>,
    registry: Arc<dyn StorageDirectoryRegistry>,
    instance_id: InstanceId,
    clock: Arc<dyn Clock>,
    config: ScanConfig,
}

impl<F: FileSystem> ConsistencyScanner<F> {
    pub fn new(
        fs: F,
        index: Arc<dyn NoteIndex>,
        moves: Arc<dyn MoveLog>,
        registry: Arc<dyn StorageDirectoryRegistry>,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            documents: DocumentStore::new(fs),
            index,
            moves,
            registry,
            instance_id,
            clock: Arc::new(SystemClock),
            config: ScanConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: ScanConfig) -> Self {
        self.config = config;
        self
    }

    /// Inspect every registered storage directory. Read-only.
    pub async fn scan(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let now = self.clock.now_ms();
        let in_flight = self.notes_in_flight().await?;

        let mut accessible = Vec::new();
        for sd in self.registry.list_storage_dirs().await? {
            match resolve_sd(self.registry.as_ref(), self.documents.fs(), &sd.uuid).await {
                Ok(sd) => accessible.push(sd),
                Err(e) => {
                    warn!("Skipping storage directory {} ({}): {}", sd.name, sd.uuid, e);
                    report.skipped_sds.push(SkippedSd {
                        sd_id: sd.id,
                        sd_uuid: sd.uuid,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.duplicates = self.find_duplicates(&accessible, &in_flight).await?;

        for sd in &accessible {
            self.scan_documents(sd, &in_flight, &mut report).await?;
            self.scan_migration_lock(sd, now, &mut report).await?;
            self.scan_activity_logs(sd, now, &mut report).await?;
        }

        info!(
            "Consistency scan: {} finding(s) across {} storage director(ies), {} skipped",
            report.finding_count(),
            accessible.len(),
            report.skipped_sds.len()
        );
        Ok(report)
    }

    /// Note ids involved in a non-terminal move, under either id.
    async fn notes_in_flight(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for record in self.moves.list_active_moves().await? {
            if let Some(target_id) = &record.target_note_id {
                ids.insert(target_id.clone());
            }
            ids.insert(record.note_id);
        }
        Ok(ids)
    }

    async fn find_duplicates(
        &self,
        accessible: &[StorageDirectory],
        in_flight: &HashSet<String>,
    ) -> Result<Vec<DuplicateNote>> {
        let mut by_id: BTreeMap<String, Vec<Note>> = BTreeMap::new();
        for note in self.index.list_notes().await? {
            if note.is_live() && !in_flight.contains(&note.id) {
                by_id.entry(note.id.clone()).or_default().push(note);
            }
        }

        let mut duplicates = Vec::new();
        for (note_id, rows) in by_id.into_iter().filter(|(_, rows)| rows.len() > 1) {
            let mut copies = Vec::with_capacity(rows.len());
            for row in rows {
                let sd = self.registry.get_storage_dir(&SdRef::Id(row.sd_id)).await?;
                let (sd_uuid, sd_name, path) = match &sd {
                    Some(sd) => (
                        sd.uuid.clone(),
                        sd.name.clone(),
                        layout::note_dir(&sd.path, &row.id),
                    ),
                    None => (String::new(), String::new(), String::new()),
                };
                let size = match sd.filter(|sd| accessible.iter().any(|a| a.id == sd.id)) {
                    Some(_) => self.document_size(&path).await?,
                    None => None,
                };
                copies.push(DuplicateCopy {
                    sd_id: row.sd_id,
                    sd_uuid,
                    sd_name,
                    path,
                    preview: row.preview(),
                    title: row.title,
                    modified: row.modified,
                    size,
                });
            }
            warn!("Note {} is live in {} storage directories", note_id, copies.len());
            duplicates.push(DuplicateNote { note_id, copies });
        }
        Ok(duplicates)
    }

    async fn document_size(&self, path: &str) -> Result<Option<u64>> {
        match self.documents.stats(path).await {
            Ok(stats) => Ok(Some(stats.size)),
            Err(DocumentError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan_documents(
        &self,
        sd: &StorageDirectory,
        in_flight: &HashSet<String>,
        report: &mut ScanReport,
    ) -> Result<()> {
        let rows = self.index.get_notes_by_sd(sd.id).await?;
        let indexed: HashSet<&str> = rows.iter().map(|n| n.id.as_str()).collect();
        let documents = self.documents.list_note_ids(&sd.path).await?;
        let present: HashSet<&str> = documents.iter().map(String::as_str).collect();

        for note_id in &documents {
            if indexed.contains(note_id.as_str()) || in_flight.contains(note_id) {
                continue;
            }
            let path = layout::note_dir(&sd.path, note_id);
            let stats = match self.documents.stats(&path).await {
                Ok(stats) => stats,
                // Removed since it was listed, so no longer an orphan
                Err(DocumentError::NotFound(_)) | Err(DocumentError::Fs(FsError::NotFound(_))) => {
                    debug!("Document {} in {} vanished during the scan", note_id, sd.uuid);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            debug!("Orphaned document {} in {}", note_id, sd.uuid);
            report.orphaned_documents.push(OrphanedDocument {
                sd_id: sd.id,
                sd_uuid: sd.uuid.clone(),
                note_id: note_id.clone(),
                path,
                size: stats.size,
                modified: stats.modified,
                files: stats.files,
            });
        }

        for row in rows.iter().filter(|n| n.is_live()) {
            if present.contains(row.id.as_str()) || in_flight.contains(&row.id) {
                continue;
            }
            debug!("Missing document for note {} in {}", row.id, sd.uuid);
            report.missing_documents.push(MissingDocument {
                sd_id: sd.id,
                sd_uuid: sd.uuid.clone(),
                note_id: row.id.clone(),
                expected_path: layout::note_dir(&sd.path, &row.id),
                title: row.title.clone(),
                modified: row.modified,
                preview: row.preview(),
            });
        }
        Ok(())
    }

    async fn scan_migration_lock(
        &self,
        sd: &StorageDirectory,
        now: u64,
        report: &mut ScanReport,
    ) -> Result<()> {
        let path = layout::migration_lock(&sd.path);
        let fs = self.documents.fs();
        if !fs.exists(&path).await? {
            return Ok(());
        }
        let modified = fs.stat(&path).await?.mtime_millis;
        let age_ms = now.saturating_sub(modified);
        if age_ms > self.config.migration_lock_max_age.as_millis() as u64 {
            report.stale_migration_locks.push(StaleMigrationLock {
                sd_id: sd.id,
                sd_uuid: sd.uuid.clone(),
                path,
                modified,
                age_ms,
            });
        }
        Ok(())
    }

    async fn scan_activity_logs(
        &self,
        sd: &StorageDirectory,
        now: u64,
        report: &mut ScanReport,
    ) -> Result<()> {
        let dir = layout::activity_dir(&sd.path);
        let fs = self.documents.fs();
        if !fs.exists(&dir).await? {
            return Ok(());
        }

        let own = self.instance_id.to_string();
        let max_age = self.config.activity_log_max_age.as_millis() as u64;
        for entry in fs.list(&dir).await? {
            let Some(instance) = entry.name.strip_suffix(layout::ACTIVITY_LOG_EXT) else {
                continue;
            };
            if entry.is_dir || instance == own {
                continue;
            }

            let path = layout::activity_log(&sd.path, instance);
            let stat = fs.stat(&path).await?;
            let content = fs.read(&path).await?;
            let last_activity =
                latest_activity(&String::from_utf8_lossy(&content)).unwrap_or(stat.mtime_millis);
            let age_ms = now.saturating_sub(last_activity);
            if age_ms > max_age {
                report.orphaned_activity_logs.push(OrphanedActivityLog {
                    sd_id: sd.id,
                    sd_uuid: sd.uuid.clone(),
                    instance: instance.to_string(),
                    path,
                    size: stat.size,
                    last_activity,
                    age_ms,
                });
            }
        }
        Ok(())
    }

    // ========== Repairs ==========

    /// Keep the copy in `keep_sd` and permanently remove every other live copy,
    /// row and document.
    pub async fn resolve_duplicate(&self, note_id: &str, keep_sd: SdId) -> Result<Vec<SdId>> {
        self.ensure_not_moving(note_id).await?;

        let live: Vec<Note> = self
            .index
            .find_note(note_id)
            .await?
            .into_iter()
            .filter(Note::is_live)
            .collect();
        if !live.iter().any(|n| n.sd_id == keep_sd) {
            return Err(ScanError::NoteNotFound {
                sd_id: keep_sd,
                note_id: note_id.to_string(),
            });
        }
        if live.len() < 2 {
            return Err(ScanError::NotDuplicate(note_id.to_string()));
        }

        // Resolve every loser first so nothing is removed when one is unreachable
        let mut losers = Vec::new();
        for row in live.iter().filter(|n| n.sd_id != keep_sd) {
            losers.push(self.accessible_sd(row.sd_id).await?);
        }

        let mut removed = Vec::with_capacity(losers.len());
        for sd in losers {
            self.documents
                .remove(&layout::note_dir(&sd.path, note_id))
                .await?;
            self.index.purge_note(sd.id, note_id).await?;
            info!("Removed duplicate of note {} from {}", note_id, sd.uuid);
            removed.push(sd.id);
        }
        Ok(removed)
    }

    /// Materialize an index row for an orphaned document.
    pub async fn import_orphan(&self, sd_id: SdId, note_id: &str) -> Result<Note> {
        let sd = self.accessible_sd(sd_id).await?;
        self.ensure_not_moving(note_id).await?;
        if self.index.get_note(sd.id, note_id).await?.is_some() {
            return Err(ScanError::AlreadyIndexed {
                sd_id,
                note_id: note_id.to_string(),
            });
        }

        let stats = self
            .documents
            .stats(&layout::note_dir(&sd.path, note_id))
            .await?;
        let timestamp = if stats.modified > 0 {
            stats.modified
        } else {
            self.clock.now_ms()
        };
        let short: String = note_id.chars().take(8).collect();
        let note = Note::new(note_id, format!("Recovered note {}", short), sd.id, timestamp);
        self.index.upsert_note(note.clone()).await?;

        info!("Imported orphaned note {} into {}", note_id, sd.uuid);
        Ok(note)
    }

    /// Permanently delete a document directory that has no index row.
    pub async fn delete_orphan(&self, sd_id: SdId, note_id: &str) -> Result<()> {
        let sd = self.accessible_sd(sd_id).await?;
        self.ensure_not_moving(note_id).await?;
        if self.index.get_note(sd.id, note_id).await?.is_some() {
            return Err(ScanError::AlreadyIndexed {
                sd_id,
                note_id: note_id.to_string(),
            });
        }

        self.documents
            .remove(&layout::note_dir(&sd.path, note_id))
            .await?;
        info!("Deleted orphaned document {} from {}", note_id, sd.uuid);
        Ok(())
    }

    /// Purge an index row whose document is gone.
    pub async fn delete_missing_row(&self, sd_id: SdId, note_id: &str) -> Result<()> {
        let sd = self.accessible_sd(sd_id).await?;
        self.ensure_not_moving(note_id).await?;
        if self.index.get_note(sd.id, note_id).await?.is_none() {
            return Err(ScanError::NoteNotFound {
                sd_id,
                note_id: note_id.to_string(),
            });
        }
        if self
            .documents
            .exists(&layout::note_dir(&sd.path, note_id))
            .await?
        {
            return Err(ScanError::DocumentPresent {
                sd_id,
                note_id: note_id.to_string(),
            });
        }

        self.index.purge_note(sd.id, note_id).await?;
        info!("Purged index row for missing note {} in {}", note_id, sd.uuid);
        Ok(())
    }

    /// Delete a migration lock that is still past the age limit.
    pub async fn delete_stale_lock(&self, sd_id: SdId) -> Result<()> {
        let sd = self.accessible_sd(sd_id).await?;
        let path = layout::migration_lock(&sd.path);
        let fs = self.documents.fs();
        if !fs.exists(&path).await? {
            return Ok(());
        }

        let modified = fs.stat(&path).await?.mtime_millis;
        let age_ms = self.clock.now_ms().saturating_sub(modified);
        if age_ms <= self.config.migration_lock_max_age.as_millis() as u64 {
            return Err(ScanError::LockNotStale { path, age_ms });
        }

        fs.remove_all(&path).await?;
        info!("Deleted stale migration lock in {}", sd.uuid);
        Ok(())
    }

    /// Delete another instance's activity log.
    pub async fn delete_activity_log(&self, sd_id: SdId, instance: &str) -> Result<()> {
        if instance == self.instance_id.to_string() {
            return Err(ScanError::OwnActivityLog(instance.to_string()));
        }
        let sd = self.accessible_sd(sd_id).await?;
        self.documents
            .fs()
            .remove_all(&layout::activity_log(&sd.path, instance))
            .await?;
        info!("Deleted activity log of instance {} in {}", instance, sd.uuid);
        Ok(())
    }

    async fn accessible_sd(&self, sd_id: SdId) -> Result<StorageDirectory> {
        let sd = self
            .registry
            .get_storage_dir(&SdRef::Id(sd_id))
            .await?
            .ok_or_else(|| ScanError::SdNotAccessible {
                sd: sd_id.to_string(),
                reason: "not registered".to_string(),
            })?;
        resolve_sd(self.registry.as_ref(), self.documents.fs(), &sd.uuid)
            .await
            .map_err(|e| ScanError::SdNotAccessible {
                sd: sd.uuid.clone(),
                reason: e.to_string(),
            })
    }

    async fn ensure_not_moving(&self, note_id: &str) -> Result<()> {
        let moving = self
            .moves
            .list_active_moves()
            .await?
            .into_iter()
            .find(|m| m.note_id == note_id || m.target_note_id.as_deref() == Some(note_id));
        match moving {
            Some(record) => Err(ScanError::MoveInProgress {
                note_id: note_id.to_string(),
                move_id: record.id,
            }),
            None => Ok(()),
        }
    }
}

/// Newest timestamp in an activity log (`<timestamp_ms>|<noteId>|<sequence>`
/// per line). `None` when no line parses.
pub fn latest_activity(content: &str) -> Option<u64> {
    content
        .lines()
        .filter_map(|line| line.split('|').next()?.trim().parse::<u64>().ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_activity() {
        let log = "1700000000000|n1|1\ngarbage\n1700000005000|n2|7\n1699999999999|n1|2\n";
        assert_eq!(latest_activity(log), Some(1_700_000_005_000));
        assert_eq!(latest_activity("not|a|timestamp\n"), None);
        assert_eq!(latest_activity(""), None);
    }

    #[test]
    fn test_empty_report_is_clean() {
        let report = ScanReport::default();
        assert!(report.is_clean());
        assert_eq!(report.finding_count(), 0);
    }
}
