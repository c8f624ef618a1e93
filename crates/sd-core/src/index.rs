//! Narrow interfaces onto the note index.
//!
//! `NoteIndex` covers note rows, `MoveLog` covers durable move records. Both
//! live in the same relational store in practice, but components depend only
//! on the half they call. `JsonIndex` provides a file-backed implementation.

use crate::fs::FsError;
use crate::model::{MoveRecord, Note, SdId};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Note {note_id} not found in storage directory {sd_id}")]
    NoteNotFound { sd_id: SdId, note_id: String },

    #[error("Move record not found: {0}")]
    MoveNotFound(String),

    #[error("Note {note_id} already has an active move: {move_id}")]
    MoveInProgress { note_id: String, move_id: String },

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Corrupt index: {0}")]
    Corrupt(String),

    #[error("Index is locked by another writer: {0}")]
    Locked(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Note rows, keyed by `(sd_id, note_id)`.
///
/// The same note id may appear in several SDs; outside of an in-flight move
/// that is a duplicate, which `ConsistencyScanner` reports.
#[async_trait]
pub trait NoteIndex: Send + Sync {
    /// Row for `note_id` in one storage directory, live or tombstoned.
    async fn get_note(&self, sd_id: SdId, note_id: &str) -> Result<Option<Note>>;

    /// Every row carrying `note_id`, across all storage directories.
    async fn find_note(&self, note_id: &str) -> Result<Vec<Note>>;

    /// Insert or replace the row at `(note.sd_id, note.id)`.
    async fn upsert_note(&self, note: Note) -> Result<()>;

    /// Soft delete: live → tombstoned.
    async fn tombstone_note(&self, sd_id: SdId, note_id: &str) -> Result<()>;

    /// Permanent delete. Purging an absent row is not an error.
    async fn purge_note(&self, sd_id: SdId, note_id: &str) -> Result<()>;

    async fn get_notes_by_sd(&self, sd_id: SdId) -> Result<Vec<Note>>;

    async fn list_notes(&self) -> Result<Vec<Note>>;
}

/// Durable move records.
#[async_trait]
pub trait MoveLog: Send + Sync {
    /// Persist a new record.
    ///
    /// Fails with `MoveInProgress` if a non-terminal record already exists for
    /// the same note. The check and the insert are atomic.
    async fn insert_move(&self, record: MoveRecord) -> Result<()>;

    async fn get_move(&self, id: &str) -> Result<Option<MoveRecord>>;

    /// Overwrite an existing record. Fails with `MoveNotFound` if it is gone.
    async fn update_move(&self, record: &MoveRecord) -> Result<()>;

    /// All records not yet `completed` or `cancelled`.
    async fn list_active_moves(&self) -> Result<Vec<MoveRecord>>;

    async fn active_move_for_note(&self, note_id: &str) -> Result<Option<MoveRecord>>;

    /// Delete terminal records whose `last_modified` is before `older_than_ms`.
    /// Returns how many were removed.
    async fn purge_terminal_moves(&self, older_than_ms: u64) -> Result<usize>;
}
