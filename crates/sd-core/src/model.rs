//! Shared data model: storage directories, note rows and move records.

use crate::instance_id::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Local row id of a storage directory.
///
/// Only meaningful on this machine; may be reassigned when an SD is re-added.
/// Anything that crosses a process or machine boundary uses the SD uuid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SdId(pub i64);

impl Display for SdId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lookup key for a storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdRef {
    Id(SdId),
    Uuid(String),
}

impl Display for SdRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SdRef::Id(id) => write!(f, "#{}", id),
            SdRef::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

/// A registered storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDirectory {
    pub id: SdId,
    pub name: String,
    /// Local filesystem path (may differ per machine)
    pub path: String,
    /// Global identity, immutable once created
    pub uuid: String,
    /// Creation time in ms since epoch
    pub created: u64,
    pub is_active: bool,
}

/// Lifecycle of a note row: live → tombstoned → purged (row gone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteLifecycle {
    Live,
    Tombstoned,
}

/// One row of the note index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Stable across the note's whole lifetime, including moves
    pub id: String,
    pub title: String,
    pub sd_id: SdId,
    pub folder_id: Option<String>,
    pub created: u64,
    pub modified: u64,
    /// Tombstone flag
    pub deleted: bool,
    pub pinned: bool,
    #[serde(default)]
    pub content_preview: String,
    #[serde(default)]
    pub content_text: String,
}

impl Note {
    /// Minimal live row, mostly useful for tests and imports.
    pub fn new(id: impl Into<String>, title: impl Into<String>, sd_id: SdId, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            sd_id,
            folder_id: None,
            created: now_ms,
            modified: now_ms,
            deleted: false,
            pinned: false,
            content_preview: String::new(),
            content_text: String::new(),
        }
    }

    pub fn lifecycle(&self) -> NoteLifecycle {
        if self.deleted {
            NoteLifecycle::Tombstoned
        } else {
            NoteLifecycle::Live
        }
    }

    pub fn is_live(&self) -> bool {
        self.lifecycle() == NoteLifecycle::Live
    }

    /// Short human-readable preview for operator reports.
    pub fn preview(&self) -> String {
        if self.content_preview.is_empty() {
            self.title.clone()
        } else {
            format!("{}: {}", self.title, self.content_preview)
        }
    }
}

/// Phase of a note move. Linear and forward-only; `Cancelled` is reachable
/// only before `DbUpdated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveState {
    Initiated,
    Copying,
    FilesCopied,
    DbUpdated,
    Cleaning,
    Completed,
    Cancelled,
}

impl MoveState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MoveState::Completed | MoveState::Cancelled)
    }

    /// Once the index points at the target, the move must finish rather than unwind.
    pub fn can_cancel(self) -> bool {
        matches!(
            self,
            MoveState::Initiated | MoveState::Copying | MoveState::FilesCopied
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MoveState::Initiated => "initiated",
            MoveState::Copying => "copying",
            MoveState::FilesCopied => "files_copied",
            MoveState::DbUpdated => "db_updated",
            MoveState::Cleaning => "cleaning",
            MoveState::Completed => "completed",
            MoveState::Cancelled => "cancelled",
        }
    }
}

impl Display for MoveState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when the target SD already holds a live note with the same id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Reject the move
    #[default]
    Fail,
    /// Permanently remove the target's row and document, then move
    Replace,
    /// Give the moved note a fresh id and keep the target's note
    KeepBoth,
}

/// Durable record of one note migration between storage directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub id: String,
    pub note_id: String,
    pub source_sd_uuid: String,
    pub target_sd_uuid: String,
    pub target_folder_id: Option<String>,
    pub state: MoveState,
    /// Current owner of the record
    #[serde(rename = "initiated_by")]
    pub instance_id: InstanceId,
    pub initiated_at: u64,
    pub last_modified: u64,
    /// Path snapshots at initiation time (display only, never identity)
    pub source_sd_path: String,
    pub target_sd_path: String,
    pub error: Option<String>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Id the note will carry in the target SD (differs from `note_id` for keep-both)
    #[serde(default)]
    pub target_note_id: Option<String>,
}

impl MoveRecord {
    /// The id the note ends up with in the target SD.
    pub fn final_note_id(&self) -> &str {
        self.target_note_id.as_deref().unwrap_or(&self.note_id)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_modified)
    }
}
