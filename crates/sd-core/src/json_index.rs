//! File-backed note index.
//!
//! Stores storage directories, note rows and move records in one JSON file.
//! Every mutation takes `<index>.lock`, re-reads the file, applies the change
//! and writes it back via a temp file, so a crash leaves either the old or the
//! new contents and processes sharing the file never lose each other's writes.

use crate::clock::{Clock, SystemClock};
use crate::fs::{FileSystem, FsError};
use crate::index::{IndexError, MoveLog, NoteIndex, Result};
use crate::model::{MoveRecord, Note, SdId, SdRef, StorageDirectory};
use crate::registry::{self, RegistryError, StorageDirectoryRegistry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A lock file this old was left by a crashed writer and may be broken.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Contents of the lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    token: String,
}

/// Everything the index persists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSnapshot {
    #[serde(default)]
    pub next_sd_id: i64,
    #[serde(default)]
    pub storage_dirs: Vec<StorageDirectory>,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub moves: Vec<MoveRecord>,
}

impl IndexSnapshot {
    fn note_position(&self, sd_id: SdId, note_id: &str) -> Option<usize> {
        self.notes
            .iter()
            .position(|n| n.sd_id == sd_id && n.id == note_id)
    }

    fn upsert_note(&mut self, note: Note) {
        match self.note_position(note.sd_id, &note.id) {
            Some(pos) => self.notes[pos] = note,
            None => self.notes.push(note),
        }
    }

    fn active_move_for_note(&self, note_id: &str) -> Option<&MoveRecord> {
        self.moves
            .iter()
            .find(|m| m.note_id == note_id && !m.state.is_terminal())
    }

    fn find_sd(&self, sd: &SdRef) -> Option<&StorageDirectory> {
        self.storage_dirs.iter().find(|d| match sd {
            SdRef::Id(id) => d.id == *id,
            SdRef::Uuid(uuid) => d.uuid == *uuid,
        })
    }
}

/// JSON-file implementation of `NoteIndex`, `MoveLog` and `StorageDirectoryRegistry`.
pub struct JsonIndex<F: FileSystem> {
    fs: F,
    path: String,
    clock: Arc<dyn Clock>,
    /// Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl<F: FileSystem> JsonIndex<F> {
    /// Open the index at `path`, creating an empty one if none exists.
    pub async fn open(fs: F, path: impl Into<String>) -> Result<Self> {
        let index = Self {
            fs,
            path: path.into(),
            clock: Arc::new(SystemClock),
            write_lock: Mutex::new(()),
        };

        // Surface corruption at open time rather than on first use
        index.load().await?;
        if !index.fs.exists(&index.path).await? {
            index.mutate(|_| Ok::<(), IndexError>(())).await?;
        }

        Ok(index)
    }

    /// Use `clock` for registry timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Holds a complete snapshot only, while it is swapped in.
    fn temp_path(&self) -> String {
        format!("{}.tmp", self.path)
    }

    fn lock_path(&self) -> String {
        format!("{}.lock", self.path)
    }

    /// Read the current snapshot from disk.
    pub async fn load(&self) -> Result<IndexSnapshot> {
        // A writer may swap the files between the existence check and the read
        for _ in 0..3 {
            match self.load_once().await {
                Err(IndexError::Fs(FsError::NotFound(_))) => continue,
                other => return other,
            }
        }
        self.load_once().await
    }

    async fn load_once(&self) -> Result<IndexSnapshot> {
        // A crash between removing the old file and renaming the temp file
        // leaves only the temp file, which is complete at that point.
        let path = if self.fs.exists(&self.path).await? {
            self.path.clone()
        } else if self.fs.exists(&self.temp_path()).await? {
            tracing::warn!("Recovering index from {}", self.temp_path());
            self.temp_path()
        } else {
            return Ok(IndexSnapshot::default());
        };

        let bytes = self.fs.read(&path).await?;
        serde_json::from_slice(&bytes).map_err(|e| IndexError::Corrupt(format!("{}: {}", path, e)))
    }

    /// Write `snapshot` under the per-writer name `token`, then swap it in.
    async fn save(&self, snapshot: &IndexSnapshot, token: &str) -> Result<()> {
        let contents = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| IndexError::Corrupt(e.to_string()))?;
        let scratch = format!("{}.{}.tmp", self.path, token);
        let tmp = self.temp_path();

        // Finish a swap a crashed writer left halfway
        if !self.fs.exists(&self.path).await? && self.fs.exists(&tmp).await? {
            self.fs.rename(&tmp, &self.path).await?;
        }

        self.fs.write(&scratch, &contents).await?;
        self.fs.remove_all(&tmp).await?;
        self.fs.rename(&scratch, &tmp).await?;
        self.fs.remove_all(&self.path).await?;
        self.fs.rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Take the index lock file, waiting for other writers. Returns the token
    /// that identifies this holder.
    async fn lock_file(&self) -> Result<String> {
        let token = uuid::Uuid::new_v4().to_string();
        let owner = serde_json::to_vec(&LockOwner {
            pid: std::process::id(),
            token: token.clone(),
        })
        .map_err(|e| IndexError::Corrupt(e.to_string()))?;
        let lock = self.lock_path();
        let deadline = Instant::now() + LOCK_WAIT;

        loop {
            match self.fs.create_new(&lock, &owner).await {
                Ok(()) => return Ok(token),
                Err(FsError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if self.lock_is_stale(&lock).await? {
                tracing::warn!("Breaking stale index lock {}", lock);
                self.fs.remove_all(&lock).await?;
                continue;
            }
            if Instant::now() >= deadline {
                return Err(IndexError::Locked(lock));
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    async fn lock_is_stale(&self, lock: &str) -> Result<bool> {
        match self.fs.stat(lock).await {
            // File mtimes are wall-clock time, whatever clock the index uses
            Ok(stat) => {
                let age = SystemClock.now_ms().saturating_sub(stat.mtime_millis);
                Ok(age > LOCK_STALE_AFTER.as_millis() as u64)
            }
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn unlock_file(&self, token: &str) {
        let lock = self.lock_path();
        let ours = match self.fs.read(&lock).await {
            Ok(bytes) => serde_json::from_slice::<LockOwner>(&bytes).is_ok_and(|o| o.token == token),
            Err(_) => false,
        };
        if !ours {
            tracing::warn!("Index lock {} was broken by another writer", lock);
            return;
        }
        if let Err(e) = self.fs.remove_all(&lock).await {
            tracing::warn!("Failed to release index lock {}: {}", lock, e);
        }
    }

    /// Apply `f` to a freshly loaded snapshot and persist the result.
    ///
    /// Runs under the in-process mutex and the index lock file. Nothing is
    /// written when `f` fails.
    async fn mutate<T, E>(
        &self,
        f: impl FnOnce(&mut IndexSnapshot) -> std::result::Result<T, E> + Send,
    ) -> std::result::Result<T, E>
    where
        E: From<IndexError>,
    {
        let _guard = self.write_lock.lock().await;
        let token = self.lock_file().await?;
        let result = self.apply(f, &token).await;
        self.unlock_file(&token).await;
        result
    }

    async fn apply<T, E>(
        &self,
        f: impl FnOnce(&mut IndexSnapshot) -> std::result::Result<T, E> + Send,
        token: &str,
    ) -> std::result::Result<T, E>
    where
        E: From<IndexError>,
    {
        let mut snapshot = self.load().await?;
        let value = f(&mut snapshot)?;
        self.save(&snapshot, token).await?;
        Ok(value)
    }
}

#[async_trait]
impl<F: FileSystem> NoteIndex for JsonIndex<F> {
    async fn get_note(&self, sd_id: SdId, note_id: &str) -> Result<Option<Note>> {
        let snapshot = self.load().await?;
        Ok(snapshot
            .note_position(sd_id, note_id)
            .map(|pos| snapshot.notes[pos].clone()))
    }

    async fn find_note(&self, note_id: &str) -> Result<Vec<Note>> {
        let snapshot = self.load().await?;
        Ok(snapshot
            .notes
            .into_iter()
            .filter(|n| n.id == note_id)
            .collect())
    }

    async fn upsert_note(&self, note: Note) -> Result<()> {
        self.mutate(|s| {
            s.upsert_note(note);
            Ok::<_, IndexError>(())
        })
        .await
    }

    async fn tombstone_note(&self, sd_id: SdId, note_id: &str) -> Result<()> {
        self.mutate(|s| match s.note_position(sd_id, note_id) {
            Some(pos) => {
                s.notes[pos].deleted = true;
                Ok(())
            }
            None => Err(IndexError::NoteNotFound {
                sd_id,
                note_id: note_id.to_string(),
            }),
        })
        .await
    }

    async fn purge_note(&self, sd_id: SdId, note_id: &str) -> Result<()> {
        self.mutate(|s| {
            s.notes.retain(|n| !(n.sd_id == sd_id && n.id == note_id));
            Ok::<_, IndexError>(())
        })
        .await
    }

    async fn get_notes_by_sd(&self, sd_id: SdId) -> Result<Vec<Note>> {
        let snapshot = self.load().await?;
        Ok(snapshot
            .notes
            .into_iter()
            .filter(|n| n.sd_id == sd_id)
            .collect())
    }

    async fn list_notes(&self) -> Result<Vec<Note>> {
        Ok(self.load().await?.notes)
    }
}

#[async_trait]
impl<F: FileSystem> MoveLog for JsonIndex<F> {
    async fn insert_move(&self, record: MoveRecord) -> Result<()> {
        self.mutate(|s| {
            if let Some(existing) = s.active_move_for_note(&record.note_id) {
                return Err(IndexError::MoveInProgress {
                    note_id: record.note_id.clone(),
                    move_id: existing.id.clone(),
                });
            }
            s.moves.push(record);
            Ok(())
        })
        .await
    }

    async fn get_move(&self, id: &str) -> Result<Option<MoveRecord>> {
        let snapshot = self.load().await?;
        Ok(snapshot.moves.into_iter().find(|m| m.id == id))
    }

    async fn update_move(&self, record: &MoveRecord) -> Result<()> {
        let record = record.clone();
        self.mutate(|s| match s.moves.iter_mut().find(|m| m.id == record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(IndexError::MoveNotFound(record.id)),
        })
        .await
    }

    async fn list_active_moves(&self) -> Result<Vec<MoveRecord>> {
        let snapshot = self.load().await?;
        Ok(snapshot
            .moves
            .into_iter()
            .filter(|m| !m.state.is_terminal())
            .collect())
    }

    async fn active_move_for_note(&self, note_id: &str) -> Result<Option<MoveRecord>> {
        let snapshot = self.load().await?;
        Ok(snapshot.active_move_for_note(note_id).cloned())
    }

    async fn purge_terminal_moves(&self, older_than_ms: u64) -> Result<usize> {
        self.mutate(|s| {
            let before = s.moves.len();
            s.moves
                .retain(|m| !(m.state.is_terminal() && m.last_modified < older_than_ms));
            Ok::<_, IndexError>(before - s.moves.len())
        })
        .await
    }
}

#[async_trait]
impl<F: FileSystem> StorageDirectoryRegistry for JsonIndex<F> {
    async fn get_storage_dir(&self, sd: &SdRef) -> registry::Result<Option<StorageDirectory>> {
        let snapshot = self.load().await?;
        Ok(snapshot.find_sd(sd).cloned())
    }

    async fn create_storage_dir(
        &self,
        uuid: &str,
        name: &str,
        path: &str,
    ) -> registry::Result<StorageDirectory> {
        let now = self.clock.now_ms();
        self.mutate(|s| {
            if s.find_sd(&SdRef::Uuid(uuid.to_string())).is_some() {
                return Err(RegistryError::DuplicateUuid(uuid.to_string()));
            }
            s.next_sd_id += 1;
            let sd = StorageDirectory {
                id: SdId(s.next_sd_id),
                name: name.to_string(),
                path: path.to_string(),
                uuid: uuid.to_string(),
                created: now,
                is_active: s.storage_dirs.is_empty(),
            };
            s.storage_dirs.push(sd.clone());
            Ok(sd)
        })
        .await
    }

    async fn list_storage_dirs(&self) -> registry::Result<Vec<StorageDirectory>> {
        Ok(self.load().await?.storage_dirs)
    }

    async fn set_active(&self, id: SdId) -> registry::Result<()> {
        self.mutate(|s| {
            if s.find_sd(&SdRef::Id(id)).is_none() {
                return Err(RegistryError::NotFound(SdRef::Id(id)));
            }
            for sd in &mut s.storage_dirs {
                sd.is_active = sd.id == id;
            }
            Ok(())
        })
        .await
    }

    async fn remove_storage_dir(&self, id: SdId) -> registry::Result<()> {
        self.mutate(|s| {
            let before = s.storage_dirs.len();
            s.storage_dirs.retain(|d| d.id != id);
            if s.storage_dirs.len() == before {
                return Err(RegistryError::NotFound(SdRef::Id(id)));
            }
            Ok(())
        })
        .await
    }
}
