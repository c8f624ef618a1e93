//! NoteMoveCoordinator: moves a note between storage directories through a
//! durable, resumable state machine.
//!
//! ```text
//! initiated -> copying -> files_copied -> db_updated -> cleaning -> completed
//!      \___________\___________\
//!                               cancelled
//! ```
//!
//! Each call to [`NoteMoveCoordinator::advance`] performs exactly one
//! transition and persists it. Every forward action is safe to re-run, since
//! a resuming process cannot know how far a previous run got into a phase:
//!
//! - `copying`: wipe and rewrite `<target>/notes/.moving-<id>`
//! - `files_copied`: set a resident target document aside, promote staging to
//!   its final name, point the index at the target (upsert target row, purge
//!   source row), then drop the set-aside resident
//! - `cleaning`: delete the source document (absent is fine)

use crate::clock::{Clock, SystemClock};
use crate::document_store::{DocumentError, DocumentStore};
use crate::fs::FileSystem;
use crate::index::{IndexError, MoveLog, NoteIndex};
use crate::instance_id::InstanceId;
use crate::layout;
use crate::model::{ConflictPolicy, MoveRecord, MoveState, SdId, SdRef, StorageDirectory};
use crate::ownership::{self, classify, resolve_sd, Ownership};
use crate::registry::{RegistryError, StorageDirectoryRegistry};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Which end of a move an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdRole {
    Source,
    Target,
}

impl Display for SdRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SdRole::Source => f.write_str("source"),
            SdRole::Target => f.write_str("target"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MoveError {
    #[error("move record not found: {0}")]
    NotFound(String),

    #[error("note {note_id} not found in {sd}")]
    NoteNotFound { note_id: String, sd: String },

    #[error("{role} SD not accessible: {reason}")]
    SdNotAccessible { role: SdRole, reason: String },

    #[error("source and target SD are the same: {0}")]
    SameStorageDirectory(String),

    #[error("note {note_id} already exists in target SD {sd_uuid}")]
    AlreadyExists { note_id: String, sd_uuid: String },

    #[error("note {note_id} already has an active move: {move_id}")]
    MoveInProgress { note_id: String, move_id: String },

    #[error("cannot {action} move {move_id} in state {state}")]
    InvalidState {
        move_id: String,
        state: MoveState,
        action: &'static str,
    },

    #[error("move {move_id} has already placed files at the target and must be completed")]
    PlacementFinalized { move_id: String },

    #[error("move {move_id} is owned by instance {owner}")]
    NotOwner { move_id: String, owner: InstanceId },

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("index error: {0}")]
    Index(IndexError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl From<IndexError> for MoveError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::MoveInProgress { note_id, move_id } => {
                MoveError::MoveInProgress { note_id, move_id }
            }
            IndexError::MoveNotFound(id) => MoveError::NotFound(id),
            other => MoveError::Index(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, MoveError>;

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct MoveConfig {
    /// Age after which a foreign in-progress move is reported as stale
    pub stale_threshold: Duration,
    /// Terminal records older than this are garbage-collected
    pub record_retention: Duration,
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            stale_threshold: ownership::DEFAULT_STALE_THRESHOLD,
            record_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// A request to move one note.
#[derive(Debug, Clone)]
pub struct MoveRequest {
    pub note_id: String,
    pub source_sd: SdId,
    pub target_sd: SdId,
    pub target_folder_id: Option<String>,
    pub conflict: ConflictPolicy,
}

impl MoveRequest {
    pub fn new(note_id: impl Into<String>, source_sd: SdId, target_sd: SdId) -> Self {
        Self {
            note_id: note_id.into(),
            source_sd,
            target_sd,
            target_folder_id: None,
            conflict: ConflictPolicy::Fail,
        }
    }

    pub fn with_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.target_folder_id = Some(folder_id.into());
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }
}

/// A foreign-owned move that has not been touched within the stale threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleMove {
    pub move_id: String,
    pub note_id: String,
    pub state: MoveState,
    pub age_ms: u64,
    pub owner: InstanceId,
}

/// A move that recovery could not act on because an SD did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMove {
    pub move_id: String,
    pub note_id: String,
    pub reason: String,
}

/// An owned move whose resumption failed; it stays at its last good state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMove {
    pub move_id: String,
    pub state: MoveState,
    pub error: String,
}

/// Outcome of [`NoteMoveCoordinator::recover_incomplete_moves`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Owned moves resumed to completion
    pub resumed: Vec<String>,
    /// Owned moves whose resumption failed
    pub failed: Vec<FailedMove>,
    /// Foreign moves past the stale threshold (operator attention needed)
    pub stale: Vec<StaleMove>,
    /// Foreign moves that were recently active, left alone
    pub in_progress_elsewhere: Vec<String>,
    /// Moves whose SDs could not be resolved on this machine
    pub skipped: Vec<SkippedMove>,
}

/// Drives note moves between storage directories.
pub struct NoteMoveCoordinator<F: FileSystem> {
    documents: DocumentStore<F>,
    index: Arc<dyn NoteIndex>,
    moves: Arc<dyn MoveLog>,
    registry: Arc<dyn StorageDirectoryRegistry>,
    instance_id: InstanceId,
    clock: Arc<dyn Clock>,
    config: MoveConfig,
}

impl<F: FileSystem> NoteMoveCoordinator<F> {
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
            config: MoveConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: MoveConfig) -> Self {
        self.config = config;
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Validate a move and persist its record in `initiated`. No filesystem
    /// mutation happens here.
    pub async fn initiate_move(&self, request: MoveRequest) -> Result<MoveRecord> {
        let source = self.registered_sd(request.source_sd, SdRole::Source).await?;
        let target = self.registered_sd(request.target_sd, SdRole::Target).await?;
        if source.uuid == target.uuid {
            return Err(MoveError::SameStorageDirectory(source.uuid));
        }
        let source = self.resolve(&source.uuid, SdRole::Source).await?;
        let target = self.resolve(&target.uuid, SdRole::Target).await?;

        // A tombstone is not a note to move
        let live = self
            .index
            .get_note(source.id, &request.note_id)
            .await?
            .is_some_and(|n| n.is_live());
        if !live {
            return Err(MoveError::NoteNotFound {
                note_id: request.note_id,
                sd: source.uuid,
            });
        }

        if let Some(active) = self.moves.active_move_for_note(&request.note_id).await? {
            return Err(MoveError::MoveInProgress {
                note_id: request.note_id,
                move_id: active.id,
            });
        }

        // A tombstoned row at the target never conflicts; it is replaced.
        let occupied = self
            .index
            .get_note(target.id, &request.note_id)
            .await?
            .is_some_and(|n| n.is_live());
        let target_note_id = match (occupied, request.conflict) {
            (false, _) | (true, ConflictPolicy::Replace) => None,
            (true, ConflictPolicy::KeepBoth) => Some(uuid::Uuid::new_v4().to_string()),
            (true, ConflictPolicy::Fail) => {
                return Err(MoveError::AlreadyExists {
                    note_id: request.note_id,
                    sd_uuid: target.uuid,
                });
            }
        };

        let now = self.clock.now_ms();
        let record = MoveRecord {
            id: uuid::Uuid::new_v4().to_string(),
            note_id: request.note_id,
            source_sd_uuid: source.uuid,
            target_sd_uuid: target.uuid,
            target_folder_id: request.target_folder_id,
            state: MoveState::Initiated,
            instance_id: self.instance_id,
            initiated_at: now,
            last_modified: now,
            source_sd_path: source.path,
            target_sd_path: target.path,
            error: None,
            conflict_policy: request.conflict,
            target_note_id,
        };
        self.moves.insert_move(record.clone()).await?;

        info!(
            "Initiated move {} of note {} from {} to {} ({:?})",
            record.id, record.note_id, record.source_sd_uuid, record.target_sd_uuid, record.conflict_policy
        );
        Ok(record)
    }

    /// Initiate a move and run it to completion.
    pub async fn move_note(&self, request: MoveRequest) -> Result<MoveRecord> {
        let record = self.initiate_move(request).await?;
        self.execute_move(&record.id).await
    }

    /// Advance an owned move until it reaches a terminal state.
    pub async fn execute_move(&self, move_id: &str) -> Result<MoveRecord> {
        loop {
            let record = self.advance(move_id).await?;
            if record.state.is_terminal() {
                return Ok(record);
            }
        }
    }

    /// Perform exactly one state transition of an owned move and persist it.
    ///
    /// On a phase failure the error is stored on the record, the state is left
    /// unchanged, and calling `advance` again retries the phase.
    pub async fn advance(&self, move_id: &str) -> Result<MoveRecord> {
        let record = self.load(move_id).await?;
        if record.instance_id != self.instance_id {
            return Err(MoveError::NotOwner {
                move_id: record.id,
                owner: record.instance_id,
            });
        }
        if record.state.is_terminal() {
            return Ok(record);
        }

        let (source, target) = self.resolve_endpoints(&record).await?;

        let outcome = match record.state {
            MoveState::Initiated => Ok(MoveState::Copying),
            MoveState::Copying => self
                .copy_to_staging(&record, &source, &target)
                .await
                .map(|_| MoveState::FilesCopied),
            MoveState::FilesCopied => self
                .place_and_repoint(&record, &source, &target)
                .await
                .map(|_| MoveState::DbUpdated),
            MoveState::DbUpdated => Ok(MoveState::Cleaning),
            MoveState::Cleaning => self
                .remove_source(&record, &source)
                .await
                .map(|_| MoveState::Completed),
            MoveState::Completed | MoveState::Cancelled => Ok(record.state),
        };

        match outcome {
            Ok(next) => self.transition(record, next, None).await,
            Err(e) => {
                error!("Move {} failed in state {}: {}", record.id, record.state, e);
                self.record_error(record, &e).await;
                Err(e)
            }
        }
    }

    /// Resume or report every unfinished move. Run once at process start.
    ///
    /// Owned moves are resumed. Foreign moves are never touched: stale ones
    /// are reported for an operator, recent ones are left to their owner.
    pub async fn recover_incomplete_moves(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let active = self.moves.list_active_moves().await?;
        if active.is_empty() {
            debug!("No incomplete moves to recover");
            return Ok(report);
        }
        let now = self.clock.now_ms();

        for record in active {
            if let Err(e) = self.resolve_endpoints(&record).await {
                warn!(
                    "Skipping move {} of note {}: {}",
                    record.id, record.note_id, e
                );
                report.skipped.push(SkippedMove {
                    move_id: record.id,
                    note_id: record.note_id,
                    reason: e.to_string(),
                });
                continue;
            }

            match classify(&record, self.instance_id, now, self.config.stale_threshold) {
                Ownership::Owned => {
                    info!("Resuming move {} from state {}", record.id, record.state);
                    match self.execute_move(&record.id).await {
                        Ok(done) => report.resumed.push(done.id),
                        Err(e) => report.failed.push(FailedMove {
                            move_id: record.id,
                            state: record.state,
                            error: e.to_string(),
                        }),
                    }
                }
                Ownership::ForeignStale { owner, age_ms } => {
                    warn!(
                        "Stale move {} of note {} in state {} owned by {} (idle {}s); take over explicitly to finish it",
                        record.id,
                        record.note_id,
                        record.state,
                        owner,
                        age_ms / 1000
                    );
                    report.stale.push(StaleMove {
                        move_id: record.id,
                        note_id: record.note_id,
                        state: record.state,
                        age_ms,
                        owner,
                    });
                }
                Ownership::ForeignActive { owner, .. } => {
                    debug!("Move {} is active on instance {}, leaving it", record.id, owner);
                    report.in_progress_elsewhere.push(record.id);
                }
            }
        }

        info!(
            "Move recovery: {} resumed, {} failed, {} stale, {} elsewhere, {} skipped",
            report.resumed.len(),
            report.failed.len(),
            report.stale.len(),
            report.in_progress_elsewhere.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Foreign-owned unfinished moves past the stale threshold.
    pub async fn stale_moves(&self) -> Result<Vec<StaleMove>> {
        let now = self.clock.now_ms();
        let stale = self
            .moves
            .list_active_moves()
            .await?
            .into_iter()
            .filter_map(|record| {
                match classify(&record, self.instance_id, now, self.config.stale_threshold) {
                    Ownership::ForeignStale { owner, age_ms } => Some(StaleMove {
                        move_id: record.id,
                        note_id: record.note_id,
                        state: record.state,
                        age_ms,
                        owner,
                    }),
                    _ => None,
                }
            })
            .collect();
        Ok(stale)
    }

    /// Claim a move for this instance and resume it to completion.
    pub async fn take_over_move(&self, move_id: &str) -> Result<MoveRecord> {
        let record = self.load(move_id).await?;
        if record.state.is_terminal() {
            return Err(MoveError::InvalidState {
                move_id: record.id,
                state: record.state,
                action: "take over",
            });
        }
        self.resolve_endpoints(&record).await?;

        let previous = record.instance_id;
        let mut record = record;
        record.instance_id = self.instance_id;
        record.last_modified = self.clock.now_ms();
        record.error = None;
        self.moves.update_move(&record).await?;
        warn!(
            "Took over move {} of note {} from instance {} in state {}",
            record.id, record.note_id, previous, record.state
        );

        self.execute_move(&record.id).await
    }

    /// Cancel a move that has not yet repointed the index.
    ///
    /// Removes the staging directory, puts back a resident document that a
    /// replacing move had set aside, and leaves the source untouched. A
    /// foreign move can only be cancelled once it is stale.
    pub async fn cancel_move(&self, move_id: &str) -> Result<MoveRecord> {
        let record = self.load(move_id).await?;
        if !record.state.can_cancel() {
            return Err(MoveError::InvalidState {
                move_id: record.id,
                state: record.state,
                action: "cancel",
            });
        }
        let now = self.clock.now_ms();
        if let Ownership::ForeignActive { owner, .. } =
            classify(&record, self.instance_id, now, self.config.stale_threshold)
        {
            return Err(MoveError::NotOwner {
                move_id: record.id,
                owner,
            });
        }

        let (_, target) = self.resolve_endpoints(&record).await?;
        let final_id = record.final_note_id();
        let staging = layout::staging_dir(&target.path, final_id);
        let final_path = layout::note_dir(&target.path, final_id);

        // Without a staging directory but with the final one present, the
        // promotion already happened and the index may be repointed too.
        if record.state == MoveState::FilesCopied
            && !self.documents.exists(&staging).await?
            && self.documents.exists(&final_path).await?
        {
            return Err(MoveError::PlacementFinalized { move_id: record.id });
        }

        // Undo an unfinished promotion: partial copy out, resident back in
        self.documents
            .discard_partial_promotion(&target.path, final_id)
            .await?;
        let displaced = layout::displaced_dir(&target.path, final_id);
        if self.documents.exists(&displaced).await? {
            self.documents.rename(&displaced, &final_path).await?;
            info!("Restored resident document {} in {}", final_id, target.uuid);
        }

        self.documents.remove(&staging).await?;
        info!("Cancelled move {} of note {}", record.id, record.note_id);
        self.transition(record, MoveState::Cancelled, Some("cancelled".to_string()))
            .await
    }

    /// Delete terminal records older than the configured retention.
    pub async fn cleanup_old_moves(&self) -> Result<usize> {
        let retention = self.config.record_retention.as_millis() as u64;
        let cutoff = self.clock.now_ms().saturating_sub(retention);
        let removed = self.moves.purge_terminal_moves(cutoff).await?;
        if removed > 0 {
            info!("Removed {} finished move record(s)", removed);
        }
        Ok(removed)
    }

    pub async fn get_move(&self, move_id: &str) -> Result<MoveRecord> {
        self.load(move_id).await
    }

    pub async fn list_active_moves(&self) -> Result<Vec<MoveRecord>> {
        Ok(self.moves.list_active_moves().await?)
    }

    // ========== Phases ==========

    async fn copy_to_staging(
        &self,
        record: &MoveRecord,
        source: &StorageDirectory,
        target: &StorageDirectory,
    ) -> Result<()> {
        let src = layout::note_dir(&source.path, &record.note_id);
        let staging = layout::staging_dir(&target.path, record.final_note_id());

        // A previous attempt may have left a partial copy behind
        self.documents.remove(&staging).await?;
        self.documents.copy_dir(&src, &staging).await?;
        Ok(())
    }

    async fn place_and_repoint(
        &self,
        record: &MoveRecord,
        source: &StorageDirectory,
        target: &StorageDirectory,
    ) -> Result<()> {
        let final_id = record.final_note_id();
        let staging = layout::staging_dir(&target.path, final_id);
        let final_path = layout::note_dir(&target.path, final_id);
        let displaced = layout::displaced_dir(&target.path, final_id);

        if self.documents.exists(&staging).await? {
            // A partial copy from an interrupted promotion is ours to redo;
            // anything else at the final name is a resident note.
            if self.documents.exists(&final_path).await?
                && !self.documents.promotion_interrupted(&target.path, final_id).await?
            {
                self.ensure_replaceable(record, target, final_id).await?;
                self.documents.rename(&final_path, &displaced).await?;
                debug!("Set resident document {} aside for move {}", final_id, record.id);
            }
            self.documents.promote(&target.path, final_id).await?;
        } else if !self.documents.exists(&final_path).await? {
            // Staging vanished before promotion; the source is still intact.
            warn!("Staging directory for move {} is missing, copying again", record.id);
            self.copy_to_staging(record, source, target).await?;
            self.documents.promote(&target.path, final_id).await?;
        }

        if !self.documents.exists(&final_path).await? {
            return Err(DocumentError::NotFound(final_path).into());
        }

        self.repoint_index(record, source, target).await?;

        // The resident goes only once the index no longer points at it
        self.documents.remove(&displaced).await?;
        self.documents
            .remove(&layout::promotion_marker(&target.path, final_id))
            .await?;
        Ok(())
    }

    /// With `Fail`, a live note that appeared at the target after initiation
    /// still blocks the move.
    async fn ensure_replaceable(
        &self,
        record: &MoveRecord,
        target: &StorageDirectory,
        final_id: &str,
    ) -> Result<()> {
        if record.conflict_policy != ConflictPolicy::Fail {
            return Ok(());
        }
        let occupied = self
            .index
            .get_note(target.id, final_id)
            .await?
            .is_some_and(|n| n.is_live());
        if occupied {
            return Err(MoveError::AlreadyExists {
                note_id: final_id.to_string(),
                sd_uuid: target.uuid.clone(),
            });
        }
        Ok(())
    }

    /// Upsert the target row, then purge the source row. Re-running after a
    /// partial run converges on the same rows.
    async fn repoint_index(
        &self,
        record: &MoveRecord,
        source: &StorageDirectory,
        target: &StorageDirectory,
    ) -> Result<()> {
        let final_id = record.final_note_id();
        let source_row = self.index.get_note(source.id, &record.note_id).await?;

        let mut row = match source_row {
            Some(row) => row,
            None => match self.index.get_note(target.id, final_id).await? {
                // Source row already purged by an earlier run
                Some(row) => row,
                None => {
                    return Err(MoveError::NoteNotFound {
                        note_id: record.note_id.clone(),
                        sd: source.uuid.clone(),
                    });
                }
            },
        };

        row.id = final_id.to_string();
        row.sd_id = target.id;
        row.folder_id = record.target_folder_id.clone();
        row.modified = self.clock.now_ms();
        self.index.upsert_note(row).await?;
        self.index.purge_note(source.id, &record.note_id).await?;

        debug!(
            "Index now places note {} in {} (from {} in {})",
            final_id, target.uuid, record.note_id, source.uuid
        );
        Ok(())
    }

    async fn remove_source(&self, record: &MoveRecord, source: &StorageDirectory) -> Result<()> {
        let src = layout::note_dir(&source.path, &record.note_id);
        self.documents.remove(&src).await?;
        Ok(())
    }

    // ========== Helpers ==========

    async fn load(&self, move_id: &str) -> Result<MoveRecord> {
        self.moves
            .get_move(move_id)
            .await?
            .ok_or_else(|| MoveError::NotFound(move_id.to_string()))
    }

    async fn registered_sd(&self, id: SdId, role: SdRole) -> Result<StorageDirectory> {
        self.registry
            .get_storage_dir(&SdRef::Id(id))
            .await?
            .ok_or_else(|| MoveError::SdNotAccessible {
                role,
                reason: format!("storage directory #{} is not registered", id),
            })
    }

    async fn resolve(&self, uuid: &str, role: SdRole) -> Result<StorageDirectory> {
        resolve_sd(self.registry.as_ref(), self.documents.fs(), uuid)
            .await
            .map_err(|e| MoveError::SdNotAccessible {
                role,
                reason: e.to_string(),
            })
    }

    async fn resolve_endpoints(
        &self,
        record: &MoveRecord,
    ) -> Result<(StorageDirectory, StorageDirectory)> {
        let source = self.resolve(&record.source_sd_uuid, SdRole::Source).await?;
        let target = self.resolve(&record.target_sd_uuid, SdRole::Target).await?;
        Ok((source, target))
    }

    async fn transition(
        &self,
        mut record: MoveRecord,
        next: MoveState,
        error: Option<String>,
    ) -> Result<MoveRecord> {
        let previous = record.state;
        record.state = next;
        record.last_modified = self.clock.now_ms();
        record.error = error;
        self.moves.update_move(&record).await?;
        info!("Move {}: {} -> {}", record.id, previous, next);
        Ok(record)
    }

    async fn record_error(&self, mut record: MoveRecord, err: &MoveError) {
        record.error = Some(err.to_string());
        record.last_modified = self.clock.now_ms();
        if let Err(e) = self.moves.update_move(&record).await {
            error!("Failed to persist error on move {}: {}", record.id, e);
        }
    }
}
