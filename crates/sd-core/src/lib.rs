//! sd-core: crash-safe note storage across storage directories (SDs).
//!
//! This crate provides:
//! - Moving notes between SDs through a durable, resumable state machine
//! - Ownership and staleness rules for moves left behind by other processes
//! - A consistency scanner for index/document divergence
//! - SD snapshots with retention
//! - FileSystem, NoteIndex, MoveLog and StorageDirectoryRegistry abstractions

pub mod backup;
pub mod clock;
pub mod document_store;
pub mod fs;
pub mod index;
pub mod instance_id;
pub mod json_index;
pub mod layout;
pub mod model;
pub mod move_coordinator;
pub mod ownership;
pub mod registry;
pub mod scanner;

pub use backup::{BackupConfig, BackupError, BackupManager, BackupMetadata, BackupType, RestoreIdentity};
pub use clock::{Clock, ManualClock, SystemClock};
pub use document_store::{DocumentError, DocumentStats, DocumentStore};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use index::{IndexError, MoveLog, NoteIndex};
pub use instance_id::{InstanceId, InstanceIdError};
pub use json_index::JsonIndex;
pub use model::{ConflictPolicy, MoveRecord, MoveState, Note, SdId, SdRef, StorageDirectory};
pub use move_coordinator::{
    MoveConfig, MoveError, MoveRequest, NoteMoveCoordinator, RecoveryReport, SdRole, StaleMove,
};
pub use ownership::{is_stale, resolve_sd, write_sd_identity, Ownership, ResolveError};
pub use registry::{RegistryError, StorageDirectoryRegistry};
pub use scanner::{ConsistencyScanner, ScanConfig, ScanError, ScanReport};
