//! Ownership and staleness primitives shared by the move coordinator and the
//! consistency scanner.
//!
//! There is no lock service. A move record's `instance_id` plus its
//! `last_modified` timestamp act as a soft lock: the owner refreshes the
//! timestamp on every phase, and anyone else only ever *reports* a record
//! whose timestamp has aged past the threshold. Storage directories are
//! matched across machines by uuid, never by local id or path.

use crate::fs::{FileSystem, FsError};
use crate::instance_id::InstanceId;
use crate::layout;
use crate::model::{MoveRecord, SdRef, StorageDirectory};
use crate::registry::{RegistryError, StorageDirectoryRegistry};
use std::time::Duration;
use thiserror::Error;

/// Age past which a foreign in-progress move is presumed abandoned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// True once `now - last_modified` reaches `threshold`. The boundary counts as stale.
pub fn is_stale(last_modified_ms: u64, now_ms: u64, threshold: Duration) -> bool {
    now_ms.saturating_sub(last_modified_ms) >= threshold.as_millis() as u64
}

/// How the current process relates to a move record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// We own it and may resume it.
    Owned,
    /// Another instance touched it recently and may still be working on it.
    ForeignActive { owner: InstanceId, age_ms: u64 },
    /// Another instance owns it but has not touched it within the threshold.
    ForeignStale { owner: InstanceId, age_ms: u64 },
}

pub fn classify(
    record: &MoveRecord,
    current: InstanceId,
    now_ms: u64,
    threshold: Duration,
) -> Ownership {
    if record.instance_id == current {
        return Ownership::Owned;
    }
    let age_ms = record.age_ms(now_ms);
    if is_stale(record.last_modified, now_ms, threshold) {
        Ownership::ForeignStale {
            owner: record.instance_id,
            age_ms,
        }
    } else {
        Ownership::ForeignActive {
            owner: record.instance_id,
            age_ms,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Storage directory {0} is not registered on this machine")]
    Unknown(String),

    #[error("Storage directory {uuid} is not mounted at {path}")]
    NotMounted { uuid: String, path: String },

    #[error("Storage directory at {path} identifies as {found}, expected {uuid}")]
    IdentityMismatch {
        uuid: String,
        path: String,
        found: String,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

/// Resolve an SD uuid to a locally registered, mounted storage directory.
///
/// Fails when the uuid is unknown here, when its registered path is absent,
/// or when the `SD_ID` marker at that path names a different SD. A missing
/// marker is accepted.
pub async fn resolve_sd<F: FileSystem>(
    registry: &dyn StorageDirectoryRegistry,
    fs: &F,
    uuid: &str,
) -> Result<StorageDirectory, ResolveError> {
    let sd = registry
        .get_storage_dir(&SdRef::Uuid(uuid.to_string()))
        .await?
        .ok_or_else(|| ResolveError::Unknown(uuid.to_string()))?;

    if !fs.exists(&sd.path).await? {
        return Err(ResolveError::NotMounted {
            uuid: uuid.to_string(),
            path: sd.path,
        });
    }

    let marker = layout::identity_file(&sd.path);
    if fs.exists(&marker).await? {
        let bytes = fs.read(&marker).await?;
        let found = String::from_utf8_lossy(&bytes).trim().to_string();
        if found != sd.uuid {
            return Err(ResolveError::IdentityMismatch {
                uuid: uuid.to_string(),
                path: sd.path,
                found,
            });
        }
    }

    Ok(sd)
}

/// Write the `SD_ID` marker for a storage directory.
pub async fn write_sd_identity<F: FileSystem>(
    fs: &F,
    sd_path: &str,
    uuid: &str,
) -> Result<(), FsError> {
    fs.write(&layout::identity_file(sd_path), uuid.as_bytes()).await
}
