//! Components wired together over the native filesystem.

use crate::config::Config;
use crate::native_fs::NativeFs;
use sd_core::backup::BackupError;
use sd_core::{
    BackupManager, ConsistencyScanner, FileSystem, FsError, IndexError, InstanceId,
    InstanceIdError, JsonIndex, MoveError, MoveRecord, MoveRequest, NoteIndex,
    NoteMoveCoordinator, RegistryError, StorageDirectory, StorageDirectoryRegistry,
    layout, write_sd_identity,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub type NativeIndex = JsonIndex<Arc<NativeFs>>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Path is not valid UTF-8 or cannot be made absolute: {0}")]
    InvalidPath(String),

    #[error("Instance id error: {0}")]
    InstanceId(#[from] InstanceIdError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Move(#[from] MoveError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Admin state holding all components.
pub struct App {
    fs: Arc<NativeFs>,
    index: Arc<NativeIndex>,
    instance_id: InstanceId,
    pub coordinator: NoteMoveCoordinator<Arc<NativeFs>>,
    pub scanner: ConsistencyScanner<Arc<NativeFs>>,
    pub backups: BackupManager<Arc<NativeFs>>,
}

impl App {
    /// Open (or create) the data directory described by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let fs = Arc::new(NativeFs::new(config.home.clone()));
        fs.mkdir("").await?;

        let instance_id = InstanceId::load_or_create(&fs, config.instance_id_file()).await?;
        let index = Arc::new(JsonIndex::open(Arc::clone(&fs), config.index_file()).await?);
        info!("Opened {:?} as instance {}", config.home, instance_id);

        let coordinator = NoteMoveCoordinator::new(
            Arc::clone(&fs),
            index.clone(),
            index.clone(),
            index.clone(),
            instance_id,
        );
        let scanner = ConsistencyScanner::new(
            Arc::clone(&fs),
            index.clone(),
            index.clone(),
            index.clone(),
            instance_id,
        );
        let backups = BackupManager::new(
            Arc::clone(&fs),
            index.clone(),
            index.clone(),
            config.backups_dir(),
        );

        Ok(Self {
            fs,
            index,
            instance_id,
            coordinator,
            scanner,
            backups,
        })
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn index(&self) -> &Arc<NativeIndex> {
        &self.index
    }

    /// Register the storage directory at `path`.
    ///
    /// An existing `SD_ID` marker wins, so a directory synced in from another
    /// machine keeps its identity. Otherwise `requested_uuid` (or a fresh one)
    /// is written.
    pub async fn add_storage_dir(
        &self,
        path: &Path,
        name: Option<String>,
        requested_uuid: Option<String>,
    ) -> Result<StorageDirectory> {
        let path = absolute_str(path)?;
        self.fs.mkdir(&path).await?;

        let marker = layout::identity_file(&path);
        let uuid = if self.fs.exists(&marker).await? {
            let found = String::from_utf8_lossy(&self.fs.read(&marker).await?)
                .trim()
                .to_string();
            if let Some(requested) = requested_uuid.filter(|u| *u != found) {
                warn!("Ignoring uuid {}: {} already identifies as {}", requested, path, found);
            }
            found
        } else {
            let uuid = requested_uuid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            write_sd_identity(self.fs.as_ref(), &path, &uuid).await?;
            uuid
        };

        let name = name.unwrap_or_else(|| {
            Path::new(&path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("storage")
                .to_string()
        });
        let sd = self.index.create_storage_dir(&uuid, &name, &path).await?;
        info!("Registered storage directory {} ({}) at {}", sd.name, sd.uuid, sd.path);
        Ok(sd)
    }

    /// Snapshot the note, then move it.
    pub async fn move_note(&self, request: MoveRequest) -> Result<MoveRecord> {
        let exists = self
            .index
            .get_note(request.source_sd, &request.note_id)
            .await?
            .is_some();
        if exists {
            let description = format!("before moving note {}", request.note_id);
            if let Err(e) = self
                .backups
                .create_pre_operation_snapshot(
                    request.source_sd,
                    std::slice::from_ref(&request.note_id),
                    Some(description),
                )
                .await
            {
                warn!("Pre-move snapshot of {} failed: {}", request.note_id, e);
            }
        }
        Ok(self.coordinator.move_note(request).await?)
    }
}

/// Absolute, UTF-8 form of a user-supplied path.
pub fn absolute_str(path: &Path) -> Result<String> {
    let absolute =
        std::path::absolute(path).map_err(|_| AppError::InvalidPath(path.display().to_string()))?;
    absolute
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::InvalidPath(path.display().to_string()))
}
