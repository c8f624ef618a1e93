//! Storage directory registry interface.

use crate::index::IndexError;
use crate::model::{SdId, SdRef, StorageDirectory};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Storage directory not found: {0}")]
    NotFound(SdRef),

    #[error("A storage directory with uuid {0} is already registered")]
    DuplicateUuid(String),

    #[error("Registry storage error: {0}")]
    Storage(#[from] IndexError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Maps stable SD identities (uuid) to local rows.
#[async_trait]
pub trait StorageDirectoryRegistry: Send + Sync {
    async fn get_storage_dir(&self, sd: &SdRef) -> Result<Option<StorageDirectory>>;

    /// Register a storage directory. The first one registered becomes active.
    async fn create_storage_dir(
        &self,
        uuid: &str,
        name: &str,
        path: &str,
    ) -> Result<StorageDirectory>;

    async fn list_storage_dirs(&self) -> Result<Vec<StorageDirectory>>;

    /// Make `id` the single active storage directory.
    async fn set_active(&self, id: SdId) -> Result<()>;

    async fn remove_storage_dir(&self, id: SdId) -> Result<()>;
}
