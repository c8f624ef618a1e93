//! The identity of this installation, recorded as the owner of every move it
//! starts and as the name of its activity logs.
//!
//! It lives in a small file next to the index. A process restarted after a
//! crash reads the same id back, so its in-flight moves are resumed as its own
//! rather than reported as another instance's.

use crate::fs::{FileSystem, FsError};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum InstanceIdError {
    #[error("Not an instance id: {0:?}")]
    Malformed(String),
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),
}

/// Owner of in-flight moves, written as 16 lowercase hex digits.
///
/// Zero is never handed out, so a zeroed id on disk counts as damage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(u64);

impl InstanceId {
    fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    fn decode(text: &str) -> Option<Self> {
        if text.len() != 16 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        match u64::from_str_radix(text, 16) {
            Ok(0) | Err(_) => None,
            Ok(id) => Some(Self(id)),
        }
    }

    /// Read this installation's id from `path`, creating it on first start.
    ///
    /// A damaged file is replaced with a fresh id. Moves owned by the lost id
    /// then show up as foreign and can be taken over once they go stale.
    pub async fn load_or_create<F: FileSystem>(
        fs: &F,
        path: &str,
    ) -> Result<Self, InstanceIdError> {
        if fs.exists(path).await? {
            let bytes = fs.read(path).await?;
            let text = String::from_utf8_lossy(&bytes);
            match Self::decode(text.trim()) {
                Some(id) => return Ok(id),
                None => warn!("Replacing damaged instance id at {}: {:?}", path, text),
            }
        }

        let id = Self::generate();
        fs.write(path, format!("{}\n", id).as_bytes()).await?;
        info!("This installation is instance {}", id);
        Ok(id)
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for InstanceId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = InstanceIdError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        Self::decode(&text).ok_or(InstanceIdError::Malformed(text))
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.to_string()
    }
}
