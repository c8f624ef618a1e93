//! FileSystem trait abstraction for platform-independent file operations.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sd-admin) - Uses tokio::fs
//!
//! Paths are plain strings. Storage directory paths are absolute on native
//! platforms and are joined with `/` by the callers in this crate.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction.
///
/// Implementations must be `Send + Sync` so one filesystem can be shared by the
/// coordinator, the scanner and the backup manager.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Rename a file or directory. The target must not exist.
    ///
    /// Atomic on native filesystems when source and target share a volume.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Recursively delete a file or directory. Deleting an absent path is not an error.
    async fn remove_all(&self, path: &str) -> Result<()>;

    /// Create a file that must not exist yet, creating parent directories.
    ///
    /// Fails with `AlreadyExists` if it does; the check and the create are one
    /// step, so two processes racing for the same path cannot both succeed.
    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()>;
}

/// Normalized form of a path: no leading or trailing `/`; the root is `""`.
fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn parent_of(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rfind('/').map_or("", |pos| &path[..pos]))
}

/// True if `candidate` is `root` itself or lives underneath it.
fn is_within(candidate: &str, root: &str) -> bool {
    root.is_empty()
        || candidate == root
        || candidate
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Name of the direct child of `dir` on the way to `path`, if any.
fn child_name<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    let rest = if dir.is_empty() {
        path
    } else {
        path.strip_prefix(dir)?.strip_prefix('/')?
    };
    if rest.is_empty() {
        return None;
    }
    Some(rest.split('/').next().unwrap_or(rest))
}

#[derive(Debug)]
struct MemFile {
    content: Vec<u8>,
    mtime: u64,
}

#[derive(Debug)]
struct MemTree {
    files: BTreeMap<String, MemFile>,
    dirs: BTreeSet<String>,
}

impl MemTree {
    fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            dirs: BTreeSet::from([String::new()]),
        }
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }

    /// Create `path` and all of its ancestors as directories.
    fn ensure_dir(&mut self, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            if self.files.contains_key(&current) {
                return Err(FsError::NotDirectory(current));
            }
            self.dirs.insert(current.clone());
        }
        Ok(())
    }

    fn has_children(&self, dir: &str) -> bool {
        self.files.keys().any(|f| child_name(f, dir).is_some())
            || self.dirs.iter().any(|d| child_name(d, dir).is_some())
    }
}

/// In-memory filesystem for testing.
///
/// The whole tree sits behind one lock, so `rename` and `remove_all` are
/// atomic with respect to other callers.
pub struct InMemoryFs {
    tree: RwLock<MemTree>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(MemTree::new()),
        }
    }

    /// Set a specific mtime for testing age-based checks
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let mut tree = self.tree.write().unwrap();
        if let Some(file) = tree.files.get_mut(&normalize(path)) {
            file.mtime = mtime;
        }
    }

    fn current_time_ms() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        let tree = self.tree.read().unwrap();
        match tree.files.get(&path) {
            Some(file) => Ok(file.content.clone()),
            None if tree.dirs.contains(&path) => Err(FsError::IsDirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.tree.write().unwrap();
        if tree.dirs.contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        if let Some(parent) = parent_of(&path) {
            tree.ensure_dir(parent)?;
        }
        tree.files.insert(
            path,
            MemFile {
                content: content.to_vec(),
                mtime: Self::current_time_ms(),
            },
        );
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize(path);
        let tree = self.tree.read().unwrap();
        if !tree.dirs.contains(&path) {
            if tree.files.contains_key(&path) {
                return Err(FsError::NotDirectory(path));
            }
            return Err(FsError::NotFound(path));
        }

        let mut entries: BTreeMap<&str, bool> = BTreeMap::new();
        for file in tree.files.keys() {
            if let Some(name) = child_name(file, &path) {
                // A deeper file implies a directory child
                let is_dir = file.len() > path.len() + name.len() + usize::from(!path.is_empty());
                *entries.entry(name).or_insert(is_dir) |= is_dir;
            }
        }
        for dir in &tree.dirs {
            if let Some(name) = child_name(dir, &path) {
                entries.insert(name, true);
            }
        }

        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| FileEntry {
                name: name.to_string(),
                is_dir,
            })
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.tree.write().unwrap();
        if tree.files.remove(&path).is_some() {
            return Ok(());
        }
        if !tree.dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }
        if tree.has_children(&path) {
            return Err(FsError::NotEmpty(path));
        }
        tree.dirs.remove(&path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.tree.read().unwrap().exists(&normalize(path)))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = normalize(path);
        let tree = self.tree.read().unwrap();
        if let Some(file) = tree.files.get(&path) {
            return Ok(FileStat {
                mtime_millis: file.mtime,
                size: file.content.len() as u64,
                is_dir: false,
            });
        }
        if tree.dirs.contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }
        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        self.tree.write().unwrap().ensure_dir(&path)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut tree = self.tree.write().unwrap();

        if !tree.exists(&from) {
            return Err(FsError::NotFound(from));
        }
        if tree.exists(&to) {
            return Err(FsError::AlreadyExists(to));
        }
        if is_within(&to, &from) {
            return Err(FsError::Io(format!("cannot move {} into itself", from)));
        }
        if let Some(parent) = parent_of(&to) {
            tree.ensure_dir(parent)?;
        }

        let rebase = |old: &str| format!("{}{}", to, &old[from.len()..]);
        let moved_files: Vec<String> = tree
            .files
            .keys()
            .filter(|f| is_within(f, &from))
            .cloned()
            .collect();
        for old in moved_files {
            if let Some(file) = tree.files.remove(&old) {
                tree.files.insert(rebase(&old), file);
            }
        }
        let moved_dirs: Vec<String> = tree
            .dirs
            .iter()
            .filter(|d| is_within(d, &from))
            .cloned()
            .collect();
        for old in moved_dirs {
            tree.dirs.remove(&old);
            tree.dirs.insert(rebase(&old));
        }
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        if path.is_empty() {
            return Err(FsError::Io("refusing to remove filesystem root".into()));
        }
        let mut tree = self.tree.write().unwrap();
        tree.files.retain(|f, _| !is_within(f, &path));
        tree.dirs.retain(|d| !is_within(d, &path));
        Ok(())
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.tree.write().unwrap();
        if tree.exists(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        if let Some(parent) = parent_of(&path) {
            tree.ensure_dir(parent)?;
        }
        tree.files.insert(
            path,
            MemFile {
                content: content.to_vec(),
                mtime: Self::current_time_ms(),
            },
        );
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This allows sharing one filesystem between the coordinator, scanner and backups
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn remove_all(&self, path: &str) -> Result<()> {
        (**self).remove_all(path).await
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).create_new(path, content).await
    }
}

/// Join path segments with `/`, ignoring empty segments.
pub fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.txt", b"hello world").await.unwrap();

        let content = fs.read("test.txt").await.unwrap();
        assert_eq!(content, b"hello world");

        assert!(fs.exists("test.txt").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());

        fs.delete("test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        // Write creates parent directories
        fs.write("a/b/c.txt", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.txt");
        assert!(!entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty_directory() {
        let fs = InMemoryFs::new();
        fs.write("a/b.txt", b"x").await.unwrap();

        assert!(matches!(fs.delete("a").await, Err(FsError::NotEmpty(_))));
        fs.delete("a/b.txt").await.unwrap();
        fs.delete("a").await.unwrap();
        assert!(!fs.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_moves_whole_tree() {
        let fs = InMemoryFs::new();
        fs.write("/sd/notes/.moving-n1/logs/1.log", b"one").await.unwrap();
        fs.write("/sd/notes/.moving-n1/meta.bin", b"two").await.unwrap();
        fs.write("/sd/notes/.moving-n10/other", b"keep").await.unwrap();

        fs.rename("/sd/notes/.moving-n1", "/sd/notes/n1").await.unwrap();

        assert_eq!(fs.read("/sd/notes/n1/logs/1.log").await.unwrap(), b"one");
        assert_eq!(fs.read("/sd/notes/n1/meta.bin").await.unwrap(), b"two");
        assert!(!fs.exists("/sd/notes/.moving-n1").await.unwrap());
        // Sibling with a shared name prefix is untouched
        assert!(fs.exists("/sd/notes/.moving-n10/other").await.unwrap());
    }

    #[tokio::test]
    async fn test_rename_rejects_existing_target() {
        let fs = InMemoryFs::new();
        fs.write("a/x", b"1").await.unwrap();
        fs.write("b/y", b"2").await.unwrap();

        assert!(matches!(fs.rename("a", "b").await, Err(FsError::AlreadyExists(_))));
        assert!(matches!(fs.rename("missing", "c").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_new_is_exclusive() {
        let fs = InMemoryFs::new();
        fs.create_new("locks/index.lock", b"one").await.unwrap();

        assert!(matches!(
            fs.create_new("locks/index.lock", b"two").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert_eq!(fs.read("locks/index.lock").await.unwrap(), b"one");
        assert!(matches!(fs.create_new("locks", b"x").await, Err(FsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_remove_all_is_recursive_and_tolerates_absence() {
        let fs = InMemoryFs::new();
        fs.write("sd/notes/n1/a", b"1").await.unwrap();
        fs.write("sd/notes/n1/sub/b", b"2").await.unwrap();
        fs.write("sd/notes/n2/a", b"3").await.unwrap();

        fs.remove_all("sd/notes/n1").await.unwrap();
        fs.remove_all("sd/notes/n1").await.unwrap();

        assert!(!fs.exists("sd/notes/n1").await.unwrap());
        assert!(!fs.exists("sd/notes/n1/sub/b").await.unwrap());
        assert!(fs.exists("sd/notes/n2/a").await.unwrap());
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/sd", "notes"), "/sd/notes");
        assert_eq!(join("/sd/", "/notes"), "/sd/notes");
        assert_eq!(join("", "notes"), "notes");
    }
}
