#![allow(dead_code)]

use async_trait::async_trait;
use sd_core::fs::{join, FileEntry, FileStat, FsError};
use sd_core::{
    ConflictPolicy, FileSystem, InMemoryFs, InstanceId, JsonIndex, ManualClock, MoveRecord,
    MoveRequest, MoveState, Note, NoteIndex, NoteMoveCoordinator, StorageDirectory,
    StorageDirectoryRegistry, write_sd_identity,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub const INDEX_PATH: &str = "app/index.json";
pub const ME: u64 = 0xaaaa;
pub const OTHER: u64 = 0xbbbb;
pub const START_MS: u64 = 1_700_000_000_000;

pub type TestIndex = JsonIndex<Arc<InMemoryFs>>;
pub type TestCoordinator = NoteMoveCoordinator<Arc<InMemoryFs>>;
pub type FaultyCoordinator = NoteMoveCoordinator<Arc<FaultFs>>;

/// Two mounted storage directories, `A` (`a-uuid`) and `B` (`b-uuid`).
pub struct World {
    pub fs: Arc<InMemoryFs>,
    pub index: Arc<TestIndex>,
    pub clock: Arc<ManualClock>,
    pub a: StorageDirectory,
    pub b: StorageDirectory,
}

impl World {
    pub async fn new() -> Self {
        let fs = Arc::new(InMemoryFs::new());
        let index = Arc::new(JsonIndex::open(Arc::clone(&fs), INDEX_PATH).await.unwrap());
        let a = index.create_storage_dir("a-uuid", "A", "/sds/a").await.unwrap();
        let b = index.create_storage_dir("b-uuid", "B", "/sds/b").await.unwrap();
        write_sd_identity(&fs, &a.path, &a.uuid).await.unwrap();
        write_sd_identity(&fs, &b.path, &b.uuid).await.unwrap();
        Self {
            fs,
            index,
            clock: Arc::new(ManualClock::new(START_MS)),
            a,
            b,
        }
    }

    /// Coordinator over the shared index handle.
    pub fn coordinator(&self, instance: u64) -> TestCoordinator {
        NoteMoveCoordinator::new(
            Arc::clone(&self.fs),
            self.index.clone(),
            self.index.clone(),
            self.index.clone(),
            InstanceId::from(instance),
        )
        .with_clock(self.clock.clone())
    }

    /// Coordinator whose document operations go through `faults`.
    pub fn faulty_coordinator(&self, instance: u64, faults: &Arc<FaultFs>) -> FaultyCoordinator {
        NoteMoveCoordinator::new(
            Arc::clone(faults),
            self.index.clone(),
            self.index.clone(),
            self.index.clone(),
            InstanceId::from(instance),
        )
        .with_clock(self.clock.clone())
    }

    /// Coordinator over a freshly opened index, as after a process restart.
    pub async fn restarted_coordinator(&self, instance: u64) -> TestCoordinator {
        let index = Arc::new(JsonIndex::open(Arc::clone(&self.fs), INDEX_PATH).await.unwrap());
        NoteMoveCoordinator::new(
            Arc::clone(&self.fs),
            index.clone(),
            index.clone(),
            index,
            InstanceId::from(instance),
        )
        .with_clock(self.clock.clone())
    }

    pub async fn add_note(&self, sd: &StorageDirectory, id: &str, title: &str, body: &[u8]) {
        self.index
            .upsert_note(Note::new(id, title, sd.id, START_MS - 1_000))
            .await
            .unwrap();
        self.write_document(sd, id, body).await;
    }

    pub async fn write_document(&self, sd: &StorageDirectory, id: &str, body: &[u8]) {
        let dir = format!("{}/notes/{}", sd.path, id);
        self.fs
            .write(&format!("{}/logs/0001.crdtlog", dir), body)
            .await
            .unwrap();
        self.fs
            .write(&format!("{}/meta/snapshot.bin", dir), b"snapshot")
            .await
            .unwrap();
    }

    pub async fn document(&self, sd: &StorageDirectory, id: &str) -> Option<Vec<u8>> {
        let path = format!("{}/notes/{}/logs/0001.crdtlog", sd.path, id);
        self.fs.read(&path).await.ok()
    }

    pub fn request(&self, note_id: &str) -> MoveRequest {
        MoveRequest::new(note_id, self.a.id, self.b.id)
    }

    pub fn request_with(&self, note_id: &str, conflict: ConflictPolicy) -> MoveRequest {
        self.request(note_id).with_conflict(conflict)
    }

    /// Initiate a move of `note_id` from A to B and advance it until it sits in `state`.
    pub async fn move_stopped_at(
        &self,
        coordinator: &TestCoordinator,
        note_id: &str,
        state: MoveState,
    ) -> MoveRecord {
        let mut record = coordinator.initiate_move(self.request(note_id)).await.unwrap();
        while record.state != state {
            record = coordinator.advance(&record.id).await.unwrap();
        }
        record
    }

    /// Every file under `root` with its contents.
    pub async fn file_tree(&self, root: &str) -> BTreeMap<String, Vec<u8>> {
        let mut files = BTreeMap::new();
        if !self.fs.exists(root).await.unwrap() {
            return files;
        }
        let mut pending = vec![root.to_string()];
        while let Some(dir) = pending.pop() {
            for entry in self.fs.list(&dir).await.unwrap() {
                let path = join(&dir, &entry.name);
                if entry.is_dir {
                    pending.push(path);
                } else {
                    let content = self.fs.read(&path).await.unwrap();
                    files.insert(path, content);
                }
            }
        }
        files
    }

    /// Note rows in a stable order.
    pub async fn notes(&self) -> Vec<Note> {
        let mut notes = self.index.list_notes().await.unwrap();
        notes.sort_by(|x, y| (x.sd_id, &x.id).cmp(&(y.sd_id, &y.id)));
        notes
    }
}

/// Every non-terminal state a crash can leave a move in.
pub const RESUMABLE_STATES: [MoveState; 5] = [
    MoveState::Initiated,
    MoveState::Copying,
    MoveState::FilesCopied,
    MoveState::DbUpdated,
    MoveState::Cleaning,
];

fn within(path: &str, root: &str) -> bool {
    path == root || path.starts_with(&format!("{}/", root))
}

/// Wraps the world's filesystem and fails chosen operations with `Io`.
///
/// Every mutating call is logged as `"<op> <path>"` in the order it ran.
pub struct FaultFs {
    inner: Arc<InMemoryFs>,
    rename_into: Mutex<Option<String>>,
    writes_under: Mutex<Option<String>>,
    removes_of: Mutex<Option<String>>,
    vanish_after_listing: Mutex<Option<(String, String)>>,
    ops: Mutex<Vec<String>>,
}

impl FaultFs {
    pub fn new(inner: Arc<InMemoryFs>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            rename_into: Mutex::new(None),
            writes_under: Mutex::new(None),
            removes_of: Mutex::new(None),
            vanish_after_listing: Mutex::new(None),
            ops: Mutex::new(Vec::new()),
        })
    }

    /// Renames whose target is `path` fail, as across devices.
    pub fn fail_renames_into(&self, path: &str) {
        *self.rename_into.lock().unwrap() = Some(path.to_string());
    }

    /// Writes at or below `path` fail, as on a full disk.
    pub fn fail_writes_under(&self, path: &str) {
        *self.writes_under.lock().unwrap() = Some(path.to_string());
    }

    /// `remove_all(path)` fails, standing in for a crash right before it.
    pub fn fail_remove_of(&self, path: &str) {
        *self.removes_of.lock().unwrap() = Some(path.to_string());
    }

    /// Once `dir` has been listed, `victim` is deleted, as by another process.
    pub fn vanish_after_listing(&self, dir: &str, victim: &str) {
        *self.vanish_after_listing.lock().unwrap() = Some((dir.to_string(), victim.to_string()));
    }

    pub fn heal(&self) {
        *self.rename_into.lock().unwrap() = None;
        *self.writes_under.lock().unwrap() = None;
        *self.removes_of.lock().unwrap() = None;
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn log(&self, op: &str, path: &str) {
        self.ops.lock().unwrap().push(format!("{} {}", op, path));
    }
}

#[async_trait]
impl FileSystem for FaultFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        let blocked = self.writes_under.lock().unwrap().clone();
        if blocked.is_some_and(|root| within(path, &root)) {
            return Err(FsError::Io(format!("disk full: {}", path)));
        }
        self.log("write", path);
        self.inner.write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, FsError> {
        let entries = self.inner.list(path).await?;
        let vanish = self.vanish_after_listing.lock().unwrap().take_if(|(dir, _)| dir.as_str() == path);
        if let Some((_, victim)) = vanish {
            self.inner.remove_all(&victim).await?;
        }
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<(), FsError> {
        self.log("delete", path);
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, FsError> {
        self.inner.exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        self.inner.stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        self.inner.mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let blocked = self.rename_into.lock().unwrap().clone();
        if blocked.as_deref() == Some(to) {
            return Err(FsError::Io(format!("cross-device rename to {}", to)));
        }
        self.log("rename", &format!("{} -> {}", from, to));
        self.inner.rename(from, to).await
    }

    async fn remove_all(&self, path: &str) -> Result<(), FsError> {
        let blocked = self.removes_of.lock().unwrap().clone();
        if blocked.as_deref() == Some(path) {
            return Err(FsError::Io(format!("interrupted removing {}", path)));
        }
        self.log("remove_all", path);
        self.inner.remove_all(path).await
    }

    async fn create_new(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        self.log("create_new", path);
        self.inner.create_new(path, content).await
    }
}
