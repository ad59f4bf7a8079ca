//! Data layer consumed by the broker, and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use rc2_protocol::model::{ImageId, ProjectId, UserId};
use rc2_protocol::{
    BulkUserInfo, File, FileChangeType, FileChangedData, FileId, Project, SessionImage, User,
    Workspace, WorkspaceId,
};

use crate::error::DaoError;

const FILE_CHANGE_BUFFER: usize = 64;

/// Persistence operations a session needs.
#[async_trait]
pub trait Rc2Dao: Send + Sync {
    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, DaoError>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>, DaoError>;

    /// Projects, workspaces and files for a user.
    async fn get_user_info(&self, user_id: UserId) -> Result<BulkUserInfo, DaoError>;

    async fn create_session_record(&self, wspace_id: WorkspaceId) -> Result<i64, DaoError>;

    async fn close_session_record(&self, session_id: i64) -> Result<(), DaoError>;

    /// `None` if the file does not exist or is not owned by `user_id`.
    async fn get_file(&self, id: FileId, user_id: UserId) -> Result<Option<File>, DaoError>;

    async fn get_files(&self, wspace_id: WorkspaceId) -> Result<Vec<File>, DaoError>;

    async fn get_file_data(&self, id: FileId) -> Result<Vec<u8>, DaoError>;

    /// Replace file contents. Fails with `VersionMismatch` when
    /// `expected_version` is given and differs from the stored version.
    async fn set_file(
        &self,
        bytes: Vec<u8>,
        id: FileId,
        expected_version: Option<i32>,
    ) -> Result<File, DaoError>;

    async fn delete_file(&self, id: FileId) -> Result<(), DaoError>;

    async fn rename_file(&self, id: FileId, version: i32, new_name: &str)
    -> Result<File, DaoError>;

    async fn duplicate_file(&self, id: FileId, new_name: &str) -> Result<File, DaoError>;

    async fn get_images(&self, ids: &[ImageId]) -> Result<Vec<SessionImage>, DaoError>;

    /// Changes to files in a workspace, until the receiver is dropped.
    async fn subscribe_file_changes(
        &self,
        wspace_id: WorkspaceId,
    ) -> Result<mpsc::Receiver<FileChangedData>, DaoError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: i64,
    pub wspace_id: WorkspaceId,
    pub started_epoch_ms: i64,
    pub ended_epoch_ms: Option<i64>,
}

/// Seed data for [`MemoryDao`], usually loaded from a JSON file.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemorySeed {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
    #[serde(default)]
    pub files: Vec<SeedFile>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SeedFile {
    pub wspace_id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub content: String,
}

struct StoredFile {
    meta: File,
    data: Vec<u8>,
}

#[derive(Default)]
struct Store {
    users: HashMap<UserId, User>,
    projects: HashMap<ProjectId, Project>,
    workspaces: HashMap<WorkspaceId, Workspace>,
    files: HashMap<FileId, StoredFile>,
    images: HashMap<ImageId, SessionImage>,
    sessions: HashMap<i64, SessionRecord>,
    watchers: HashMap<WorkspaceId, Vec<mpsc::Sender<FileChangedData>>>,
    next_id: i64,
}

impl Store {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn file_mut(&mut self, id: FileId) -> Result<&mut StoredFile, DaoError> {
        self.files.get_mut(&id).ok_or(DaoError::NoSuchRow)
    }

    fn insert_file(&mut self, wspace_id: WorkspaceId, name: &str, data: Vec<u8>) -> File {
        let now = epoch_ms();
        let meta = File {
            id: self.next_id(),
            version: 1,
            wspace_id,
            name: name.to_string(),
            date_created_epoch_ms: now,
            last_modified_epoch_ms: now,
            file_size: data.len() as u64,
        };
        self.files.insert(
            meta.id,
            StoredFile {
                meta: meta.clone(),
                data,
            },
        );
        meta
    }

    fn notify(&mut self, wspace_id: WorkspaceId, change: FileChangedData) {
        if let Some(watchers) = self.watchers.get_mut(&wspace_id) {
            watchers.retain(|tx| !tx.is_closed());
            for tx in watchers.iter() {
                if tx.try_send(change.clone()).is_err() {
                    debug!(wspace_id, file_id = change.file_id, "file change dropped");
                }
            }
        }
    }
}

/// In-process data layer for tests and for running without a database.
#[derive(Default)]
pub struct MemoryDao {
    store: Mutex<Store>,
}

impl MemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: MemorySeed) -> Self {
        let mut store = Store::default();
        let mut max_id = 0;
        for user in seed.users {
            max_id = max_id.max(user.id);
            store.users.insert(user.id, user);
        }
        for project in seed.projects {
            max_id = max_id.max(project.id);
            store.projects.insert(project.id, project);
        }
        for wspace in seed.workspaces {
            max_id = max_id.max(wspace.id);
            store.workspaces.insert(wspace.id, wspace);
        }
        store.next_id = max_id;
        for file in seed.files {
            store.insert_file(file.wspace_id, &file.name, file.content.into_bytes());
        }
        info!(
            users = store.users.len(),
            workspaces = store.workspaces.len(),
            files = store.files.len(),
            "seeded in-memory data"
        );
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn load_seed(path: &Path) -> Result<Self, DaoError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DaoError::QueryFailed(format!("reading {}: {e}", path.display())))?;
        let seed: MemorySeed = serde_json::from_str(&contents)
            .map_err(|e| DaoError::QueryFailed(format!("parsing {}: {e}", path.display())))?;
        Ok(Self::from_seed(seed))
    }

    pub async fn insert_user(&self, user: User) {
        let mut store = self.store.lock().await;
        store.next_id = store.next_id.max(user.id);
        store.users.insert(user.id, user);
    }

    pub async fn insert_project(&self, project: Project) {
        let mut store = self.store.lock().await;
        store.next_id = store.next_id.max(project.id);
        store.projects.insert(project.id, project);
    }

    pub async fn insert_workspace(&self, wspace: Workspace) {
        let mut store = self.store.lock().await;
        store.next_id = store.next_id.max(wspace.id);
        store.workspaces.insert(wspace.id, wspace);
    }

    /// Add a file and notify watchers of the workspace.
    pub async fn insert_file(&self, wspace_id: WorkspaceId, name: &str, data: Vec<u8>) -> File {
        let mut store = self.store.lock().await;
        let file = store.insert_file(wspace_id, name, data);
        store.notify(
            wspace_id,
            FileChangedData {
                change_type: FileChangeType::Insert,
                file_id: file.id,
                file: Some(file.clone()),
            },
        );
        file
    }

    pub async fn insert_image(&self, image: SessionImage) {
        self.store.lock().await.images.insert(image.id, image);
    }

    pub async fn session_record(&self, id: i64) -> Option<SessionRecord> {
        self.store.lock().await.sessions.get(&id).cloned()
    }
}

#[async_trait]
impl Rc2Dao for MemoryDao {
    async fn get_workspace(&self, id: WorkspaceId) -> Result<Option<Workspace>, DaoError> {
        Ok(self.store.lock().await.workspaces.get(&id).cloned())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, DaoError> {
        Ok(self.store.lock().await.users.get(&id).cloned())
    }

    async fn get_user_info(&self, user_id: UserId) -> Result<BulkUserInfo, DaoError> {
        let store = self.store.lock().await;
        let user = store.users.get(&user_id).cloned().ok_or(DaoError::NoSuchRow)?;

        let mut projects: Vec<Project> = store
            .projects
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.id);

        let mut workspaces: BTreeMap<ProjectId, Vec<Workspace>> = BTreeMap::new();
        let mut files: BTreeMap<WorkspaceId, Vec<File>> = BTreeMap::new();
        for project in &projects {
            let mut wspaces: Vec<Workspace> = store
                .workspaces
                .values()
                .filter(|w| w.project_id == project.id)
                .cloned()
                .collect();
            wspaces.sort_by_key(|w| w.id);
            for wspace in &wspaces {
                let mut wfiles: Vec<File> = store
                    .files
                    .values()
                    .filter(|f| f.meta.wspace_id == wspace.id)
                    .map(|f| f.meta.clone())
                    .collect();
                wfiles.sort_by_key(|f| f.id);
                files.insert(wspace.id, wfiles);
            }
            workspaces.insert(project.id, wspaces);
        }

        Ok(BulkUserInfo {
            user,
            projects,
            workspaces,
            files,
        })
    }

    async fn create_session_record(&self, wspace_id: WorkspaceId) -> Result<i64, DaoError> {
        let mut store = self.store.lock().await;
        let id = store.next_id();
        store.sessions.insert(
            id,
            SessionRecord {
                id,
                wspace_id,
                started_epoch_ms: epoch_ms(),
                ended_epoch_ms: None,
            },
        );
        Ok(id)
    }

    async fn close_session_record(&self, session_id: i64) -> Result<(), DaoError> {
        let mut store = self.store.lock().await;
        let record = store
            .sessions
            .get_mut(&session_id)
            .ok_or(DaoError::NoSuchRow)?;
        record.ended_epoch_ms = Some(epoch_ms());
        Ok(())
    }

    async fn get_file(&self, id: FileId, user_id: UserId) -> Result<Option<File>, DaoError> {
        let store = self.store.lock().await;
        let Some(file) = store.files.get(&id) else {
            return Ok(None);
        };
        let owned = store
            .workspaces
            .get(&file.meta.wspace_id)
            .is_some_and(|w| w.user_id == user_id);
        Ok(owned.then(|| file.meta.clone()))
    }

    async fn get_files(&self, wspace_id: WorkspaceId) -> Result<Vec<File>, DaoError> {
        let store = self.store.lock().await;
        let mut files: Vec<File> = store
            .files
            .values()
            .filter(|f| f.meta.wspace_id == wspace_id)
            .map(|f| f.meta.clone())
            .collect();
        files.sort_by_key(|f| f.id);
        Ok(files)
    }

    async fn get_file_data(&self, id: FileId) -> Result<Vec<u8>, DaoError> {
        let store = self.store.lock().await;
        store
            .files
            .get(&id)
            .map(|f| f.data.clone())
            .ok_or(DaoError::NoSuchRow)
    }

    async fn set_file(
        &self,
        bytes: Vec<u8>,
        id: FileId,
        expected_version: Option<i32>,
    ) -> Result<File, DaoError> {
        let mut store = self.store.lock().await;
        let stored = store.file_mut(id)?;
        if let Some(expected) = expected_version {
            if expected != stored.meta.version {
                return Err(DaoError::VersionMismatch);
            }
        }
        stored.meta.version += 1;
        stored.meta.file_size = bytes.len() as u64;
        stored.meta.last_modified_epoch_ms = epoch_ms();
        stored.data = bytes;
        let file = stored.meta.clone();
        store.notify(
            file.wspace_id,
            FileChangedData {
                change_type: FileChangeType::Update,
                file_id: id,
                file: Some(file.clone()),
            },
        );
        Ok(file)
    }

    async fn delete_file(&self, id: FileId) -> Result<(), DaoError> {
        let mut store = self.store.lock().await;
        let removed = store.files.remove(&id).ok_or(DaoError::NoSuchRow)?;
        store.notify(
            removed.meta.wspace_id,
            FileChangedData {
                change_type: FileChangeType::Delete,
                file_id: id,
                file: None,
            },
        );
        Ok(())
    }

    async fn rename_file(
        &self,
        id: FileId,
        version: i32,
        new_name: &str,
    ) -> Result<File, DaoError> {
        let mut store = self.store.lock().await;
        let wspace_id = store.file_mut(id)?.meta.wspace_id;
        let taken = store
            .files
            .values()
            .any(|f| f.meta.wspace_id == wspace_id && f.meta.id != id && f.meta.name == new_name);
        if taken {
            return Err(DaoError::QueryFailed(format!("{new_name} already exists")));
        }
        let stored = store.file_mut(id)?;
        if stored.meta.version != version {
            return Err(DaoError::VersionMismatch);
        }
        stored.meta.name = new_name.to_string();
        stored.meta.version += 1;
        stored.meta.last_modified_epoch_ms = epoch_ms();
        let file = stored.meta.clone();
        store.notify(
            wspace_id,
            FileChangedData {
                change_type: FileChangeType::Update,
                file_id: id,
                file: Some(file.clone()),
            },
        );
        Ok(file)
    }

    async fn duplicate_file(&self, id: FileId, new_name: &str) -> Result<File, DaoError> {
        let mut store = self.store.lock().await;
        let (wspace_id, data) = {
            let source = store.file_mut(id)?;
            (source.meta.wspace_id, source.data.clone())
        };
        let file = store.insert_file(wspace_id, new_name, data);
        store.notify(
            wspace_id,
            FileChangedData {
                change_type: FileChangeType::Insert,
                file_id: file.id,
                file: Some(file.clone()),
            },
        );
        Ok(file)
    }

    async fn get_images(&self, ids: &[ImageId]) -> Result<Vec<SessionImage>, DaoError> {
        let store = self.store.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| store.images.get(id).cloned())
            .collect())
    }

    async fn subscribe_file_changes(
        &self,
        wspace_id: WorkspaceId,
    ) -> Result<mpsc::Receiver<FileChangedData>, DaoError> {
        let (tx, rx) = mpsc::channel(FILE_CHANGE_BUFFER);
        self.store
            .lock()
            .await
            .watchers
            .entry(wspace_id)
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
