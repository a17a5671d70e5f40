use std::fs;
use std::io::{self, Write};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::Builder;
use tracing::{debug, warn};

use crate::domain::{Project, ProjectId};
use crate::error::VaultError;

pub const DESCRIPTOR_FILE: &str = "project.json";
pub const VIEWER_FILE: &str = "index.html";

/// Directory-per-project artifact store rooted at the configured data root.
///
/// ```text
/// <root>/converted/<project-id>/project.json   descriptor (visibility marker)
/// <root>/converted/<project-id>/index.html     viewer entry document
/// <root>/uploads/                              staging scratch area
/// <root>/records/<name>.json                   single-row records (demo pointer)
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

/// A project directory that has no descriptor: an in-flight or abandoned conversion.
#[derive(Debug, Clone)]
pub struct OrphanDir {
    pub id: ProjectId,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectScan {
    pub projects: Vec<Project>,
    pub orphans: Vec<OrphanDir>,
    pub unreadable: usize,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn projects_root(&self) -> Utf8PathBuf {
        self.root.join("converted")
    }

    pub fn scratch_root(&self) -> Utf8PathBuf {
        self.root.join("uploads")
    }

    pub fn project_dir(&self, id: &ProjectId) -> Utf8PathBuf {
        self.projects_root().join(id.as_str())
    }

    pub fn descriptor_path(&self, id: &ProjectId) -> Utf8PathBuf {
        self.project_dir(id).join(DESCRIPTOR_FILE)
    }

    pub fn viewer_path(&self, id: &ProjectId) -> Utf8PathBuf {
        self.project_dir(id).join(VIEWER_FILE)
    }

    pub fn record_path(&self, name: &str) -> Utf8PathBuf {
        self.root.join("records").join(format!("{name}.json"))
    }

    pub fn ensure_scratch(&self) -> Result<Utf8PathBuf, VaultError> {
        let scratch = self.scratch_root();
        fs::create_dir_all(scratch.as_std_path())
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        Ok(scratch)
    }

    /// Creates the directory for a freshly allocated id. Fails if it already exists.
    pub fn create_project_dir(&self, id: &ProjectId) -> Result<Utf8PathBuf, VaultError> {
        fs::create_dir_all(self.projects_root().as_std_path())
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        let dir = self.project_dir(id);
        fs::create_dir(dir.as_std_path())
            .map_err(|err| VaultError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    pub fn project_dir_exists(&self, id: &ProjectId) -> bool {
        self.project_dir(id).as_std_path().is_dir()
    }

    pub fn remove_project_dir(&self, id: &ProjectId) -> Result<(), VaultError> {
        let dir = self.project_dir(id);
        match fs::remove_dir_all(dir.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VaultError::Filesystem(format!("remove {dir}: {err}"))),
        }
    }

    /// Reads a project descriptor. `Ok(None)` means the project is not visible.
    pub fn read_descriptor(&self, id: &ProjectId) -> Result<Option<Project>, VaultError> {
        let path = self.descriptor_path(id);
        let Some(project) = read_json::<Project>(&path)? else {
            return Ok(None);
        };
        if &project.id != id {
            return Err(VaultError::Filesystem(format!(
                "descriptor at {path} names project {}",
                project.id
            )));
        }
        Ok(Some(project))
    }

    /// Writes the descriptor into an existing project directory. Fails when
    /// the directory has been removed, so a deleted project is never revived.
    pub fn write_descriptor(&self, project: &Project) -> Result<(), VaultError> {
        let content = serde_json::to_vec_pretty(project)
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        Self::replace_file(&self.descriptor_path(&project.id), &content)
    }

    pub fn read_record<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, VaultError> {
        read_json(&self.record_path(name))
    }

    pub fn write_record<T: Serialize>(&self, name: &str, value: &T) -> Result<(), VaultError> {
        Self::write_json_atomic(&self.record_path(name), value)
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), VaultError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    /// Writes through a sibling temp file and renames it over `path`, so readers
    /// see either the old content or the new content.
    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), VaultError> {
        let parent = path
            .parent()
            .ok_or_else(|| VaultError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        Self::replace_file(path, content)
    }

    /// Like [`Store::write_bytes_atomic`] but never creates the parent directory.
    pub fn replace_file(path: &Utf8Path, content: &[u8]) -> Result<(), VaultError> {
        let parent = path
            .parent()
            .ok_or_else(|| VaultError::Filesystem(format!("invalid destination path {path}")))?;
        let mut temp = Builder::new()
            .prefix(".pcvault-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| VaultError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Walks every project directory. Corrupt descriptors are counted and skipped.
    pub fn scan(&self) -> Result<ProjectScan, VaultError> {
        let root = self.projects_root();
        let mut scan = ProjectScan::default();
        let entries = match fs::read_dir(root.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(scan),
            Err(err) => return Err(VaultError::Filesystem(err.to_string())),
        };

        for entry in entries {
            let entry = entry.map_err(|err| VaultError::Filesystem(err.to_string()))?;
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|name| name.parse::<ProjectId>().ok()) else {
                debug!(entry = ?name, "ignoring non-project directory");
                continue;
            };

            match self.read_descriptor(&id) {
                Ok(Some(project)) => scan.projects.push(project),
                Ok(None) => {
                    let modified = entry.metadata().and_then(|meta| meta.modified()).ok();
                    scan.orphans.push(OrphanDir { id, modified });
                }
                Err(err) => {
                    warn!(project_id = %id, error = %err, "skipping unreadable descriptor");
                    scan.unreadable += 1;
                }
            }
        }
        Ok(scan)
    }

    /// Visible projects, newest first.
    pub fn list_projects(&self) -> Result<Vec<Project>, VaultError> {
        let mut projects = self.scan()?.projects;
        projects.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(projects)
    }

    /// Removes descriptor-less directories not touched for at least `grace`.
    pub fn sweep_orphans(
        &self,
        grace: Duration,
        now: SystemTime,
    ) -> Result<Vec<ProjectId>, VaultError> {
        let mut removed = Vec::new();
        for orphan in self.scan()?.orphans {
            let age = orphan
                .modified
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < grace {
                continue;
            }
            // A descriptor may have landed since the scan.
            if self.descriptor_path(&orphan.id).as_std_path().exists() {
                continue;
            }
            self.remove_project_dir(&orphan.id)?;
            removed.push(orphan.id);
        }
        Ok(removed)
    }
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, VaultError> {
    let content = match fs::read_to_string(path.as_std_path()) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(VaultError::Filesystem(format!("read {path}: {err}"))),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| VaultError::Filesystem(format!("parse {path}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn layout_paths() {
        let store = Store::new(Utf8PathBuf::from("/srv/vault"));
        let id: ProjectId = "5f0c6c1e-8a43-4c57-9b7e-2f7f3f1d9a10".parse().unwrap();

        assert!(
            store
                .descriptor_path(&id)
                .ends_with("converted/5f0c6c1e-8a43-4c57-9b7e-2f7f3f1d9a10/project.json")
        );
        assert!(store.scratch_root().ends_with("uploads"));
        assert!(store.record_path("demo").ends_with("records/demo.json"));
    }

    #[test]
    fn directory_without_descriptor_is_invisible() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        let pending = ProjectId::generate();
        store.create_project_dir(&pending).unwrap();

        let done = ProjectId::generate();
        store.create_project_dir(&done).unwrap();
        let project = Project::new(
            done.clone(),
            "U1".parse().unwrap(),
            "scan.las".to_string(),
            10,
            Utc::now(),
            "/data/converted",
        );
        store.write_descriptor(&project).unwrap();

        let scan = store.scan().unwrap();
        assert_eq!(scan.projects.len(), 1);
        assert_eq!(scan.projects[0].id, done);
        assert_eq!(scan.orphans.len(), 1);
        assert_eq!(scan.orphans[0].id, pending);
    }

    #[test]
    fn corrupt_descriptor_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        let id = ProjectId::generate();
        store.create_project_dir(&id).unwrap();
        fs::write(store.descriptor_path(&id).as_std_path(), b"{ not json").unwrap();

        let scan = store.scan().unwrap();
        assert!(scan.projects.is_empty());
        assert!(scan.orphans.is_empty());
        assert_eq!(scan.unreadable, 1);
    }

    #[test]
    fn descriptor_write_requires_project_dir() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        let id = ProjectId::generate();
        let project = Project::new(
            id.clone(),
            "U1".parse().unwrap(),
            "scan.las".to_string(),
            10,
            Utc::now(),
            "/data/converted",
        );

        assert!(store.write_descriptor(&project).is_err());
        assert!(!store.project_dir_exists(&id));
    }

    #[test]
    fn create_project_dir_refuses_existing() {
        let temp = tempfile::tempdir().unwrap();
        let store = Store::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        let id = ProjectId::generate();
        store.create_project_dir(&id).unwrap();
        assert!(store.create_project_dir(&id).is_err());
    }
}
