//! Persisted project state.
//!
//! A project lives in `<projects_dir>/<name>/` and holds a `project.json`
//! document plus the `raw/` and `scaled/` working directories.

mod media;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use media::{MediaFile, MediaItem};

use crate::pipeline::ItemId;
use crate::utils::filename::sanitize_filename;
use crate::utils::fs::{ensure_dir_all, io_error, with_suffix};
use crate::{Error, Result};

pub const PROJECT_FILE: &str = "project.json";

/// The only document version this crate reads and writes.
pub const PROJECT_VERSION: u32 = 2;

const RAW_DIR: &str = "raw";
const SCALED_DIR: &str = "scaled";

fn default_min_duration() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub version: u32,
    pub name: String,
    /// Directory the project was loaded from; not persisted.
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub category_id: String,
    #[serde(default)]
    pub search_query: String,
    #[serde(default = "default_min_duration")]
    pub min_duration: u32,
    #[serde(default)]
    pub rejected_ids: BTreeSet<ItemId>,
    #[serde(default)]
    pub media: Vec<MediaItem>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        s3_bucket: impl Into<String>,
        category_id: impl Into<String>,
    ) -> Self {
        Self {
            version: PROJECT_VERSION,
            name: name.into(),
            path: path.into(),
            s3_bucket: s3_bucket.into(),
            category_id: category_id.into(),
            search_query: String::new(),
            min_duration: default_min_duration(),
            rejected_ids: BTreeSet::new(),
            media: Vec::new(),
        }
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.path.join(RAW_DIR)
    }

    pub fn scaled_dir(&self) -> PathBuf {
        self.path.join(SCALED_DIR)
    }

    pub fn file_path(&self) -> PathBuf {
        self.path.join(PROJECT_FILE)
    }

    /// Add new items, skipping ids already present. Remembered rejections are
    /// re-applied. Returns how many items were added.
    pub fn add_media(&mut self, items: impl IntoIterator<Item = MediaItem>) -> usize {
        let mut added = 0;
        for mut item in items {
            if self.media.iter().any(|m| m.id == item.id) {
                continue;
            }
            item.is_rejected = self.rejected_ids.contains(&item.id);
            self.media.push(item);
            added += 1;
        }
        added
    }

    /// Remember `id` as rejected and flag the item if present.
    pub fn reject_media(&mut self, id: ItemId) {
        self.rejected_ids.insert(id);
        if let Some(item) = self.item_mut(id) {
            item.is_rejected = true;
        }
    }

    /// Forget every item, remembered rejection and the search query. Files on
    /// disk and the project's settings are kept.
    pub fn reset(&mut self) -> usize {
        let cleared = self.media.len();
        self.media.clear();
        self.rejected_ids.clear();
        self.search_query.clear();
        cleared
    }

    pub fn item(&self, id: ItemId) -> Option<&MediaItem> {
        self.media.iter().find(|m| m.id == id)
    }

    pub fn item_mut(&mut self, id: ItemId) -> Option<&mut MediaItem> {
        self.media.iter_mut().find(|m| m.id == id)
    }

    fn apply_rejections(&mut self) {
        for item in &mut self.media {
            item.is_rejected = self.rejected_ids.contains(&item.id);
        }
    }
}

/// Reads and writes projects under one root directory.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
    default_bucket: String,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>, default_bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            default_bucket: default_bucket.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a project named `name` lives in.
    pub fn project_dir(&self, name: &str) -> PathBuf {
        self.root.join(sanitize_filename(name))
    }

    /// Create a new project with empty `raw/` and `scaled/` directories.
    pub async fn create(&self, name: &str, category_id: &str) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(Error::validation("project name must not be empty"));
        }
        if category_id.trim().is_empty() {
            return Err(Error::validation("category id must not be empty"));
        }

        let dir = self.project_dir(name);
        if tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| io_error("checking project directory", &dir, e))?
        {
            return Err(Error::validation(format!(
                "project already exists: {}",
                dir.display()
            )));
        }

        let project = Project::new(name, &dir, self.default_bucket.clone(), category_id);
        ensure_dir_all(&project.raw_dir()).await?;
        ensure_dir_all(&project.scaled_dir()).await?;
        self.save(&project).await?;

        info!("Created project {} at {}", name, dir.display());
        Ok(project)
    }

    /// Load a project from `path`, or from `<root>/<path>` when `path` is a bare name.
    pub async fn open(&self, name_or_path: &str) -> Result<Project> {
        let direct = PathBuf::from(name_or_path);
        if tokio::fs::try_exists(direct.join(PROJECT_FILE))
            .await
            .unwrap_or(false)
        {
            return self.load(&direct).await;
        }
        self.load(&self.project_dir(name_or_path)).await
    }

    pub async fn load(&self, dir: &Path) -> Result<Project> {
        let file = dir.join(PROJECT_FILE);
        let raw = match tokio::fs::read_to_string(&file).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("project", dir.display().to_string()));
            }
            Err(e) => return Err(io_error("reading project", &file, e)),
        };

        let mut project: Project = serde_json::from_str(&raw)?;
        if project.version != PROJECT_VERSION {
            return Err(Error::validation(format!(
                "unsupported project version {} in {}",
                project.version,
                file.display()
            )));
        }
        project.path = dir.to_path_buf();
        if project.s3_bucket.is_empty() {
            project.s3_bucket = self.default_bucket.clone();
        }
        project.apply_rejections();

        debug!(
            "Loaded project {} ({} items)",
            project.name,
            project.media.len()
        );
        Ok(project)
    }

    /// Write `project.json` through a sibling temp file.
    pub async fn save(&self, project: &Project) -> Result<()> {
        let file = project.file_path();
        let tmp = with_suffix(&file, ".tmp");
        let json = serde_json::to_string_pretty(project)?;

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| io_error("writing project", &tmp, e))?;
        tokio::fs::rename(&tmp, &file)
            .await
            .map_err(|e| io_error("replacing project", &file, e))?;
        Ok(())
    }

    pub async fn delete(&self, dir: &Path) -> Result<()> {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| io_error("deleting project", dir, e))?;
        info!("Deleted project at {}", dir.display());
        Ok(())
    }

    /// Directories under the root that contain a `project.json`, sorted.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("listing projects", &self.root, e)),
        };

        let mut projects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("listing projects", &self.root, e))?
        {
            let path = entry.path();
            if path.join(PROJECT_FILE).is_file() {
                projects.push(path);
            }
        }
        projects.sort();
        Ok(projects)
    }
}
