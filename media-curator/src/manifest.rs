//! Manifest documents published next to the media objects.
//!
//! - `index.json`: content prefixes with a pointer to each category catalog.
//! - `catalogs/<category>.json`: one entry per publishable media item.
//! - `categories.json`: every known category, kept locally and re-uploaded.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::upload::catalog_key;
use crate::pipeline::{ItemId, MediaKind};
use crate::project::MediaItem;
use crate::utils::fs::{ensure_dir_all, file_size, io_error};
use crate::Result;

/// Timestamp layout of `updated_utc`.
pub const UPDATED_UTC_FORMAT: &str = "%Y-%m-%dT%H.%M.%SZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub updated_utc: String,
    pub prefixes: Vec<IndexPrefix>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPrefix {
    pub prefix: String,
    pub name: String,
    pub description: String,
    pub catalog: String,
}

impl IndexManifest {
    pub fn new(
        category_id: &str,
        project_name: &str,
        media_prefix: &str,
        (width, height): (u32, u32),
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            updated_utc: now.format(UPDATED_UTC_FORMAT).to_string(),
            prefixes: vec![IndexPrefix {
                prefix: media_prefix.to_string(),
                name: project_name.to_string(),
                description: format!("{}x{} cropped, production-ready media", width, height),
                catalog: catalog_key(category_id),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Scaled file name, relative to the media prefix.
    pub path: String,
    pub author: String,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<u32>,
}

/// Catalog entries for every non-rejected item whose scaled file is on disk.
pub fn build_catalog(media: &[MediaItem]) -> Vec<CatalogEntry> {
    media
        .iter()
        .filter(|item| !item.is_rejected && item.scaled_file_exists())
        .filter_map(|item| {
            let scaled = item.local_scaled_path.as_deref()?;
            let bytes = file_size(scaled)?;
            let path = scaled.file_name()?.to_string_lossy().into_owned();
            Some(CatalogEntry {
                id: item.id,
                kind: item.kind,
                path,
                author: item.author.clone(),
                bytes,
                duration_s: item.is_video().then_some(item.duration),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
}

/// The category list shared by all projects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryList {
    pub categories: Vec<Category>,
}

impl CategoryList {
    /// Read a local `categories.json`. A missing or malformed file yields an empty list.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(io_error("reading categories", path, e)),
        };
        match serde_json::from_str(&raw) {
            Ok(list) => Ok(list),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| io_error("writing categories", path, e))
    }

    /// Insert or rename the category with this id.
    pub fn upsert(&mut self, id: &str, name: &str) {
        match self.categories.iter_mut().find(|c| c.id == id) {
            Some(existing) => existing.name = name.to_string(),
            None => self.categories.push(Category {
                id: id.to_string(),
                name: name.to_string(),
            }),
        }
    }

    /// Returns whether an entry was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.categories.len();
        self.categories.retain(|c| c.id != id);
        self.categories.len() != before
    }

    pub fn get(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Write `doc` as pretty JSON to a fresh, uniquely named file in `dir`.
///
/// Every call gets its own path, so two batches of manifest uploads can be in
/// flight without overwriting each other's source file.
pub async fn write_temp_manifest<T: Serialize>(dir: &Path, stem: &str, doc: &T) -> Result<PathBuf> {
    ensure_dir_all(dir).await?;
    let path = dir.join(format!("{}-{}.json", stem, Uuid::new_v4()));
    let json = serde_json::to_string_pretty(doc)?;
    tokio::fs::write(&path, json)
        .await
        .map_err(|e| io_error("writing manifest", &path, e))?;
    debug!("Wrote temp manifest {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_index_manifest_shape() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let index = IndexManifest::new("espresso", "Espresso Shots", "media/", (1280, 800), now);
        let json = serde_json::to_value(&index).unwrap();

        assert_eq!(json["updated_utc"], "2024-03-09T07.05.01Z");
        let prefix = &json["prefixes"][0];
        assert_eq!(prefix["prefix"], "media/");
        assert_eq!(prefix["name"], "Espresso Shots");
        assert_eq!(
            prefix["description"],
            "1280x800 cropped, production-ready media"
        );
        assert_eq!(prefix["catalog"], "catalogs/espresso.json");
    }

    #[test]
    fn test_catalog_entry_omits_duration_for_images() {
        let entry = CatalogEntry {
            id: 2,
            kind: MediaKind::Image,
            path: "2_x.jpg".to_string(),
            author: "x".to_string(),
            bytes: 10,
            duration_s: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "image");
        assert!(json.get("duration_s").is_none());
    }

    #[test]
    fn test_build_catalog_round_trip() {
        let dir = TempDir::new().unwrap();
        let clip = dir.path().join("1_a_9s.mp4");
        let photo = dir.path().join("2_b.jpg");
        std::fs::write(&clip, b"12345").unwrap();
        std::fs::write(&photo, b"12").unwrap();

        let media = vec![
            MediaItem {
                kind: MediaKind::Video,
                id: 1,
                duration: 9,
                author: "a".to_string(),
                local_scaled_path: Some(clip),
                ..MediaItem::default()
            },
            MediaItem {
                kind: MediaKind::Image,
                id: 2,
                author: "b".to_string(),
                local_scaled_path: Some(photo),
                ..MediaItem::default()
            },
        ];

        let catalog = build_catalog(&media);
        assert_eq!(catalog[0].bytes, 5);
        assert_eq!(catalog[0].duration_s, Some(9));
        assert_eq!(catalog[1].duration_s, None);

        let json = serde_json::to_string(&catalog).unwrap();
        let parsed: Vec<CatalogEntry> = serde_json::from_str(&json).unwrap();
        let pairs: Vec<_> = parsed.iter().map(|e| (e.id, e.path.as_str())).collect();
        assert_eq!(pairs, vec![(1, "1_a_9s.mp4"), (2, "2_b.jpg")]);
    }

    #[test]
    fn test_catalog_skips_rejected_and_missing_files() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("3_c.jpg");
        std::fs::write(&present, b"abc").unwrap();
        let rejected_file = dir.path().join("1_a.jpg");
        std::fs::write(&rejected_file, b"abc").unwrap();

        let media = vec![
            MediaItem {
                kind: MediaKind::Image,
                id: 1,
                is_rejected: true,
                local_scaled_path: Some(rejected_file),
                ..MediaItem::default()
            },
            MediaItem {
                kind: MediaKind::Image,
                id: 2,
                local_scaled_path: Some(dir.path().join("2_b.jpg")),
                ..MediaItem::default()
            },
            MediaItem {
                kind: MediaKind::Image,
                id: 3,
                local_scaled_path: Some(present),
                ..MediaItem::default()
            },
        ];

        let catalog = build_catalog(&media);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].id, 3);
        assert_eq!(catalog[0].path, "3_c.jpg");
    }

    #[test]
    fn test_category_upsert_and_remove() {
        let mut list = CategoryList::default();
        list.upsert("espresso", "Espresso");
        list.upsert("latte", "Latte");
        list.upsert("espresso", "Espresso Shots");

        assert_eq!(list.len(), 2);
        assert_eq!(list.get("espresso").unwrap().name, "Espresso Shots");
        assert!(list.remove("latte"));
        assert!(!list.remove("latte"));
        assert_eq!(
            serde_json::to_string(&list).unwrap(),
            r#"[{"id":"espresso","name":"Espresso Shots"}]"#
        );
    }

    #[tokio::test]
    async fn test_category_list_load_tolerates_missing_and_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("categories.json");
        assert!(CategoryList::load(&path).await.unwrap().is_empty());

        std::fs::write(&path, r#"{"not": "an array"}"#).unwrap();
        assert!(CategoryList::load(&path).await.unwrap().is_empty());

        let mut list = CategoryList::default();
        list.upsert("a", "A");
        list.save(&path).await.unwrap();
        assert_eq!(CategoryList::load(&path).await.unwrap(), list);
    }

    #[tokio::test]
    async fn test_temp_manifests_never_collide() {
        let dir = TempDir::new().unwrap();
        let a = write_temp_manifest(dir.path(), "index", &serde_json::json!({})).await.unwrap();
        let b = write_temp_manifest(dir.path(), "index", &serde_json::json!({})).await.unwrap();
        assert_ne!(a, b);
        assert!(a.is_file() && b.is_file());
    }
}
