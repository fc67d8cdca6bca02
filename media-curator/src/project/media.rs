//! Media item metadata and its derived file names.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::pipeline::{ItemId, MediaKind};
use crate::utils::filename::{author_tag, sanitize_filename};

/// One downloadable rendition of a video.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaFile {
    pub width: u32,
    pub height: u32,
    pub quality: String,
    pub link: String,
}

impl MediaFile {
    fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// A candidate asset tracked by a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaItem {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub id: ItemId,
    /// Seconds; 0 for images.
    pub duration: u32,
    pub width: u32,
    pub height: u32,
    pub author: String,
    pub author_url: String,
    pub source_url: String,
    pub thumbnail_url: String,
    #[serde(with = "empty_as_none")]
    pub local_raw_path: Option<PathBuf>,
    #[serde(with = "empty_as_none")]
    pub local_scaled_path: Option<PathBuf>,
    pub is_rejected: bool,
    pub is_downloaded: bool,
    pub is_scaled: bool,
    pub is_uploaded: bool,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub preview_video_url: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media_files: Vec<MediaFile>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub original_image_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub large_image_url: String,
}

impl MediaItem {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Largest rendition no wider than `max_width`, else the smallest one.
    pub fn best_media_file(&self, max_width: u32) -> Option<&MediaFile> {
        let mut best: Option<&MediaFile> = None;
        for file in self.media_files.iter().filter(|f| f.width <= max_width) {
            if best.is_none_or(|b| file.area() > b.area()) {
                best = Some(file);
            }
        }
        if best.is_some() {
            return best;
        }

        let mut smallest: Option<&MediaFile> = None;
        for file in &self.media_files {
            if smallest.is_none_or(|s| file.area() < s.area()) {
                smallest = Some(file);
            }
        }
        smallest
    }

    /// URL to fetch: large image (else original) for photos, best rendition for videos.
    pub fn download_url(&self, max_width: u32) -> Option<Url> {
        let raw = match self.kind {
            MediaKind::Image if !self.large_image_url.is_empty() => self.large_image_url.as_str(),
            MediaKind::Image => self.original_image_url.as_str(),
            MediaKind::Video => self.best_media_file(max_width)?.link.as_str(),
        };
        if raw.is_empty() {
            return None;
        }
        Url::parse(raw).ok()
    }

    pub fn file_extension(&self) -> &'static str {
        match self.kind {
            MediaKind::Image => ".jpg",
            MediaKind::Video => ".mp4",
        }
    }

    /// `<id>_<author>_<duration>s.mp4` for videos, `<id>_<author>.jpg` for photos.
    pub fn raw_file_name(&self) -> String {
        let name = match self.kind {
            MediaKind::Video => format!(
                "{}_{}_{}s{}",
                self.id,
                author_tag(&self.author),
                self.duration,
                self.file_extension()
            ),
            MediaKind::Image => format!(
                "{}_{}{}",
                self.id,
                author_tag(&self.author),
                self.file_extension()
            ),
        };
        sanitize_filename(&name)
    }

    /// Scaled output name: the raw file's stem with this item's extension.
    pub fn scaled_file_name(&self) -> String {
        let raw = self
            .local_raw_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.raw_file_name());
        let stem = Path::new(&raw)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(raw);
        format!("{}{}", stem, self.file_extension())
    }

    /// True when the scaled output is recorded and present on disk.
    pub fn scaled_file_exists(&self) -> bool {
        self.local_scaled_path.as_deref().is_some_and(Path::is_file)
    }

    pub fn raw_file_exists(&self) -> bool {
        self.local_raw_path.as_deref().is_some_and(Path::is_file)
    }
}

/// Paths persist as plain strings where "" means unset.
mod empty_as_none {
    use std::path::PathBuf;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(path) => s.serialize_str(&path.to_string_lossy()),
            None => s.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PathBuf>, D::Error> {
        let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
        Ok((!raw.is_empty()).then(|| PathBuf::from(raw)))
    }
}
