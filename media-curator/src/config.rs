//! Application configuration.
//!
//! A single [`AppConfig`] value is built at startup (JSON file, then
//! environment overrides) and handed to the components that need it. Every
//! pipeline receives only its own section.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Default concurrency for every pipeline.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// User agent sent with every media download.
pub const DEFAULT_USER_AGENT: &str = "MediaCurator/1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory holding one sub-directory per project.
    pub projects_dir: PathBuf,
    /// Where manifest documents are staged before upload.
    pub temp_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Optional tracing filter directive (overridden by `RUST_LOG`).
    pub log_filter: Option<String>,
    pub download: DownloadConfig,
    pub transcode: TranscodeConfig,
    pub storage: StorageConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("./projects"),
            temp_dir: std::env::temp_dir(),
            log_dir: PathBuf::from("./logs"),
            log_filter: None,
            download: DownloadConfig::default(),
            transcode: TranscodeConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub user_agent: String,
    pub max_concurrent: usize,
    /// Widest rendition picked when an item offers several video files.
    pub max_width: u32,
    /// Connect timeout for the HTTP client; transfers themselves never time out.
    pub connect_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_width: 1920,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub ffmpeg_path: String,
    pub target_width: u32,
    pub target_height: u32,
    /// x264 constant rate factor (0-51, lower is better).
    pub crf: u32,
    /// x264 speed/quality preset.
    pub preset: String,
    pub max_concurrent: usize,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            target_width: 1280,
            target_height: 800,
            crf: 22,
            preset: "slow".to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub aws_path: String,
    /// Bucket assigned to newly created projects.
    pub bucket: String,
    /// Credential profile; `default` (or empty) means no `--profile` flag.
    pub profile: String,
    pub max_concurrent: usize,
    /// Key prefix for uploaded media objects.
    pub media_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            aws_path: "aws".to_string(),
            bucket: String::new(),
            profile: "default".to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            media_prefix: "media/".to_string(),
        }
    }
}

impl StorageConfig {
    /// Profile to pass through to the storage CLI, if any.
    pub fn effective_profile(&self) -> Option<&str> {
        let profile = self.profile.trim();
        if profile.is_empty() || profile == "default" {
            None
        } else {
            Some(profile)
        }
    }
}

impl AppConfig {
    /// Load from an optional JSON file, apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MEDIA_CURATOR_PROJECTS_DIR") {
            self.projects_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MEDIA_CURATOR_TEMP_DIR") {
            self.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MEDIA_CURATOR_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FFMPEG_PATH") {
            self.transcode.ffmpeg_path = v;
        }
        if let Some(v) = lookup("AWS_CLI_PATH") {
            self.storage.aws_path = v;
        }
        if let Some(v) = lookup("AWS_PROFILE") {
            self.storage.profile = v;
        }
        if let Some(v) = lookup("MEDIA_BUCKET") {
            self.storage.bucket = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent == 0
            || self.transcode.max_concurrent == 0
            || self.storage.max_concurrent == 0
        {
            return Err(Error::config("max_concurrent must be at least 1"));
        }
        if self.transcode.target_width == 0 || self.transcode.target_height == 0 {
            return Err(Error::config("target size must be non-zero"));
        }
        if self.transcode.crf > 51 {
            return Err(Error::config(format!(
                "crf {} is outside 0..=51",
                self.transcode.crf
            )));
        }
        if self.transcode.preset.trim().is_empty() {
            return Err(Error::config("transcode preset must not be empty"));
        }
        Ok(())
    }

    /// Local `categories.json` shared by every project.
    pub fn categories_path(&self) -> PathBuf {
        self.projects_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join("categories.json")
    }
}
