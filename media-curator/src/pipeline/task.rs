//! Task identity, kinds and the per-task error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// External correlation key for a media item.
pub type ItemId = i64;

/// Item id carried by pipeline-internal artifacts such as manifests.
pub const INTERNAL_ITEM_ID: ItemId = -1;

/// Identity assigned to a task when it is enqueued. Unique within one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The pipeline a task runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Scale,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Download => write!(f, "download"),
            Stage::Scale => write!(f, "scale"),
            Stage::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Download,
    Scale,
    /// Plain media object upload.
    Upload,
    IndexUpload,
    CatalogUpload,
    CategoriesUpload,
    /// Scoped deletion of one remote object.
    RemoteDelete,
}

impl TaskKind {
    pub fn stage(self) -> Stage {
        match self {
            TaskKind::Download => Stage::Download,
            TaskKind::Scale => Stage::Scale,
            TaskKind::Upload
            | TaskKind::IndexUpload
            | TaskKind::CatalogUpload
            | TaskKind::CategoriesUpload
            | TaskKind::RemoteDelete => Stage::Upload,
        }
    }

    /// Manifest uploads own a locally synthesized temp file.
    pub fn is_manifest(self) -> bool {
        matches!(
            self,
            TaskKind::IndexUpload | TaskKind::CatalogUpload | TaskKind::CategoriesUpload
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Download => "download",
            TaskKind::Scale => "scale",
            TaskKind::Upload => "upload",
            TaskKind::IndexUpload => "index_upload",
            TaskKind::CatalogUpload => "catalog_upload",
            TaskKind::CategoriesUpload => "categories_upload",
            TaskKind::RemoteDelete => "remote_delete",
        };
        f.write_str(name)
    }
}

/// Media type of an item; selects the transcoder filter graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Image,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }
}

/// Common view over every task type a queue can hold.
pub trait PipelineTask: fmt::Debug + Send + Sync + 'static {
    fn item_id(&self) -> ItemId;
    fn kind(&self) -> TaskKind;
}

/// Why a task failed. Reported once per task through a `TaskFailed` event.
///
/// Cancellation has no variant: cancelled work emits nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The external executable could not be spawned because it is missing.
    #[error("{tool} not found. Please install {tool}.")]
    ToolNotFound { tool: String },

    /// The external process ran and failed.
    #[error("{tool} failed: {message}")]
    ProcessFailed {
        tool: String,
        code: Option<i32>,
        /// Captured stderr, or the exit code when stderr was empty.
        message: String,
    },

    #[error("Download failed: {0}")]
    TransferFailed(String),

    #[error("{0}")]
    Filesystem(String),
}

impl TaskError {
    pub fn filesystem(msg: impl Into<String>) -> Self {
        Self::Filesystem(msg.into())
    }

    /// Map a spawn-level failure from the process runner.
    pub fn from_run_error(tool: &str, err: process_utils::RunError) -> Self {
        match err {
            process_utils::RunError::NotFound { .. } => Self::ToolNotFound {
                tool: tool.to_string(),
            },
            other => Self::ProcessFailed {
                tool: tool.to_string(),
                code: None,
                message: other.to_string(),
            },
        }
    }

    /// Map a finished-but-unsuccessful process.
    pub fn from_exit(tool: &str, exit: &process_utils::CapturedExit) -> Self {
        Self::ProcessFailed {
            tool: tool.to_string(),
            code: exit.code(),
            message: exit.diagnostic(),
        }
    }

    pub fn is_tool_not_found(&self) -> bool {
        matches!(self, Self::ToolNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_stage_mapping() {
        assert_eq!(TaskKind::Download.stage(), Stage::Download);
        assert_eq!(TaskKind::Scale.stage(), Stage::Scale);
        for kind in [
            TaskKind::Upload,
            TaskKind::IndexUpload,
            TaskKind::CatalogUpload,
            TaskKind::CategoriesUpload,
            TaskKind::RemoteDelete,
        ] {
            assert_eq!(kind.stage(), Stage::Upload);
        }
    }

    #[test]
    fn test_manifest_kinds() {
        assert!(TaskKind::IndexUpload.is_manifest());
        assert!(TaskKind::CatalogUpload.is_manifest());
        assert!(TaskKind::CategoriesUpload.is_manifest());
        assert!(!TaskKind::Upload.is_manifest());
        assert!(!TaskKind::RemoteDelete.is_manifest());
    }

    #[test]
    fn test_tool_not_found_message() {
        let err = TaskError::from_run_error(
            "ffmpeg",
            process_utils::RunError::NotFound {
                program: "/usr/bin/ffmpeg".to_string(),
            },
        );
        assert!(err.is_tool_not_found());
        assert_eq!(err.to_string(), "ffmpeg not found. Please install ffmpeg.");
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(7).to_string(), "#7");
    }
}
