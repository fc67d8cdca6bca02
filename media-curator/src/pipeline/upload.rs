//! Object storage uploads and scoped deletes through the aws CLI.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use process_utils::{RunOutcome, run_captured, tokio_command};
use tracing::{debug, info, warn};

use super::drain::DrainGroup;
use super::events::EventBus;
use super::queue::{Admission, Outcome, QueueStats, TaskContext, TaskExecutor, WorkerQueue};
use super::task::{INTERNAL_ITEM_ID, ItemId, PipelineTask, Stage, TaskError, TaskId, TaskKind};
use crate::config::StorageConfig;
use crate::utils::fs::remove_file_if_exists;

/// Tool label used in error messages.
pub const AWS_TOOL: &str = "aws cli";

/// Well-known key of the bucket index.
pub const INDEX_KEY: &str = "index.json";

/// Well-known key of the category list.
pub const CATEGORIES_KEY: &str = "categories.json";

/// Key of the catalog owned by one category.
pub fn catalog_key(category_id: &str) -> String {
    format!("catalogs/{}.json", category_id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadAction {
    /// Copy a local file to `s3://<bucket>/<key>`.
    Copy { source: PathBuf, key: String },
    /// Delete exactly one remote object.
    Delete { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub item_id: ItemId,
    pub kind: TaskKind,
    pub bucket: String,
    pub action: UploadAction,
}

impl UploadTask {
    /// Plain media object upload.
    pub fn object(
        item_id: ItemId,
        source: impl Into<PathBuf>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            item_id,
            kind: TaskKind::Upload,
            bucket: bucket.into(),
            action: UploadAction::Copy {
                source: source.into(),
                key: key.into(),
            },
        }
    }

    fn manifest(kind: TaskKind, source: PathBuf, bucket: String, key: String) -> Self {
        debug_assert!(kind.is_manifest());
        Self {
            item_id: INTERNAL_ITEM_ID,
            kind,
            bucket,
            action: UploadAction::Copy { source, key },
        }
    }

    pub fn index(source: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self::manifest(
            TaskKind::IndexUpload,
            source.into(),
            bucket.into(),
            INDEX_KEY.to_string(),
        )
    }

    pub fn catalog(
        source: impl Into<PathBuf>,
        bucket: impl Into<String>,
        category_id: &str,
    ) -> Self {
        Self::manifest(
            TaskKind::CatalogUpload,
            source.into(),
            bucket.into(),
            catalog_key(category_id),
        )
    }

    pub fn categories(source: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self::manifest(
            TaskKind::CategoriesUpload,
            source.into(),
            bucket.into(),
            CATEGORIES_KEY.to_string(),
        )
    }

    /// Delete the catalog object owned by `category_id`, and nothing else.
    pub fn remote_delete(bucket: impl Into<String>, category_id: &str) -> Self {
        Self {
            item_id: INTERNAL_ITEM_ID,
            kind: TaskKind::RemoteDelete,
            bucket: bucket.into(),
            action: UploadAction::Delete {
                key: catalog_key(category_id),
            },
        }
    }

    pub fn key(&self) -> &str {
        match &self.action {
            UploadAction::Copy { key, .. } | UploadAction::Delete { key } => key,
        }
    }

    pub fn remote_url(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key())
    }

    /// Locally synthesized file this task owns, if any.
    fn owned_temp_file(&self) -> Option<&PathBuf> {
        match &self.action {
            UploadAction::Copy { source, .. } if self.kind.is_manifest() => Some(source),
            _ => None,
        }
    }

    /// Storage CLI arguments, with `--profile` only for a non-default profile.
    pub fn cli_args(&self, profile: Option<&str>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["s3".into()];
        match &self.action {
            UploadAction::Copy { source, .. } => {
                args.push("cp".into());
                args.push(source.clone().into());
            }
            UploadAction::Delete { .. } => args.push("rm".into()),
        }
        args.push(self.remote_url().into());
        if let Some(profile) = profile {
            args.push("--profile".into());
            args.push(profile.into());
        }
        args
    }
}

impl PipelineTask for UploadTask {
    fn item_id(&self) -> ItemId {
        self.item_id
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }
}

fn remove_temp_manifest(task: &UploadTask) {
    if let Some(path) = task.owned_temp_file() {
        match remove_file_if_exists(path) {
            Ok(_) => debug!("Removed temp manifest {}", path.display()),
            Err(e) => warn!("Failed to remove temp manifest {}: {}", path.display(), e),
        }
    }
}

pub struct UploadExecutor {
    aws_path: String,
    profile: Option<String>,
}

impl UploadExecutor {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            aws_path: config.aws_path.clone(),
            profile: config.effective_profile().map(str::to_string),
        }
    }
}

#[async_trait]
impl TaskExecutor for UploadExecutor {
    type Task = UploadTask;
    type Prepared = ();

    fn stage(&self) -> Stage {
        Stage::Upload
    }

    fn admit(&self, task: &UploadTask) -> Admission<()> {
        if task.bucket.trim().is_empty() {
            return Admission::Rejected(TaskError::filesystem(format!(
                "No bucket configured for {}",
                task.key()
            )));
        }
        if let UploadAction::Copy { source, .. } = &task.action
            && !source.is_file()
        {
            return Admission::Rejected(TaskError::filesystem(format!(
                "Input file does not exist: {}",
                source.display()
            )));
        }
        Admission::Start(())
    }

    async fn execute(&self, task: &UploadTask, _: (), ctx: &TaskContext) -> Outcome {
        let start = Instant::now();
        info!("Running {} for {}", task.kind, task.remote_url());

        let mut cmd = tokio_command(&self.aws_path);
        cmd.args(task.cli_args(self.profile.as_deref()));

        match run_captured(&mut cmd, ctx.cancellation()).await {
            Ok(RunOutcome::Exited(exit)) if exit.success() => {
                info!(
                    "{} {} finished in {:.2}s",
                    task.kind,
                    task.remote_url(),
                    start.elapsed().as_secs_f64()
                );
                remove_temp_manifest(task);
                Outcome::Succeeded(None)
            }
            Ok(RunOutcome::Exited(exit)) => Outcome::Failed(TaskError::from_exit(AWS_TOOL, &exit)),
            Ok(RunOutcome::Cancelled) => Outcome::Cancelled,
            Err(e) => Outcome::Failed(TaskError::from_run_error(AWS_TOOL, e)),
        }
    }

    async fn cleanup(&self, task: &UploadTask) {
        remove_temp_manifest(task);
    }

    fn discard(&self, task: &UploadTask) {
        remove_temp_manifest(task);
    }
}

/// Bounded pool of storage CLI processes.
#[derive(Clone)]
pub struct UploadPipeline {
    queue: WorkerQueue<UploadExecutor>,
}

impl UploadPipeline {
    pub fn new(config: &StorageConfig, bus: EventBus) -> Self {
        Self::with_parent(config, bus, None)
    }

    pub(crate) fn with_parent(
        config: &StorageConfig,
        bus: EventBus,
        parent: Option<Arc<DrainGroup>>,
    ) -> Self {
        Self {
            queue: WorkerQueue::new(
                UploadExecutor::new(config),
                config.max_concurrent,
                bus,
                parent,
            ),
        }
    }

    pub fn enqueue(&self, task: UploadTask) -> TaskId {
        self.queue.enqueue(task)
    }

    pub async fn cancel_all(&self) {
        self.queue.cancel_all().await;
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn is_drained(&self) -> bool {
        self.queue.is_drained()
    }
}
