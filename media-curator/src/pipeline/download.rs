//! HTTP downloads streamed into `<dest>.part` and renamed into place.

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::events::EventBus;
use super::queue::{Admission, Outcome, QueueStats, TaskContext, TaskExecutor, WorkerQueue};
use super::task::{ItemId, PipelineTask, Stage, TaskError, TaskId, TaskKind};
use crate::Result;
use crate::config::DownloadConfig;
use crate::utils::fs::{cleanup_partial_output, ensure_parent_dir_sync, remove_file_if_exists, with_suffix};
use crate::utils::http_client::build_download_client;

const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub item_id: ItemId,
    pub url: Url,
    pub dest: PathBuf,
}

impl DownloadTask {
    pub fn new(item_id: ItemId, url: Url, dest: impl Into<PathBuf>) -> Self {
        Self {
            item_id,
            url,
            dest: dest.into(),
        }
    }

    /// Temporary sibling the body is streamed into.
    pub fn part_path(&self) -> PathBuf {
        with_suffix(&self.dest, PART_SUFFIX)
    }
}

impl PipelineTask for DownloadTask {
    fn item_id(&self) -> ItemId {
        self.item_id
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Download
    }
}

/// Temp file opened at admission time.
#[derive(Debug)]
pub struct PartFile {
    file: File,
    path: PathBuf,
}

enum TransferStop {
    Cancelled,
    Failed(TaskError),
}

pub struct DownloadExecutor {
    client: reqwest::Client,
}

impl DownloadExecutor {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        Ok(Self {
            client: build_download_client(config)?,
        })
    }

    async fn transfer(
        &self,
        task: &DownloadTask,
        file: &mut tokio::fs::File,
        ctx: &TaskContext,
    ) -> std::result::Result<u64, TransferStop> {
        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(TransferStop::Cancelled),
            response = self.client.get(task.url.clone()).send() => response,
        };
        let response = response
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransferStop::Failed(TaskError::TransferFailed(e.to_string())))?;

        let total = response.content_length().unwrap_or(0);
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => return Err(TransferStop::Cancelled),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(TransferStop::Failed(TaskError::TransferFailed(e.to_string())));
                }
            };
            file.write_all(&chunk).await.map_err(|e| {
                TransferStop::Failed(TaskError::filesystem(format!(
                    "Failed to write {}: {}",
                    task.part_path().display(),
                    e
                )))
            })?;
            received += chunk.len() as u64;
            ctx.report_progress(received, total);
        }

        file.flush().await.map_err(|e| {
            TransferStop::Failed(TaskError::filesystem(format!(
                "Failed to flush {}: {}",
                task.part_path().display(),
                e
            )))
        })?;
        Ok(received)
    }
}

/// Replace whatever sits at `dest` with the finished temp file.
fn promote(part: &Path, dest: &Path) -> std::result::Result<(), TaskError> {
    remove_file_if_exists(dest)
        .and_then(|_| std::fs::rename(part, dest))
        .map_err(|e| TaskError::filesystem(format!("Failed to rename downloaded file: {}", e)))
}

#[async_trait]
impl TaskExecutor for DownloadExecutor {
    type Task = DownloadTask;
    type Prepared = PartFile;

    fn stage(&self) -> Stage {
        Stage::Download
    }

    fn admit(&self, task: &DownloadTask) -> Admission<PartFile> {
        if let Err(e) = ensure_parent_dir_sync(&task.dest) {
            return Admission::Rejected(TaskError::filesystem(format!(
                "Cannot create directory for {}: {}",
                task.dest.display(),
                e
            )));
        }
        if task.dest.exists() {
            return Admission::Satisfied(Some(task.dest.clone()));
        }

        let path = task.part_path();
        match File::create(&path) {
            Ok(file) => Admission::Start(PartFile { file, path }),
            Err(e) => Admission::Rejected(TaskError::filesystem(format!(
                "Cannot create file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn execute(&self, task: &DownloadTask, part: PartFile, ctx: &TaskContext) -> Outcome {
        let PartFile { file, path } = part;
        let mut file = tokio::fs::File::from_std(file);

        debug!("Downloading {} to {}", task.url, path.display());
        let result = self.transfer(task, &mut file, ctx).await;
        drop(file);

        match result {
            Ok(bytes) => match promote(&path, &task.dest) {
                Ok(()) => {
                    info!("Downloaded {} ({} bytes)", task.dest.display(), bytes);
                    Outcome::Succeeded(Some(task.dest.clone()))
                }
                Err(e) => {
                    cleanup_partial_output(&path);
                    Outcome::Failed(e)
                }
            },
            Err(TransferStop::Cancelled) => {
                cleanup_partial_output(&path);
                Outcome::Cancelled
            }
            Err(TransferStop::Failed(e)) => {
                cleanup_partial_output(&path);
                Outcome::Failed(e)
            }
        }
    }

    async fn cleanup(&self, task: &DownloadTask) {
        cleanup_partial_output(&task.part_path());
    }
}

/// Bounded pool of concurrent HTTP downloads.
#[derive(Clone)]
pub struct DownloadPipeline {
    queue: WorkerQueue<DownloadExecutor>,
}

impl DownloadPipeline {
    pub fn new(config: &DownloadConfig, bus: EventBus) -> Result<Self> {
        let executor = DownloadExecutor::new(config)?;
        Ok(Self::with_executor(executor, config.max_concurrent, bus))
    }

    pub fn with_executor(executor: DownloadExecutor, max_concurrent: usize, bus: EventBus) -> Self {
        Self {
            queue: WorkerQueue::new(executor, max_concurrent, bus, None),
        }
    }

    pub fn enqueue(&self, item_id: ItemId, url: Url, dest: impl Into<PathBuf>) -> TaskId {
        self.queue.enqueue(DownloadTask::new(item_id, url, dest))
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
