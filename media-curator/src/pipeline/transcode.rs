//! Scale-and-crop transcoding through an external ffmpeg process.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use process_utils::{RunOutcome, run_captured, tokio_command};
use tracing::{debug, info};

use super::drain::DrainGroup;
use super::events::EventBus;
use super::queue::{Admission, Outcome, QueueStats, TaskContext, TaskExecutor, WorkerQueue};
use super::task::{ItemId, MediaKind, PipelineTask, Stage, TaskError, TaskId, TaskKind};
use crate::config::TranscodeConfig;
use crate::utils::fs::{cleanup_partial_output, ensure_parent_dir_sync};

/// Tool label used in error messages.
pub const FFMPEG_TOOL: &str = "ffmpeg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTask {
    pub item_id: ItemId,
    pub media: MediaKind,
    pub input: PathBuf,
    pub output: PathBuf,
    pub target_width: u32,
    pub target_height: u32,
    pub crf: u32,
    pub preset: String,
}

impl ScaleTask {
    pub fn new(
        item_id: ItemId,
        media: MediaKind,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        config: &TranscodeConfig,
    ) -> Self {
        Self {
            item_id,
            media,
            input: input.into(),
            output: output.into(),
            target_width: config.target_width,
            target_height: config.target_height,
            crf: config.crf,
            preset: config.preset.clone(),
        }
    }

    /// Cover-then-crop filter graph: no letterboxing, exact output size.
    pub fn filter_graph(&self) -> String {
        let (w, h) = (self.target_width, self.target_height);
        format!("scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}")
    }

    /// Full ffmpeg argument list for this task.
    pub fn ffmpeg_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), self.input.clone().into()];
        if self.media == MediaKind::Video {
            args.push("-an".into());
        }
        args.push("-vf".into());
        args.push(self.filter_graph().into());
        match self.media {
            MediaKind::Video => {
                for arg in [
                    "-c:v",
                    "libx264",
                    "-preset",
                    self.preset.as_str(),
                    "-crf",
                ] {
                    args.push(arg.into());
                }
                args.push(self.crf.to_string().into());
                for arg in ["-pix_fmt", "yuv420p", "-movflags", "+faststart"] {
                    args.push(arg.into());
                }
            }
            MediaKind::Image => {
                args.push("-q:v".into());
                args.push("2".into());
            }
        }
        args.push(self.output.clone().into());
        args
    }
}

impl PipelineTask for ScaleTask {
    fn item_id(&self) -> ItemId {
        self.item_id
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Scale
    }
}

pub struct TranscodeExecutor {
    ffmpeg_path: String,
}

impl TranscodeExecutor {
    pub fn new(config: &TranscodeConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
        }
    }
}

#[async_trait]
impl TaskExecutor for TranscodeExecutor {
    type Task = ScaleTask;
    type Prepared = ();

    fn stage(&self) -> Stage {
        Stage::Scale
    }

    fn admit(&self, task: &ScaleTask) -> Admission<()> {
        match ensure_parent_dir_sync(&task.output) {
            Ok(()) => Admission::Start(()),
            Err(e) => Admission::Rejected(TaskError::filesystem(format!(
                "Cannot create directory for {}: {}",
                task.output.display(),
                e
            ))),
        }
    }

    async fn execute(&self, task: &ScaleTask, _: (), ctx: &TaskContext) -> Outcome {
        let start = Instant::now();
        info!(
            "Scaling {} {} -> {}",
            task.media.as_str(),
            task.input.display(),
            task.output.display()
        );

        let mut cmd = tokio_command(&self.ffmpeg_path);
        cmd.args(task.ffmpeg_args()).env("LC_ALL", "C");

        match run_captured(&mut cmd, ctx.cancellation()).await {
            Ok(RunOutcome::Exited(exit)) if exit.success() => {
                info!(
                    "Scaled {} in {:.2}s",
                    task.output.display(),
                    start.elapsed().as_secs_f64()
                );
                Outcome::Succeeded(Some(task.output.clone()))
            }
            Ok(RunOutcome::Exited(exit)) => {
                debug!("ffmpeg stderr: {}", exit.stderr);
                cleanup_partial_output(&task.output);
                Outcome::Failed(TaskError::from_exit(FFMPEG_TOOL, &exit))
            }
            Ok(RunOutcome::Cancelled) => Outcome::Cancelled,
            Err(e) => {
                cleanup_partial_output(&task.output);
                Outcome::Failed(TaskError::from_run_error(FFMPEG_TOOL, e))
            }
        }
    }

    async fn cleanup(&self, task: &ScaleTask) {
        cleanup_partial_output(&task.output);
    }
}

/// Bounded pool of ffmpeg processes.
#[derive(Clone)]
pub struct TranscodePipeline {
    queue: WorkerQueue<TranscodeExecutor>,
    config: TranscodeConfig,
}

impl TranscodePipeline {
    pub fn new(config: &TranscodeConfig, bus: EventBus) -> Self {
        Self::with_parent(config, bus, None)
    }

    pub(crate) fn with_parent(
        config: &TranscodeConfig,
        bus: EventBus,
        parent: Option<Arc<DrainGroup>>,
    ) -> Self {
        Self {
            queue: WorkerQueue::new(
                TranscodeExecutor::new(config),
                config.max_concurrent,
                bus,
                parent,
            ),
            config: config.clone(),
        }
    }

    /// Queue a scale of `input` into `output` using the configured target size.
    pub fn enqueue(
        &self,
        item_id: ItemId,
        media: MediaKind,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> TaskId {
        self.enqueue_task(ScaleTask::new(item_id, media, input, output, &self.config))
    }

    pub fn enqueue_task(&self, task: ScaleTask) -> TaskId {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(task: &ScaleTask) -> Vec<String> {
        task.ffmpeg_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_video_args() {
        let task = ScaleTask::new(
            5,
            MediaKind::Video,
            "raw/5.mp4",
            "scaled/5.mp4",
            &TranscodeConfig::default(),
        );
        assert_eq!(
            args_of(&task),
            vec![
                "-y",
                "-i",
                "raw/5.mp4",
                "-an",
                "-vf",
                "scale=1280:800:force_original_aspect_ratio=increase,crop=1280:800",
                "-c:v",
                "libx264",
                "-preset",
                "slow",
                "-crf",
                "22",
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
                "scaled/5.mp4",
            ]
        );
    }

    #[test]
    fn test_image_args() {
        let config = TranscodeConfig {
            target_width: 640,
            target_height: 480,
            ..TranscodeConfig::default()
        };
        let task = ScaleTask::new(6, MediaKind::Image, "raw/6.jpg", "scaled/6.jpg", &config);
        assert_eq!(
            args_of(&task),
            vec![
                "-y",
                "-i",
                "raw/6.jpg",
                "-vf",
                "scale=640:480:force_original_aspect_ratio=increase,crop=640:480",
                "-q:v",
                "2",
                "scaled/6.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn test_admission_creates_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let executor = TranscodeExecutor::new(&TranscodeConfig::default());
        let task = ScaleTask::new(
            1,
            MediaKind::Image,
            dir.path().join("raw/1.jpg"),
            dir.path().join("scaled/1.jpg"),
            &TranscodeConfig::default(),
        );
        assert!(matches!(executor.admit(&task), Admission::Start(())));
        assert!(dir.path().join("scaled").is_dir());
    }
}
