//! Task-queue / worker-pool pipeline.
//!
//! Every stage is a [`WorkerQueue`] specialised by a [`TaskExecutor`]:
//! - [`DownloadPipeline`]: HTTP byte streams into `.part` files.
//! - [`TranscodePipeline`]: one ffmpeg process per item.
//! - [`UploadPipeline`]: one storage CLI process per object, manifest or delete.
//!
//! [`ProcessingPipeline`] joins the scale and upload pools under a single
//! completion signal. All stages publish on a shared [`EventBus`].

pub mod download;
pub mod drain;
pub mod events;
pub mod processing;
pub mod queue;
pub mod task;
pub mod transcode;
pub mod upload;

pub use download::{DownloadPipeline, DownloadTask};
pub use drain::DrainGroup;
pub use events::{EventBus, PipelineEvent, ProgressUpdate};
pub use processing::ProcessingPipeline;
pub use queue::{Admission, Outcome, QueueStats, TaskContext, TaskExecutor, WorkerQueue};
pub use task::{INTERNAL_ITEM_ID, ItemId, MediaKind, PipelineTask, Stage, TaskError, TaskId, TaskKind};
pub use transcode::{ScaleTask, TranscodePipeline};
pub use upload::{UploadAction, UploadPipeline, UploadTask};
