//! Scale and upload pools operated as one logical processing stage.

use std::sync::Arc;

use super::drain::DrainGroup;
use super::events::{EventBus, PipelineEvent};
use super::transcode::TranscodePipeline;
use super::upload::UploadPipeline;
use crate::config::{StorageConfig, TranscodeConfig};

/// Independent scale and upload pools sharing one joint completion signal.
///
/// Each pool keeps its own concurrency limit and emits its own
/// `StageDrained`. `AllTasksCompleted` fires only when both are empty at the
/// same time. No priority exists between the pools.
#[derive(Clone)]
pub struct ProcessingPipeline {
    scale: TranscodePipeline,
    upload: UploadPipeline,
    joint: Arc<DrainGroup>,
}

impl ProcessingPipeline {
    pub fn new(transcode: &TranscodeConfig, storage: &StorageConfig, bus: EventBus) -> Self {
        let joint = Arc::new(DrainGroup::new(
            PipelineEvent::AllTasksCompleted,
            bus.clone(),
            None,
        ));
        Self {
            scale: TranscodePipeline::with_parent(transcode, bus.clone(), Some(joint.clone())),
            upload: UploadPipeline::with_parent(storage, bus, Some(joint.clone())),
            joint,
        }
    }

    pub fn scale(&self) -> &TranscodePipeline {
        &self.scale
    }

    pub fn upload(&self) -> &UploadPipeline {
        &self.upload
    }

    /// True when neither pool has queued or running work.
    pub fn is_idle(&self) -> bool {
        self.joint.is_idle()
    }

    pub async fn cancel_all(&self) {
        tokio::join!(self.scale.cancel_all(), self.upload.cancel_all());
    }
}
