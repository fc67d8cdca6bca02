//! Pipeline lifecycle events and the broadcast bus that carries them.
//!
//! Lifecycle events (start, completion, failure, drain) and byte-level
//! progress travel on separate channels so a burst of progress updates can
//! never push a terminal event out of a lagging receiver's buffer.

use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::trace;

use super::task::{ItemId, Stage, TaskError, TaskId, TaskKind};

/// Default buffer for the lifecycle channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default buffer for the progress channel.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    TaskStarted {
        stage: Stage,
        task_id: TaskId,
        item_id: ItemId,
        kind: TaskKind,
    },
    TaskCompleted {
        stage: Stage,
        task_id: TaskId,
        item_id: ItemId,
        kind: TaskKind,
        /// Final artifact path for downloads and scales.
        output: Option<PathBuf>,
    },
    TaskFailed {
        stage: Stage,
        task_id: TaskId,
        item_id: ItemId,
        kind: TaskKind,
        error: TaskError,
    },
    /// Every task enqueued on the stage has reached a terminal state.
    StageDrained { stage: Stage },
    /// Both the scale and upload stages of a processing pipeline are empty.
    AllTasksCompleted,
}

impl PipelineEvent {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineEvent::TaskStarted { stage, .. }
            | PipelineEvent::TaskCompleted { stage, .. }
            | PipelineEvent::TaskFailed { stage, .. }
            | PipelineEvent::StageDrained { stage } => Some(*stage),
            PipelineEvent::AllTasksCompleted => None,
        }
    }

    pub fn item_id(&self) -> Option<ItemId> {
        match self {
            PipelineEvent::TaskStarted { item_id, .. }
            | PipelineEvent::TaskCompleted { item_id, .. }
            | PipelineEvent::TaskFailed { item_id, .. } => Some(*item_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::TaskCompleted { .. } | PipelineEvent::TaskFailed { .. }
        )
    }
}

/// Byte-level download progress. `total` is 0 when the server sent no length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub task_id: TaskId,
    pub item_id: ItemId,
    pub received: u64,
    pub total: u64,
}

impl ProgressUpdate {
    pub fn percent(&self) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        Some(((self.received.min(self.total) * 100) / self.total) as u8)
    }
}

/// Fan-out bus shared by every queue of a pipeline set.
#[derive(Debug, Clone)]
pub struct EventBus {
    events: broadcast::Sender<PipelineEvent>,
    progress: broadcast::Sender<ProgressUpdate>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (progress, _) = broadcast::channel(DEFAULT_PROGRESS_CAPACITY);
        Self { events, progress }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        trace!(?event, "pipeline event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_progress(&self, update: ProgressUpdate) {
        let _ = self.progress.send(update);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Handle given to a running task for publishing its progress.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    bus: EventBus,
    stage: Stage,
    task_id: TaskId,
    item_id: ItemId,
}

impl ProgressReporter {
    pub(crate) fn new(bus: EventBus, stage: Stage, task_id: TaskId, item_id: ItemId) -> Self {
        Self {
            bus,
            stage,
            task_id,
            item_id,
        }
    }

    pub fn report(&self, received: u64, total: u64) {
        self.bus.emit_progress(ProgressUpdate {
            stage: self.stage,
            task_id: self.task_id,
            item_id: self.item_id,
            received,
            total,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(PipelineEvent::AllTasksCompleted);
    }

    #[tokio::test]
    async fn test_progress_is_separate_from_lifecycle() {
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let mut progress = bus.subscribe_progress();

        let reporter = ProgressReporter::new(bus.clone(), Stage::Download, TaskId(1), 42);
        reporter.report(10, 100);
        bus.emit(PipelineEvent::StageDrained {
            stage: Stage::Download,
        });

        let update = progress.recv().await.unwrap();
        assert_eq!(update.item_id, 42);
        assert_eq!(update.percent(), Some(10));
        assert_eq!(
            events.recv().await.unwrap(),
            PipelineEvent::StageDrained {
                stage: Stage::Download
            }
        );
    }

    #[test]
    fn test_percent_unknown_total() {
        let update = ProgressUpdate {
            stage: Stage::Download,
            task_id: TaskId(1),
            item_id: 1,
            received: 500,
            total: 0,
        };
        assert_eq!(update.percent(), None);
    }
}
