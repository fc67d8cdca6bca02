//! Bounded FIFO worker queue shared by every pipeline stage.
//!
//! A [`WorkerQueue`] owns a backlog of tasks and a fixed table of worker slots.
//! All state lives behind one mutex; admission, dispatch, terminal bookkeeping
//! and event emission happen while it is held, so observers see events in the
//! order the state changed. Workers run on the tokio runtime and report back
//! through the same lock, which then refills the freed slot from the backlog.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::drain::DrainGroup;
use super::events::{EventBus, PipelineEvent, ProgressReporter};
use super::task::{ItemId, PipelineTask, Stage, TaskError, TaskId, TaskKind};

/// Result of the synchronous admission step run when a task reaches a slot.
#[derive(Debug)]
pub enum Admission<P> {
    /// Start a worker with the prepared resources.
    Start(P),
    /// Nothing to do; the task completes at once with this output.
    Satisfied(Option<PathBuf>),
    /// The task fails without ever occupying a slot.
    Rejected(TaskError),
}

/// How a worker finished.
#[derive(Debug)]
pub enum Outcome {
    Succeeded(Option<PathBuf>),
    Failed(TaskError),
    /// The worker observed its cancellation token and stopped.
    Cancelled,
}

/// Per-run context handed to [`TaskExecutor::execute`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub item_id: ItemId,
    pub stage: Stage,
    cancel: CancellationToken,
    progress: ProgressReporter,
}

impl TaskContext {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn report_progress(&self, received: u64, total: u64) {
        self.progress.report(received, total);
    }
}

/// The stage-specific half of a queue.
///
/// `admit` runs synchronously under the queue lock and must not block for
/// long. `execute` must return promptly with [`Outcome::Cancelled`] once the
/// context's token fires. `cleanup` runs after a cancelled worker stops and
/// `discard` runs for tasks dropped from the backlog by
/// [`WorkerQueue::cancel_all`].
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    type Task: PipelineTask;
    type Prepared: Send + 'static;

    fn stage(&self) -> Stage;

    fn admit(&self, task: &Self::Task) -> Admission<Self::Prepared>;

    async fn execute(
        &self,
        task: &Self::Task,
        prepared: Self::Prepared,
        ctx: &TaskContext,
    ) -> Outcome;

    async fn cleanup(&self, _task: &Self::Task) {}

    fn discard(&self, _task: &Self::Task) {}
}

/// Snapshot of a queue's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub backlog: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

struct QueuedTask<T> {
    id: TaskId,
    task: T,
}

struct ActiveWorker {
    task_id: TaskId,
    item_id: ItemId,
    kind: TaskKind,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
    cancelled: bool,
}

struct QueueState<T> {
    backlog: VecDeque<QueuedTask<T>>,
    slots: Vec<Option<ActiveWorker>>,
}

impl<T> QueueState<T> {
    fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }
}

struct Shared<E: TaskExecutor> {
    executor: E,
    bus: EventBus,
    drain: DrainGroup,
    max_concurrent: usize,
    next_id: AtomicU64,
    state: Mutex<QueueState<E::Task>>,
}

/// A bounded pool of workers fed from a FIFO backlog.
pub struct WorkerQueue<E: TaskExecutor> {
    shared: Arc<Shared<E>>,
}

impl<E: TaskExecutor> Clone for WorkerQueue<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: TaskExecutor> WorkerQueue<E> {
    /// Create a queue running at most `max_concurrent` workers (minimum 1).
    ///
    /// When `parent` is given, the queue's outstanding count also feeds that
    /// group's joint drain notification.
    pub fn new(
        executor: E,
        max_concurrent: usize,
        bus: EventBus,
        parent: Option<Arc<DrainGroup>>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let stage = executor.stage();
        let drain = DrainGroup::new(PipelineEvent::StageDrained { stage }, bus.clone(), parent);
        let slots = (0..max_concurrent).map(|_| None).collect();

        Self {
            shared: Arc::new(Shared {
                executor,
                bus,
                drain,
                max_concurrent,
                next_id: AtomicU64::new(1),
                state: Mutex::new(QueueState {
                    backlog: VecDeque::new(),
                    slots,
                }),
            }),
        }
    }

    pub fn stage(&self) -> Stage {
        self.shared.executor.stage()
    }

    pub fn executor(&self) -> &E {
        &self.shared.executor
    }

    /// Append a task to the backlog and dispatch if a slot is free.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, task: E::Task) -> TaskId {
        let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.shared.state.lock();
        self.shared.drain.admit();
        debug!(
            "{} queue: enqueued task {} ({}) for item {}",
            self.stage(),
            id,
            task.kind(),
            task.item_id()
        );
        state.backlog.push_back(QueuedTask { id, task });
        self.shared.dispatch_locked(&mut state);
        id
    }

    /// Cancel every queued and running task.
    ///
    /// The backlog is discarded, running workers are signalled and awaited, and
    /// each executor's cleanup runs before this returns. Cancelled tasks emit no
    /// terminal or drain events. Calling this on an idle queue is a no-op.
    ///
    /// A worker whose task already succeeded when the signal lands is still
    /// reported as cancelled, but its output is left in place.
    pub async fn cancel_all(&self) {
        let (discarded, handles) = {
            let mut state = self.shared.state.lock();
            let discarded: Vec<_> = state.backlog.drain(..).collect();
            for queued in &discarded {
                self.shared.executor.discard(&queued.task);
            }
            self.shared.drain.discard(discarded.len());

            let mut handles = Vec::new();
            for worker in state.slots.iter_mut().flatten() {
                if !worker.cancelled {
                    worker.cancelled = true;
                    worker.token.cancel();
                }
                if let Some(handle) = worker.handle.take() {
                    handles.push(handle);
                }
            }
            (discarded.len(), handles)
        };

        if discarded == 0 && handles.is_empty() {
            return;
        }

        info!(
            "Cancelling {} queue: {} queued, {} running",
            self.stage(),
            discarded,
            handles.len()
        );
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("{} worker ended abnormally during cancel: {}", self.stage(), e);
            }
        }
        info!("{} queue cancelled", self.stage());
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            backlog: state.backlog.len(),
            active: state.active(),
            max_concurrent: self.shared.max_concurrent,
        }
    }

    /// True when no task is queued or running.
    pub fn is_drained(&self) -> bool {
        let state = self.shared.state.lock();
        state.backlog.is_empty() && state.active() == 0
    }
}

impl<E: TaskExecutor> Shared<E> {
    fn stage(&self) -> Stage {
        self.executor.stage()
    }

    /// Fill free slots from the head of the backlog.
    fn dispatch_locked(self: &Arc<Self>, state: &mut QueueState<E::Task>) {
        while state.active() < self.max_concurrent {
            let Some(queued) = state.backlog.pop_front() else {
                break;
            };
            let QueuedTask { id, task } = queued;
            let (item_id, kind) = (task.item_id(), task.kind());

            match self.executor.admit(&task) {
                Admission::Satisfied(output) => {
                    debug!("{} task {} already satisfied", self.stage(), id);
                    self.bus.emit(PipelineEvent::TaskCompleted {
                        stage: self.stage(),
                        task_id: id,
                        item_id,
                        kind,
                        output,
                    });
                    self.drain.settle();
                }
                Admission::Rejected(error) => {
                    warn!("{} task {} rejected: {}", self.stage(), id, error);
                    self.bus.emit(PipelineEvent::TaskFailed {
                        stage: self.stage(),
                        task_id: id,
                        item_id,
                        kind,
                        error,
                    });
                    self.drain.settle();
                }
                Admission::Start(prepared) => {
                    let Some(slot) = state.free_slot() else {
                        state.backlog.push_front(QueuedTask { id, task });
                        break;
                    };
                    let token = CancellationToken::new();
                    let ctx = TaskContext {
                        task_id: id,
                        item_id,
                        stage: self.stage(),
                        cancel: token.clone(),
                        progress: ProgressReporter::new(self.bus.clone(), self.stage(), id, item_id),
                    };

                    self.bus.emit(PipelineEvent::TaskStarted {
                        stage: self.stage(),
                        task_id: id,
                        item_id,
                        kind,
                    });
                    debug!("{} worker {} started task {}", self.stage(), slot, id);

                    let shared = Arc::clone(self);
                    let handle = tokio::spawn(async move {
                        shared.run_worker(slot, task, prepared, ctx).await;
                    });

                    state.slots[slot] = Some(ActiveWorker {
                        task_id: id,
                        item_id,
                        kind,
                        token,
                        handle: Some(handle),
                        cancelled: false,
                    });
                }
            }
        }
    }

    async fn run_worker(
        self: Arc<Self>,
        slot: usize,
        task: E::Task,
        prepared: E::Prepared,
        ctx: TaskContext,
    ) {
        let outcome = self.executor.execute(&task, prepared, &ctx).await;

        let cancelled = ctx.is_cancelled() || matches!(outcome, Outcome::Cancelled);
        // A finished output is kept even when cancellation raced the exit
        if cancelled && !matches!(outcome, Outcome::Succeeded(_)) {
            self.executor.cleanup(&task).await;
        }
        self.finish(slot, ctx.task_id, outcome, cancelled);
    }

    /// Record a worker's terminal state, refill its slot, then check for drain.
    fn finish(self: &Arc<Self>, slot: usize, task_id: TaskId, outcome: Outcome, cancelled: bool) {
        let mut state = self.state.lock();
        let Some(worker) = state.slots.get_mut(slot).and_then(Option::take) else {
            warn!("{} worker {} finished without an active task", self.stage(), slot);
            return;
        };
        debug_assert_eq!(worker.task_id, task_id);

        let silent = cancelled || worker.cancelled;
        if silent {
            debug!("{} task {} cancelled", self.stage(), task_id);
        } else {
            match outcome {
                Outcome::Succeeded(output) => {
                    info!("{} task {} completed for item {}", self.stage(), task_id, worker.item_id);
                    self.bus.emit(PipelineEvent::TaskCompleted {
                        stage: self.stage(),
                        task_id,
                        item_id: worker.item_id,
                        kind: worker.kind,
                        output,
                    });
                }
                Outcome::Failed(error) => {
                    warn!(
                        "{} task {} failed for item {}: {}",
                        self.stage(),
                        task_id,
                        worker.item_id,
                        error
                    );
                    self.bus.emit(PipelineEvent::TaskFailed {
                        stage: self.stage(),
                        task_id,
                        item_id: worker.item_id,
                        kind: worker.kind,
                        error,
                    });
                }
                Outcome::Cancelled => {}
            }
        }

        self.dispatch_locked(&mut state);

        if silent {
            self.drain.discard(1);
        } else {
            self.drain.settle();
        }
    }
}
