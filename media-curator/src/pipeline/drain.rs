//! Outstanding-task accounting with exactly-once drain notification.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::events::{EventBus, PipelineEvent};

/// Counts tasks that were accepted but have not yet reached a terminal state.
///
/// The transition to zero through [`DrainGroup::settle`] emits the group's
/// event exactly once per busy period. Cancelled tasks leave through
/// [`DrainGroup::discard`] and never trigger a notification. A group may
/// forward its accounting to a parent so several queues share one joint
/// completion signal.
#[derive(Debug)]
pub struct DrainGroup {
    outstanding: AtomicUsize,
    event: PipelineEvent,
    bus: EventBus,
    parent: Option<Arc<DrainGroup>>,
}

impl DrainGroup {
    pub fn new(event: PipelineEvent, bus: EventBus, parent: Option<Arc<DrainGroup>>) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            event,
            bus,
            parent,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Register one new task.
    pub fn admit(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if let Some(parent) = &self.parent {
            parent.admit();
        }
    }

    /// Record one terminal task. Returns true when this call drained the group.
    pub fn settle(&self) -> bool {
        let drained = self.decrement(1);
        if drained {
            debug!(event = ?self.event, "drain group is empty");
            self.bus.emit(self.event.clone());
        }
        if let Some(parent) = &self.parent {
            parent.settle();
        }
        drained
    }

    /// Drop `count` cancelled tasks without notifying anyone.
    pub fn discard(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.decrement(count);
        if let Some(parent) = &self.parent {
            parent.discard(count);
        }
    }

    fn decrement(&self, count: usize) -> bool {
        let previous = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            })
            .unwrap_or(0);
        previous != 0 && previous <= count
    }
}
