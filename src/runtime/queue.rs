//! # Work Queue
//!
//! Single-slot deduplicating queue feeding one controller. Every controller has a
//! single logical work item, so triggers arriving while one is pending merge into it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// Why a controller is being run. Ordered by merge priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Trigger {
    /// Periodic resync tick
    Resync,
    /// Delayed re-run requested by the controller or its backoff
    Requeue,
    /// A watched object changed
    Watch,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Resync => "resync",
            Trigger::Requeue => "requeue",
            Trigger::Watch => "watch",
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: Mutex<Option<Trigger>>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a trigger, merging with any pending one
    pub fn add(&self, trigger: Trigger) {
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            *pending = Some(pending.map_or(trigger, |current| current.max(trigger)));
        }
        self.notify.notify_one();
    }

    /// Enqueue a trigger once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, trigger: Trigger, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(trigger);
        });
    }

    /// Take the pending trigger without waiting
    pub fn take(&self) -> Option<Trigger> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait for the next trigger
    pub async fn next(&self) -> Trigger {
        loop {
            if let Some(trigger) = self.take() {
                return trigger;
            }
            self.notify.notified().await;
        }
    }
}
