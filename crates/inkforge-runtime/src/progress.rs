//! Progress callbacks
//!
//! A subscription table keyed by task id with copy-on-notify semantics:
//! the callback list is snapshotted before invocation so a listener that
//! subscribes or unsubscribes mid-notify cannot race the iteration. Callback
//! panics are isolated and never propagate into the executor.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// One progress notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: Uuid,
    pub current_step: String,
    /// Coarse completion estimate in [0, 100]
    pub percentage: u8,
    pub message: String,
}

/// Progress callback type
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// In-process progress broker
#[derive(Default)]
pub struct ProgressBroker {
    callbacks: DashMap<Uuid, Vec<ProgressCallback>>,
}

impl ProgressBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a task's progress
    pub fn on_progress(&self, task_id: Uuid, callback: ProgressCallback) {
        self.callbacks.entry(task_id).or_default().push(callback);
    }

    /// Drop every callback registered for a task
    pub fn remove_progress_callbacks(&self, task_id: Uuid) {
        self.callbacks.remove(&task_id);
    }

    /// Number of callbacks registered for a task
    pub fn callback_count(&self, task_id: Uuid) -> usize {
        self.callbacks.get(&task_id).map(|v| v.len()).unwrap_or(0)
    }

    /// Notify every subscriber of an event
    pub fn notify(&self, event: &ProgressEvent) {
        // Snapshot before invoking so listener mutation cannot race
        let snapshot: Vec<ProgressCallback> = match self.callbacks.get(&event.task_id) {
            Some(list) => list.clone(),
            None => return,
        };

        for callback in snapshot {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
            if result.is_err() {
                warn!(task_id = %event.task_id, "progress callback panicked; ignoring");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(task_id: Uuid) -> ProgressEvent {
        ProgressEvent {
            task_id,
            current_step: "draft".to_string(),
            percentage: 50,
            message: "drafting".to_string(),
        }
    }

    #[test]
    fn test_notify_reaches_all_subscribers() {
        let broker = ProgressBroker::new();
        let task_id = Uuid::now_v7();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = count.clone();
            broker.on_progress(
                task_id,
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        broker.notify(&event(task_id));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let broker = ProgressBroker::new();
        let task_id = Uuid::now_v7();
        let reached = Arc::new(AtomicUsize::new(0));

        broker.on_progress(task_id, Arc::new(|_| panic!("listener bug")));
        {
            let reached = reached.clone();
            broker.on_progress(
                task_id,
                Arc::new(move |_| {
                    reached.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        broker.notify(&event(task_id));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_drops_subscriptions() {
        let broker = ProgressBroker::new();
        let task_id = Uuid::now_v7();
        broker.on_progress(task_id, Arc::new(|_| {}));
        assert_eq!(broker.callback_count(task_id), 1);

        broker.remove_progress_callbacks(task_id);
        assert_eq!(broker.callback_count(task_id), 0);
        // Notifying with no subscribers is a no-op
        broker.notify(&event(task_id));
    }

    #[test]
    fn test_other_tasks_unaffected() {
        let broker = ProgressBroker::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count = count.clone();
            broker.on_progress(
                a,
                Arc::new(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        broker.notify(&event(b));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
