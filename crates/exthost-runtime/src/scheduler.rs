//! Deferred task scheduling.
//!
//! The scheduler owns every deferred task it starts: tasks are tracked in a
//! [`TaskTracker`] and listed in a pending table until they finish, so no
//! outside reference is needed to keep a timer alive. Each task is tied to a
//! [`CancellationToken`] derived from the owning instance's token.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use exthost_core::InstanceId;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// What a deferred task wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFlow {
    /// Run again after the same delay.
    Continue,
    /// Done; drop the task.
    Break,
}

impl From<bool> for TaskFlow {
    fn from(again: bool) -> Self {
        if again { Self::Continue } else { Self::Break }
    }
}

/// Handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Get the raw ID.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct PendingTask {
    instance: InstanceId,
    cancel: CancellationToken,
}

/// Owner of all deferred tasks of one host.
#[derive(Debug)]
pub(crate) struct Scheduler {
    handle: Handle,
    tracker: TaskTracker,
    root: CancellationToken,
    pending: Arc<DashMap<TaskId, PendingTask>>,
    next_task: AtomicU64,
}

impl Scheduler {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
            pending: Arc::new(DashMap::new()),
            next_task: AtomicU64::new(1),
        }
    }

    /// Token for a new instance; cancelled when the scheduler shuts down.
    pub(crate) fn instance_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Run `task` after `delay`, repeating while it returns [`TaskFlow::Continue`].
    pub(crate) fn schedule<F>(
        &self,
        instance: InstanceId,
        delay: Duration,
        cancel: CancellationToken,
        mut task: F,
    ) -> TaskId
    where
        F: FnMut() -> TaskFlow + Send + 'static,
    {
        let id = TaskId(self.next_task.fetch_add(1, Ordering::Relaxed));
        self.pending.insert(
            id,
            PendingTask {
                instance,
                cancel: cancel.clone(),
            },
        );

        let pending = Arc::clone(&self.pending);
        self.tracker.spawn_on(
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            tracing::trace!(task = %id, %instance, "deferred task cancelled");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {
                            if task() == TaskFlow::Break {
                                break;
                            }
                        }
                    }
                }
                pending.remove(&id);
            },
            &self.handle,
        );

        tracing::debug!(task = %id, %instance, ?delay, "deferred task scheduled");
        id
    }

    /// Cancel one task. Returns `false` if it already finished.
    pub(crate) fn cancel(&self, id: TaskId) -> bool {
        match self.pending.remove(&id) {
            Some((_, task)) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the pending entries of an instance whose token was cancelled.
    pub(crate) fn forget_instance(&self, instance: InstanceId) {
        self.pending.retain(|_, task| {
            if task.instance == instance {
                task.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn pending_for(&self, instance: InstanceId) -> usize {
        self.pending
            .iter()
            .filter(|entry| entry.value().instance == instance)
            .count()
    }

    /// Cancel everything without waiting.
    pub(crate) fn cancel_all(&self) {
        self.root.cancel();
        self.pending.clear();
        self.tracker.close();
    }

    /// Cancel everything and wait for the tasks to finish.
    pub(crate) async fn shutdown(&self) {
        self.cancel_all();
        self.tracker.wait().await;
    }
}
