//! In-memory task registry.
//!
//! Holds every live upload task, enforces the forward-only status machine,
//! notifies listeners and evicts terminal tasks after a grace period.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use posecoach_core::TaskId;

use super::types::{NewTask, TaskEvent, TaskEventKind, TaskPatch, TaskStats, TaskStatus, UploadTask};
use crate::error::RegistryError;

/// Registry listener.
pub type TaskListener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<TaskId, UploadTask>,
    outbox: VecDeque<TaskEvent>,
    /// Thread currently draining `outbox`
    dispatcher: Option<ThreadId>,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, TaskListener)>,
}

/// Removes its listener when dropped.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut listeners = listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Live map of upload tasks keyed by [`TaskId`].
///
/// Events are delivered in the order the changes were made, one at a time,
/// outside the registry lock. A change returns only after its event has been
/// delivered, except when a listener calls back into the registry: those
/// events are queued behind the one being delivered.
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
    /// Held while draining the outbox
    delivery: Mutex<()>,
    listeners: Arc<Mutex<Listeners>>,
    cleanup_grace: Duration,
    me: Weak<TaskRegistry>,
}

impl TaskRegistry {
    pub fn new(cleanup_grace: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            state: Mutex::new(RegistryState::default()),
            delivery: Mutex::new(()),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            cleanup_grace,
            me: me.clone(),
        })
    }

    pub fn cleanup_grace(&self) -> Duration {
        self.cleanup_grace
    }

    /// Register a new `Pending` task.
    pub fn create(&self, task_id: TaskId, fields: NewTask) -> Result<UploadTask, RegistryError> {
        let mut state = self.lock_state();
        if state.tasks.contains_key(&task_id) {
            return Err(RegistryError::DuplicateTask(task_id));
        }

        let task = UploadTask::new(task_id.clone(), fields);
        state.tasks.insert(task_id.clone(), task.clone());
        debug!(task_id = %task_id, priority = task.priority, "task created");

        self.publish(
            state,
            TaskEvent {
                task_id,
                task: task.clone(),
                kind: TaskEventKind::Created,
            },
        );
        Ok(task)
    }

    /// Apply a status change with its field patch.
    ///
    /// Returns `false` without touching anything when the task is unknown,
    /// already terminal, or the change would move status backwards.
    pub fn update(&self, task_id: &TaskId, status: TaskStatus, patch: TaskPatch) -> bool {
        let mut state = self.lock_state();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if !task.status.can_transition_to(status) {
            debug!(
                task_id = %task_id,
                from = %task.status,
                to = %status,
                "ignored status change"
            );
            return false;
        }

        let old_status = task.status;
        task.apply(status, patch);
        let snapshot = task.clone();

        if old_status != status {
            debug!(task_id = %task_id, from = %old_status, to = %status, "task status changed");
        }

        self.publish(
            state,
            TaskEvent {
                task_id: task_id.clone(),
                task: snapshot,
                kind: TaskEventKind::Updated { old_status },
            },
        );

        if status.is_terminal() {
            self.schedule_eviction(task_id.clone());
        }
        true
    }

    /// Cancel a non-terminal task, aborting its outstanding attempt if any.
    ///
    /// Returns `false` for unknown or already terminal tasks.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let mut state = self.lock_state();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }

        if let Some(token) = task.cancel.take() {
            token.cancel();
        }
        let old_status = task.status;
        task.apply(TaskStatus::Cancelled, TaskPatch::default());
        let snapshot = task.clone();
        info!(task_id = %task_id, from = %old_status, "task cancelled");

        self.publish(
            state,
            TaskEvent {
                task_id: task_id.clone(),
                task: snapshot,
                kind: TaskEventKind::Updated { old_status },
            },
        );
        self.schedule_eviction(task_id.clone());
        true
    }

    /// Record that a retry of `task_id` was scheduled.
    pub fn record_retry(&self, task_id: &TaskId, attempt: u32, delay: Duration) {
        let mut state = self.lock_state();
        let Some(task) = state.tasks.get_mut(task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }

        task.retry_attempt = attempt;
        let snapshot = task.clone();
        self.publish(
            state,
            TaskEvent {
                task_id: task_id.clone(),
                task: snapshot,
                kind: TaskEventKind::Retry {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                },
            },
        );
    }

    pub fn get(&self, task_id: &TaskId) -> Option<UploadTask> {
        self.lock_state().tasks.get(task_id).cloned()
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.lock_state().tasks.get(task_id).map(|t| t.status)
    }

    /// Snapshot of every live task, oldest first.
    pub fn all_tasks(&self) -> Vec<UploadTask> {
        let mut tasks: Vec<UploadTask> = self.lock_state().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks
    }

    /// Per-status counts. `active` and `queued` are left at zero; the
    /// scheduler owns those numbers.
    pub fn stats(&self) -> TaskStats {
        let state = self.lock_state();
        let mut stats = TaskStats {
            total: state.tasks.len(),
            ..TaskStats::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Uploading => stats.uploading += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.lock_state().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every task that has not reached a terminal status.
    pub fn live_task_ids(&self) -> Vec<TaskId> {
        self.lock_state()
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.task_id.clone())
            .collect()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.lock_listeners();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Drop a terminal task from the live map.
    fn evict(&self, task_id: &TaskId) {
        let mut state = self.lock_state();
        let terminal = state
            .tasks
            .get(task_id)
            .is_some_and(|t| t.status.is_terminal());
        if !terminal {
            return;
        }
        let Some(task) = state.tasks.remove(task_id) else {
            return;
        };
        debug!(task_id = %task_id, status = %task.status, "task evicted");

        self.publish(
            state,
            TaskEvent {
                task_id: task_id.clone(),
                task,
                kind: TaskEventKind::Cleaned,
            },
        );
    }

    fn schedule_eviction(&self, task_id: TaskId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(task_id = %task_id, "no async runtime; terminal task will not be evicted");
            return;
        };
        let registry = self.me.clone();
        let grace = self.cleanup_grace;

        handle.spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(registry) = registry.upgrade() {
                registry.evict(&task_id);
            }
        });
    }

    /// Queue `event` and deliver everything queued so far.
    ///
    /// Takes the state guard so the event is queued under the same lock as
    /// the change it describes. A call from inside a listener only queues;
    /// the running delivery loop picks it up. Any other caller waits for the
    /// delivery lock, so its event is delivered before it returns.
    fn publish<'a>(&'a self, mut state: MutexGuard<'a, RegistryState>, event: TaskEvent) {
        state.outbox.push_back(event);
        let me = thread::current().id();
        if state.dispatcher == Some(me) {
            return;
        }
        drop(state);

        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.lock_state();
        state.dispatcher = Some(me);
        while let Some(event) = state.outbox.pop_front() {
            drop(state);
            self.deliver(&event);
            state = self.lock_state();
        }
        state.dispatcher = None;
    }

    fn deliver(&self, event: &TaskEvent) {
        let listeners: Vec<TaskListener> = self
            .lock_listeners()
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(task_id = %event.task_id, "task listener panicked; ignoring");
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .field("cleanup_grace", &self.cleanup_grace)
            .finish()
    }
}
