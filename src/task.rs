//! Per-task completion cell shared between a worker thread and its observers.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{trace, warn};

use crate::types::{Label, Outcome, Payload, TaskFailure, TaskState};

struct TaskSlot<T> {
    state: TaskState,
    outcome: Option<Outcome<T>>,
}

/// Shared state of one task. The worker writes it exactly once on
/// completion; observers block on `done` until the state is terminal.
pub(crate) struct TaskCell<T> {
    label: Label,
    // Position in spawn order within the owning group.
    ordinal: usize,
    slot: Mutex<TaskSlot<T>>,
    done: Condvar,
    // Group-wide count of non-terminal tasks.
    active: Arc<AtomicUsize>,
}

impl<T> TaskCell<T> {
    pub(crate) fn new(label: Label, ordinal: usize, active: Arc<AtomicUsize>) -> Self {
        Self {
            label,
            ordinal,
            slot: Mutex::new(TaskSlot {
                state: TaskState::Pending,
                outcome: None,
            }),
            done: Condvar::new(),
            active,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub(crate) fn state(&self) -> TaskState {
        self.slot.lock().expect("task slot mutex poisoned").state
    }

    fn mark_running(&self) {
        let mut guard = self.slot.lock().expect("task slot mutex poisoned");
        debug_assert_eq!(guard.state, TaskState::Pending, "task started twice");
        guard.state = TaskState::Running;
        trace!(label = %self.label, "task running");
    }

    fn finish(&self, outcome: Outcome<T>) {
        let mut guard = self.slot.lock().expect("task slot mutex poisoned");
        debug_assert!(!guard.state.is_terminal(), "task finished twice");
        guard.state = outcome.state();
        guard.outcome = Some(outcome);
        // Decrement before waking observers so a joined task is never counted.
        self.active.fetch_sub(1, Ordering::SeqCst);
        trace!(label = %self.label, state = %guard.state, "task finished");
        self.done.notify_all();
    }

    /// Block until the task is terminal.
    pub(crate) fn wait(&self) -> TaskState {
        let guard = self.slot.lock().expect("task slot mutex poisoned");
        let guard = self
            .done
            .wait_while(guard, |slot| !slot.state.is_terminal())
            .expect("condvar wait failed");
        guard.state
    }

    /// Block for at most `timeout`; `None` if the task is still live.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<TaskState> {
        let guard = self.slot.lock().expect("task slot mutex poisoned");
        let (guard, _) = self
            .done
            .wait_timeout_while(guard, timeout, |slot| !slot.state.is_terminal())
            .expect("condvar wait failed");
        guard.state.is_terminal().then_some(guard.state)
    }

    /// Move the recorded outcome out; `None` before completion or if taken.
    pub(crate) fn take_outcome(&self) -> Option<Outcome<T>> {
        self.slot
            .lock()
            .expect("task slot mutex poisoned")
            .outcome
            .take()
    }
}

/// Worker body: run the payload, contain any failure, publish the outcome.
pub(crate) fn run_payload<T, P>(cell: &TaskCell<T>, payload: P)
where
    P: Payload<T>,
{
    cell.mark_running();
    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| payload.run())) {
        Ok(Ok(value)) => Outcome::Completed(value),
        Ok(Err(reason)) => {
            warn!(label = %cell.label, %reason, "task failed");
            Outcome::Failed(TaskFailure::Error(reason))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(label = %cell.label, %message, "task panicked");
            Outcome::Failed(TaskFailure::Panicked(message))
        }
    };
    cell.finish(outcome);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Caller-side handle to a spawned task.
///
/// Handles only observe; the outcome itself is collected by the owning
/// [`crate::TaskGroup`].
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(cell: Arc<TaskCell<T>>) -> Self {
        Self { cell }
    }

    pub fn label(&self) -> &str {
        self.cell.label()
    }

    /// Snapshot of the task's current state.
    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until the task reaches a terminal state.
    pub fn join(&self) -> TaskState {
        self.cell.wait()
    }

    /// Wait at most `timeout`; returns the terminal state if reached.
    pub fn join_timeout(&self, timeout: Duration) -> Option<TaskState> {
        self.cell.wait_timeout(timeout)
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("label", &self.label())
            .field("state", &self.state())
            .finish()
    }
}
