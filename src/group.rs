//! Task group: spawn named workers, then block on or drain their completion.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Result, TaskGroupError};
use crate::task::{TaskCell, TaskHandle, run_payload};
use crate::types::{Label, Outcome, Outcomes, Payload, TaskFailure};

/// A task the group has spawned but not yet collected.
struct PendingTask<T> {
    cell: Arc<TaskCell<T>>,
    thread: Option<thread::JoinHandle<()>>,
}

#[derive(Clone, Debug, Default)]
struct WorkerConfig {
    thread_name_prefix: Option<String>,
    stack_size: Option<usize>,
}

/// Configures a [`TaskGroup`] before any task is spawned.
pub struct TaskGroupBuilder<T> {
    config: WorkerConfig,
    _output: PhantomData<fn() -> T>,
}

impl<T> TaskGroupBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            _output: PhantomData,
        }
    }

    /// Prefix prepended to every worker thread name (`<prefix><label>`).
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Stack size in bytes for worker threads; platform default otherwise.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = Some(bytes);
        self
    }

    pub fn build(self) -> TaskGroup<T> {
        TaskGroup {
            config: self.config,
            labels: Vec::new(),
            cells: HashMap::new(),
            pending: Vec::new(),
            outcomes: Outcomes::default(),
            active: Arc::new(AtomicUsize::new(0)),
            sealed: false,
        }
    }
}

impl<T> Default for TaskGroupBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for TaskGroupBuilder<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            _output: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for TaskGroupBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroupBuilder")
            .field("thread_name_prefix", &self.config.thread_name_prefix)
            .field("stack_size", &self.config.stack_size)
            .finish()
    }
}

/// Owner and tracker of a batch of named tasks.
///
/// Each task runs on its own OS thread. The group itself is driven by a
/// single observer: `spawn`, `poll_all` and `wait_all` take `&mut self`.
/// Sharing one group between several observers requires wrapping it in a
/// `Mutex`; the group does no internal locking of its pending set.
pub struct TaskGroup<T> {
    config: WorkerConfig,
    // Spawn order; a task's index here is its ordinal.
    labels: Vec<Label>,
    cells: HashMap<Label, Arc<TaskCell<T>>>,
    pending: Vec<PendingTask<T>>,
    outcomes: Outcomes<T>,
    active: Arc<AtomicUsize>,
    sealed: bool,
}

impl<T: Send + 'static> TaskGroup<T> {
    /// Create an empty group with default worker settings.
    pub fn new() -> Self {
        TaskGroupBuilder::new().build()
    }

    pub fn builder() -> TaskGroupBuilder<T> {
        TaskGroupBuilder::new()
    }

    /// Launch `payload` on a new worker thread and return immediately.
    ///
    /// With `label` set to `None` a `task-<index>` label is synthesized.
    /// Fails with `DuplicateLabel` if the label is already used in this
    /// group and with `Sealed` once `wait_all` has returned; in both cases
    /// nothing is scheduled.
    pub fn spawn<P>(&mut self, label: Option<&str>, payload: P) -> Result<TaskHandle<T>>
    where
        P: Payload<T>,
    {
        if self.sealed {
            return Err(TaskGroupError::Sealed);
        }
        let label = match label {
            Some(label) => {
                if self.cells.contains_key(label) {
                    return Err(TaskGroupError::DuplicateLabel(label.to_string()));
                }
                label.to_string()
            }
            None => self.next_label(),
        };

        let ordinal = self.labels.len();
        let cell = Arc::new(TaskCell::new(
            label.clone(),
            ordinal,
            Arc::clone(&self.active),
        ));
        let mut builder = thread::Builder::new().name(self.thread_name(&label));
        if let Some(bytes) = self.config.stack_size {
            builder = builder.stack_size(bytes);
        }
        let worker_cell = Arc::clone(&cell);

        // Count the task before the worker can possibly finish it.
        self.active.fetch_add(1, Ordering::SeqCst);
        let thread = match builder.spawn(move || run_payload(&*worker_cell, payload)) {
            Ok(thread) => thread,
            Err(err) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                warn!(%label, error = %err, "failed to spawn worker thread");
                return Err(TaskGroupError::Spawn(err));
            }
        };

        debug!(%label, active = self.active_count(), "spawned task");
        self.cells.insert(label.clone(), Arc::clone(&cell));
        self.labels.push(label);
        self.pending.push(PendingTask {
            cell: Arc::clone(&cell),
            thread: Some(thread),
        });
        Ok(TaskHandle::new(cell))
    }

    /// Spawn with a synthesized `task-<index>` label.
    pub fn spawn_unlabeled<P>(&mut self, payload: P) -> Result<TaskHandle<T>>
    where
        P: Payload<T>,
    {
        self.spawn(None, payload)
    }

    /// Block until every task is terminal and return the full mapping.
    ///
    /// Seals the group. Calling it again returns the same mapping without
    /// waiting.
    pub fn wait_all(&mut self) -> &Outcomes<T> {
        if !self.sealed {
            for mut task in std::mem::take(&mut self.pending) {
                task.cell.wait();
                self.collect(&mut task);
            }
            self.sealed = true;
            debug!(
                tasks = self.outcomes.len(),
                failed = self.outcomes.failed(),
                "task group sealed"
            );
        }
        &self.outcomes
    }

    /// One fair sweep over the pending set.
    ///
    /// Every pending task gets at most `per_task_timeout` to finish; finished
    /// tasks are removed and their outcomes recorded. Returns how many are
    /// still pending. Call in a loop until it returns zero to drain.
    pub fn poll_all(&mut self, per_task_timeout: Duration) -> usize {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut task in std::mem::take(&mut self.pending) {
            match task.cell.wait_timeout(per_task_timeout) {
                Some(_) => {
                    debug!(label = task.cell.label(), "removed finished task");
                    self.collect(&mut task);
                }
                None => still_pending.push(task),
            }
        }
        self.pending = still_pending;
        self.pending.len()
    }

    /// Number of tasks not yet in a terminal state.
    ///
    /// Read without locking; a task finishing concurrently may or may not
    /// be reflected.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Total tasks spawned into this group.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Tasks spawned but not yet collected by `poll_all` or `wait_all`.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Labels in spawn order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }

    /// Handle to any task spawned into this group, finished or not.
    pub fn handle(&self, label: &str) -> Option<TaskHandle<T>> {
        self.cells.get(label).map(|cell| TaskHandle::new(Arc::clone(cell)))
    }

    /// Labels of tasks still pending or running, in spawn order.
    ///
    /// Like `active_count`, this is a snapshot that may lag tasks finishing
    /// concurrently.
    pub fn active_labels(&self) -> impl Iterator<Item = &str> {
        self.pending
            .iter()
            .filter(|task| !task.cell.state().is_terminal())
            .map(|task| task.cell.label())
    }

    /// Outcomes collected so far.
    pub fn outcomes(&self) -> &Outcomes<T> {
        &self.outcomes
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Wait for everything and hand the mapping over by value.
    pub fn into_outcomes(mut self) -> Outcomes<T> {
        self.wait_all();
        std::mem::take(&mut self.outcomes)
    }

    fn next_label(&self) -> Label {
        let mut index = self.labels.len();
        loop {
            let candidate = format!("task-{index}");
            if !self.cells.contains_key(&candidate) {
                return candidate;
            }
            index += 1;
        }
    }

    /// Worker thread name; NULs are replaced since OS thread names cannot hold them.
    fn thread_name(&self, label: &str) -> String {
        let name = match &self.config.thread_name_prefix {
            Some(prefix) => format!("{prefix}{label}"),
            None => label.to_string(),
        };
        name.replace('\0', "\u{FFFD}")
    }

    /// Record a terminal task's outcome and reap its thread.
    fn collect(&mut self, task: &mut PendingTask<T>) {
        let label = task.cell.label().to_string();
        if let Some(thread) = task.thread.take() {
            // The worker only publishes and exits after completion.
            if thread.join().is_err() {
                warn!(%label, "worker thread panicked after publishing");
            }
        }
        let outcome = task.cell.take_outcome().unwrap_or_else(|| {
            Outcome::Failed(TaskFailure::Panicked("outcome missing".to_string()))
        });
        self.outcomes.insert(task.cell.ordinal(), label, outcome);
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TaskGroup<T> {
    fn drop(&mut self) {
        // Dropping abandons pending tasks; their threads keep running detached.
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "task group abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, InstantClock, SystemClock};
    use crate::types::TaskState;
    use std::collections::BTreeSet;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Barrier, mpsc};
    use std::time::Instant;

    fn ok<T>(value: T) -> std::result::Result<T, Infallible> {
        Ok(value)
    }

    #[test]
    fn wait_all_collects_every_instant_task() {
        for n in [0usize, 1, 5, 32] {
            let mut group: TaskGroup<usize> = TaskGroup::new();
            for i in 0..n {
                group.spawn_unlabeled(move || ok(i)).expect("spawn");
            }
            let outcomes = group.wait_all();
            assert_eq!(outcomes.len(), n);
            assert_eq!(outcomes.completed(), n);
            for i in 0..n {
                let label = format!("task-{i}");
                assert_eq!(outcomes.get(&label), Some(&Outcome::Completed(i)));
            }
        }
    }

    #[test]
    fn active_count_tracks_gated_tasks() {
        let tasks = 4;
        let gate = Arc::new(Barrier::new(tasks + 1));
        let mut group: TaskGroup<()> = TaskGroup::new();
        for i in 0..tasks {
            let gate = Arc::clone(&gate);
            group
                .spawn(Some(format!("gated-{i}").as_str()), move || {
                    gate.wait();
                    ok(())
                })
                .expect("spawn");
        }
        // No task can finish before the barrier releases.
        assert_eq!(group.active_count(), tasks);
        gate.wait();
        group.wait_all();
        assert_eq!(group.active_count(), 0);
    }

    #[test]
    fn drain_matches_wait_all_labels() {
        let build = || {
            let mut group: TaskGroup<u64> = TaskGroup::new();
            for i in 0..6u64 {
                group
                    .spawn(Some(format!("t{i}").as_str()), move || {
                        thread::sleep(Duration::from_millis(5 * (i % 3)));
                        ok(i)
                    })
                    .expect("spawn");
            }
            group
        };

        let mut waited = build();
        let expected: BTreeSet<String> =
            waited.wait_all().labels().map(str::to_string).collect();

        let mut drained = build();
        let mut sweeps = 0;
        while drained.poll_all(Duration::from_millis(1)) > 0 {
            sweeps += 1;
            assert!(sweeps < 10_000, "drain did not terminate");
        }
        let observed: BTreeSet<String> =
            drained.outcomes().labels().map(str::to_string).collect();
        assert_eq!(observed, expected);
        assert_eq!(drained.pending(), 0);
        assert_eq!(drained.active_count(), 0);
    }

    #[test]
    fn duplicate_label_is_rejected_and_not_scheduled() {
        let ran = Arc::new(AtomicBool::new(false));
        let mut group: TaskGroup<i32> = TaskGroup::new();
        group.spawn(Some("dup"), || ok(1)).expect("spawn");

        let ran_clone = Arc::clone(&ran);
        let err = group
            .spawn(Some("dup"), move || {
                ran_clone.store(true, Ordering::SeqCst);
                ok(2)
            })
            .expect_err("duplicate label accepted");
        assert!(matches!(err, TaskGroupError::DuplicateLabel(ref l) if l == "dup"));

        let outcomes = group.wait_all();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes.get("dup"), Some(&Outcome::Completed(1)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn failures_do_not_cancel_siblings() {
        let mut group: TaskGroup<&'static str> = TaskGroup::new();
        group.spawn(Some("ok-a"), || ok("a")).expect("spawn");
        group
            .spawn(Some("err"), || Err::<&'static str, _>("bad input"))
            .expect("spawn");
        group
            .spawn(Some("panic"), || -> std::result::Result<&'static str, Infallible> {
                panic!("worker blew up")
            })
            .expect("spawn");
        group.spawn(Some("ok-b"), || ok("b")).expect("spawn");

        let outcomes = group.wait_all();
        assert_eq!(outcomes.completed(), 2);
        assert_eq!(outcomes.failed(), 2);
        assert_eq!(
            outcomes.get("err"),
            Some(&Outcome::Failed(TaskFailure::Error("bad input".to_string())))
        );
        assert_eq!(
            outcomes.get("panic"),
            Some(&Outcome::Failed(TaskFailure::Panicked(
                "worker blew up".to_string()
            )))
        );
        assert_eq!(outcomes.get("ok-b"), Some(&Outcome::Completed("b")));
    }

    #[test]
    fn five_tasks_finish_within_max_injected_delay() {
        let unit = Duration::from_millis(20);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(unit));
        let delays = [0u32, 3, 1, 2, 3];
        let mut group: TaskGroup<u32> = TaskGroup::new();
        let start = Instant::now();
        for (i, &units) in delays.iter().enumerate() {
            let clock = Arc::clone(&clock);
            group
                .spawn(Some(format!("t{i}").as_str()), move || {
                    clock.sleep_units(units);
                    ok(units)
                })
                .expect("spawn");
        }
        let outcomes = group.wait_all();
        let elapsed = start.elapsed();

        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes.completed(), 5);
        let labels: Vec<&str> = outcomes.labels().collect();
        assert_eq!(labels, vec!["t0", "t1", "t2", "t3", "t4"]);
        assert!(elapsed >= unit * 3);
        // Tasks overlap, so the batch costs the longest delay, not the sum.
        assert!(elapsed < unit * 3 + Duration::from_millis(500));
    }

    #[test]
    fn injected_instant_clock_records_requested_delays() {
        let clock = Arc::new(InstantClock::new());
        let mut group: TaskGroup<()> = TaskGroup::new();
        for units in 0..4u32 {
            let clock = Arc::clone(&clock);
            group
                .spawn_unlabeled(move || {
                    clock.sleep_units(units);
                    ok(())
                })
                .expect("spawn");
        }
        assert_eq!(group.wait_all().completed(), 4);
        let mut requested = clock.requested();
        requested.sort_unstable();
        assert_eq!(requested, vec![0, 1, 2, 3]);
    }

    #[test]
    fn wait_all_is_idempotent_and_seals() {
        let mut group: TaskGroup<i32> = TaskGroup::new();
        group.spawn(Some("only"), || ok(5)).expect("spawn");
        let first = group.wait_all().clone();
        let second = group.wait_all().clone();
        assert_eq!(first, second);
        assert!(group.is_sealed());

        let err = group
            .spawn(Some("late"), || ok(6))
            .expect_err("sealed group accepted a task");
        assert!(matches!(err, TaskGroupError::Sealed));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn wait_all_keeps_outcomes_already_drained() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut group: TaskGroup<i32> = TaskGroup::new();
        group.spawn(Some("fast"), || ok(0)).expect("spawn");
        group
            .spawn(Some("slow"), move || {
                release_rx.recv().map(|_| 1).map_err(|e| e.to_string())
            })
            .expect("spawn");

        let mut remaining = group.poll_all(Duration::from_millis(50));
        while group.outcomes().get("fast").is_none() {
            remaining = group.poll_all(Duration::from_millis(50));
        }
        assert_eq!(remaining, 1);

        release_tx.send(()).expect("release slow task");
        let outcomes = group.wait_all();
        let labels: Vec<&str> = outcomes.labels().collect();
        assert_eq!(labels, vec!["fast", "slow"]);
    }

    #[test]
    fn poll_all_with_zero_timeout_does_not_block() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut group: TaskGroup<()> = TaskGroup::new();
        let handle = group
            .spawn(Some("blocked"), move || {
                release_rx.recv().map_err(|e| e.to_string())
            })
            .expect("spawn");

        let start = Instant::now();
        assert_eq!(group.poll_all(Duration::ZERO), 1);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(handle.join_timeout(Duration::from_millis(10)), None);

        release_tx.send(()).expect("release");
        assert_eq!(handle.join(), TaskState::Completed);
        assert_eq!(group.poll_all(Duration::ZERO), 0);
    }

    #[test]
    fn synthesized_labels_skip_explicit_ones() {
        let mut group: TaskGroup<()> = TaskGroup::new();
        group.spawn(Some("task-1"), || ok(())).expect("spawn");
        let a = group.spawn_unlabeled(|| ok(())).expect("spawn");
        let b = group.spawn_unlabeled(|| ok(())).expect("spawn");
        assert_eq!(a.label(), "task-2");
        assert_eq!(b.label(), "task-3");
        assert_eq!(group.wait_all().len(), 3);
    }

    #[test]
    fn worker_threads_are_named_after_labels() {
        let mut group = TaskGroup::<Option<String>>::builder()
            .thread_name_prefix("worker-")
            .build();
        group
            .spawn(Some("hello-0"), || {
                ok(thread::current().name().map(str::to_string))
            })
            .expect("spawn");
        let outcomes = group.wait_all();
        assert_eq!(
            outcomes.get("hello-0"),
            Some(&Outcome::Completed(Some("worker-hello-0".to_string())))
        );
    }

    #[test]
    fn label_with_nul_spawns_and_keeps_counter_exact() {
        let mut group: TaskGroup<Option<String>> = TaskGroup::new();
        let handle = group
            .spawn(Some("a\0b"), || ok(thread::current().name().map(str::to_string)))
            .expect("spawn");
        assert_eq!(handle.label(), "a\0b");
        assert_eq!(group.len(), 1);

        let outcomes = group.wait_all();
        assert_eq!(
            outcomes.get("a\0b"),
            Some(&Outcome::Completed(Some("a\u{FFFD}b".to_string())))
        );
        assert_eq!(group.active_count(), 0);
    }

    #[test]
    fn many_instant_tasks_collect_quickly_in_spawn_order() {
        let tasks = 1000;
        let mut group: TaskGroup<usize> = TaskGroup::new();
        for i in 0..tasks {
            group.spawn_unlabeled(move || ok(i)).expect("spawn");
        }
        let start = Instant::now();
        let outcomes = group.wait_all();
        // Collection itself must stay cheap once the threads are done.
        assert!(start.elapsed() < Duration::from_secs(10));
        let values: Vec<usize> = outcomes
            .iter()
            .filter_map(|(_, outcome)| outcome.value().copied())
            .collect();
        assert_eq!(values, (0..tasks).collect::<Vec<_>>());
    }

    #[test]
    fn handle_lookup_covers_pending_and_collected_tasks() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut group: TaskGroup<()> = TaskGroup::builder().build();
        group.spawn(Some("done"), || ok(())).expect("spawn");
        group
            .spawn(Some("held"), move || release_rx.recv().map_err(|e| e.to_string()))
            .expect("spawn");

        let done = group.handle("done").expect("handle for done");
        assert_eq!(done.join(), TaskState::Completed);
        while !group.outcomes().contains("done") {
            group.poll_all(Duration::from_millis(10));
        }
        // Still reachable after the group collected it.
        assert_eq!(
            group.handle("done").map(|h| h.state()),
            Some(TaskState::Completed)
        );

        let held = group.handle("held").expect("handle for held");
        assert_eq!(held.join_timeout(Duration::from_millis(10)), None);
        assert!(group.handle("missing").is_none());

        release_tx.send(()).expect("release");
        group.wait_all();
        assert_eq!(held.state(), TaskState::Completed);
    }

    #[test]
    fn active_labels_lists_only_live_tasks() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut group: TaskGroup<()> = TaskGroup::new();
        let quick = group.spawn(Some("quick"), || ok(())).expect("spawn");
        group
            .spawn(Some("gated"), move || release_rx.recv().map_err(|e| e.to_string()))
            .expect("spawn");

        quick.join();
        let live: Vec<&str> = group.active_labels().collect();
        assert_eq!(live, vec!["gated"]);

        release_tx.send(()).expect("release");
        group.wait_all();
        assert_eq!(group.active_labels().count(), 0);
    }

    #[test]
    fn into_outcomes_waits_for_gated_tasks() {
        let tasks = 3;
        let gate = Arc::new(Barrier::new(tasks + 1));
        let mut group: TaskGroup<usize> = TaskGroup::new();
        for i in 0..tasks {
            let gate = Arc::clone(&gate);
            group
                .spawn_unlabeled(move || {
                    gate.wait();
                    ok(i)
                })
                .expect("spawn");
        }
        assert_eq!(group.pending(), tasks);

        let releaser = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                gate.wait();
            })
        };
        let outcomes: Vec<(Label, Outcome<usize>)> = group.into_outcomes().into_iter().collect();
        releaser.join().expect("releaser thread panicked");

        assert_eq!(outcomes.len(), tasks);
        assert_eq!(outcomes[0], ("task-0".to_string(), Outcome::Completed(0)));
        assert_eq!(outcomes[2], ("task-2".to_string(), Outcome::Completed(2)));
    }

    #[test]
    fn builder_stack_size_is_applied_to_workers() {
        let mut group = TaskGroup::<u64>::builder()
            .stack_size(4 * 1024 * 1024)
            .build();
        // Deep enough recursion to need more than a tiny stack.
        fn depth(n: u64) -> u64 {
            let buf = [n as u8; 512];
            if n == 0 { u64::from(buf[0]) } else { 1 + depth(n - 1) }
        }
        group.spawn(Some("deep"), || ok(depth(2000))).expect("spawn");
        assert_eq!(
            group.wait_all().get("deep"),
            Some(&Outcome::Completed(2000))
        );
    }
}
