//! Demo, benchmark, and stress runners driving a task group.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use taskgroup::{Clock, Outcome, Outcomes, SystemClock, TaskGroup};

// Upper bound of the random per-task delay, in clock units.
const MAX_DELAY_UNITS: u32 = 3;
// Sweep size used by stress when no sets are given.
const DEFAULT_TASK_SETS: [usize; 4] = [1, 8, 32, 128];

/// How the caller waits for the group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum WaitMode {
    /// Block in `wait_all` until every task is done.
    Wait,
    /// Drain with repeated `poll_all` sweeps.
    Poll,
}

impl WaitMode {
    fn as_str(self) -> &'static str {
        match self {
            WaitMode::Wait => "wait",
            WaitMode::Poll => "poll",
        }
    }
}

/// Settings for [`run_demo`].
#[derive(Clone, Debug)]
pub struct DemoOptions {
    pub tasks: usize,
    pub mode: WaitMode,
    pub unit: Duration,
    pub poll_timeout: Duration,
    pub fail: Vec<String>,
    pub seed: Option<u64>,
}

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    // SAFETY: rusage is plain old data; getrusage fills it in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Some((seconds(usage.ru_utime), seconds(usage.ru_stime)))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Drain `group`, printing each task as it is removed from the pending set.
fn drain<T: Send + 'static>(group: &mut TaskGroup<T>, timeout: Duration) -> usize {
    let mut reported: HashSet<String> = HashSet::new();
    let mut sweeps = 0;
    loop {
        let remaining = group.poll_all(timeout);
        sweeps += 1;
        for label in group.outcomes().labels() {
            if reported.insert(label.to_string()) {
                println!("\tRemoved {label}");
            }
        }
        if remaining == 0 {
            return sweeps;
        }
        let live: Vec<&str> = group.active_labels().collect();
        debug!(remaining, ?live, "tasks still running");
    }
}

fn print_outcomes<T: Display>(outcomes: &Outcomes<T>, active: usize) {
    println!("GROUP SUMMARY");
    println!("tasks={}", outcomes.len());
    println!("completed={}", outcomes.completed());
    println!("failed={}", outcomes.failed());
    println!("active={active}");
    for (label, outcome) in outcomes.iter() {
        match outcome {
            Outcome::Completed(value) => println!("{label}=completed ({value})"),
            Outcome::Failed(failure) => println!("{label}=failed ({failure})"),
        }
    }
}

/// Spawn hello/goodbye tasks with random delays and report their outcomes.
pub fn run_demo(options: DemoOptions) {
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(options.unit));
    let fail: HashSet<String> = options.fail.iter().cloned().collect();
    let mut group: TaskGroup<String> = TaskGroup::builder()
        .thread_name_prefix("demo-")
        .build();

    info!(
        tasks = options.tasks * 2,
        mode = options.mode.as_str(),
        unit_ms = clock.unit().as_secs_f64() * 1000.0,
        "demo start"
    );
    for greeting in ["Hello", "Goodbye"] {
        for n in 0..options.tasks {
            let label = format!("{}-{n}", greeting.to_lowercase());
            let units = rng.gen_range(0..=MAX_DELAY_UNITS);
            let should_fail = fail.contains(&label);
            let clock = Arc::clone(&clock);
            let spawned = group.spawn(Some(label.as_str()), move || {
                clock.sleep_units(units);
                if should_fail {
                    return Err(format!("{n} {greeting} refused"));
                }
                let line = format!("{n} {greeting}!");
                println!("{line}");
                Ok(line)
            });
            if let Err(err) = spawned {
                eprintln!("demo error: {err}");
                return;
            }
            debug!(%label, units, "queued demo task");
        }
    }
    for label in &options.fail {
        if !group.labels().any(|l| l == label) {
            eprintln!("demo warning: no task labelled {label}");
        }
    }

    let start = Instant::now();
    if options.mode == WaitMode::Poll {
        let sweeps = drain(&mut group, options.poll_timeout);
        debug!(sweeps, "drain finished");
    }
    group.wait_all();
    info!(elapsed_s = start.elapsed().as_secs_f64(), "demo finished");

    print_outcomes(group.outcomes(), group.active_count());
    println!("*** DONE! ***");
}

/// Aggregated metrics from a single benchmark run.
struct BenchResult {
    tasks: usize,
    mode: WaitMode,
    elapsed_ms: f64,
    throughput: f64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    max_active: usize,
    completed: usize,
    failed: usize,
}

fn benchmark_once(tasks: usize, work_ms: u64, mode: WaitMode, poll_timeout: Duration) -> BenchResult {
    debug_assert!(tasks > 0, "tasks must be > 0");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(Duration::from_millis(work_ms)));
    let mut group: TaskGroup<u64> = TaskGroup::builder()
        .thread_name_prefix("bench-")
        .build();

    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    let mut max_active = 0;
    for id in 0..tasks as u64 {
        let clock = Arc::clone(&clock);
        let spawned = group.spawn_unlabeled(move || {
            clock.sleep_units(1);
            Ok::<_, std::convert::Infallible>(id)
        });
        if let Err(err) = spawned {
            eprintln!("# warning,spawn_failed,{err}");
            break;
        }
        max_active = max_active.max(group.active_count());
    }
    if mode == WaitMode::Poll {
        while group.poll_all(poll_timeout) > 0 {}
    }
    let outcomes = group.wait_all();

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let throughput = if elapsed_ms > 0.0 {
        outcomes.len() as f64 / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    BenchResult {
        tasks,
        mode,
        elapsed_ms,
        throughput,
        cpu_user_s,
        cpu_sys_s,
        max_active,
        completed: outcomes.completed(),
        failed: outcomes.failed(),
    }
}

const BENCH_HEADER: &str =
    "tasks,mode,elapsed_ms,throughput_tasks_per_s,cpu_user_s,cpu_sys_s,max_active,completed,failed";

fn print_bench_row(result: &BenchResult) {
    let cpu = |v: Option<f64>| v.map(|v| format!("{v:.4}")).unwrap_or_else(|| "NA".to_string());
    println!(
        "{},{},{:.2},{:.2},{},{},{},{},{}",
        result.tasks,
        result.mode.as_str(),
        result.elapsed_ms,
        result.throughput,
        cpu(result.cpu_user_s),
        cpu(result.cpu_sys_s),
        result.max_active,
        result.completed,
        result.failed
    );
    if result.completed != result.tasks {
        eprintln!(
            "# warning,incomplete,{}/{}",
            result.completed, result.tasks
        );
    }
}

/// Run a single benchmark and print one CSV row.
pub fn run_benchmark(tasks: usize, work_ms: u64, mode: WaitMode, poll_timeout: Duration) {
    if tasks == 0 {
        eprintln!("benchmark error: tasks must be > 0");
        return;
    }
    println!("{BENCH_HEADER}");
    print_bench_row(&benchmark_once(tasks, work_ms, mode, poll_timeout));
}

/// Sweep task counts across both wait modes and print CSV output.
pub fn run_stress(task_sets: Option<Vec<usize>>, work_ms: u64, poll_timeout: Duration) {
    let mut task_sets = task_sets.unwrap_or_else(|| DEFAULT_TASK_SETS.to_vec());
    let before = task_sets.len();
    task_sets.retain(|&tasks| tasks > 0);
    let dropped = before - task_sets.len();
    if dropped > 0 {
        eprintln!("stress warning: ignored {dropped} task set(s) <= 0");
    }
    if task_sets.is_empty() {
        eprintln!("stress error: task_sets must be > 0");
        return;
    }

    println!("{BENCH_HEADER}");
    for tasks in task_sets {
        for mode in [WaitMode::Wait, WaitMode::Poll] {
            print_bench_row(&benchmark_once(tasks, work_ms, mode, poll_timeout));
        }
    }
}
