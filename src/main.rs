mod sim;

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use sim::{DemoOptions, WaitMode};

/// Launch named worker threads as a group and wait for all of them.
///
/// Without a subcommand the demo runs, taking the same flags as `demo`.
#[derive(Parser, Debug)]
#[command(name = "taskgroup", version, about, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    demo: DemoArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run hello/goodbye tasks with random delays (default).
    Demo(DemoArgs),
    /// Time a single batch of sleeping tasks and print a CSV row.
    Bench {
        /// Number of tasks to spawn.
        #[arg(long, default_value_t = 64)]
        tasks: usize,
        /// Simulated work per task, in milliseconds.
        #[arg(long, default_value_t = 5)]
        work_ms: u64,
        #[arg(long, value_enum, default_value_t = WaitMode::Wait)]
        mode: WaitMode,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Sweep several task counts across both wait modes.
    Stress {
        /// Comma-separated task counts, e.g. 1,8,32.
        #[arg(long, value_delimiter = ',')]
        task_sets: Option<Vec<usize>>,
        #[arg(long, default_value_t = 5)]
        work_ms: u64,
        #[command(flatten)]
        poll: PollArgs,
    },
}

#[derive(Args, Debug)]
struct PollArgs {
    /// Per-task join timeout for poll mode, in milliseconds.
    #[arg(long, default_value_t = 100)]
    poll_timeout_ms: u64,
}

impl PollArgs {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Tasks per greeting (hello and goodbye each get this many).
    #[arg(long, default_value_t = 5)]
    tasks: usize,
    #[arg(long, value_enum, default_value_t = WaitMode::Poll)]
    mode: WaitMode,
    /// Length of one delay unit; tasks sleep 0-3 units.
    #[arg(long, env = "TASKGROUP_UNIT_MS", default_value_t = 1000)]
    unit_ms: u64,
    /// Label of a task that should fail instead of greeting (repeatable).
    #[arg(long)]
    fail: Vec<String>,
    /// Seed for the delay generator, for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,
    #[command(flatten)]
    poll: PollArgs,
}

fn main() {
    taskgroup::logging::init();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Bench {
            tasks,
            work_ms,
            mode,
            poll,
        }) => sim::run_benchmark(tasks, work_ms, mode, poll.timeout()),
        Some(Command::Stress {
            task_sets,
            work_ms,
            poll,
        }) => sim::run_stress(task_sets, work_ms, poll.timeout()),
        Some(Command::Demo(args)) => run_demo(args),
        None => run_demo(cli.demo),
    }
}

fn run_demo(args: DemoArgs) {
    sim::run_demo(DemoOptions {
        tasks: args.tasks,
        mode: args.mode,
        unit: Duration::from_millis(args.unit_ms),
        poll_timeout: args.poll.timeout(),
        fail: args.fail,
        seed: args.seed,
    });
}
