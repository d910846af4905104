//! `taskpilot` CLI: plan features into task graphs and run an agent through them.
//!
//! State lives under `<project>/.taskpilot/`. Exit codes are listed in
//! [`taskpilot::exit_codes`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use taskpilot::agents::planner::{AgentPlanner, codebase_context};
use taskpilot::core::types::{RunConfig, RunMode, RunStop};
use taskpilot::error::RunError;
use taskpilot::exit_codes;
use taskpilot::io::config::{TaskpilotConfig, config_path, load_config, write_config};
use taskpilot::io::context::{CommandRecall, NoRecall, Recall};
use taskpilot::io::executor::ProcessExecutor;
use taskpilot::io::gates::ShellGateRunner;
use taskpilot::io::git::{Git, VersionControl};
use taskpilot::io::store::FileStore;
use taskpilot::logging;
use taskpilot::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings, RunOutcome};
use taskpilot::plan::{PlanOutcome, generate_plan, import_plan};
use taskpilot::status::{list_runs, run_status};
use taskpilot::task::TaskStatus;
use taskpilot::validate::validate_document;

/// Set by the signal watcher; polled while a run is in flight.
static INTERRUPT_REQUESTED: AtomicBool = AtomicBool::new(false);
const INTERRUPT_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(
    name = "taskpilot",
    version,
    about = "Validate task graphs and drive a coding agent through them"
)]
struct Cli {
    /// Project root (holds `.taskpilot/`).
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `.taskpilot/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Generate a document and task set from a feature description.
    Generate { description: String },
    /// Store an existing document with decomposer output (a JSON task array).
    Parse {
        #[arg(long)]
        document: PathBuf,
        #[arg(long)]
        tasks: PathBuf,
    },
    /// Check a stored task set and print its execution order.
    Validate {
        doc: String,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Execute the task set of a document.
    Run(RunArgs),
    /// Show a run and the current state of its tasks.
    Status { run: String },
    /// List every recorded run.
    List,
}

#[derive(clap::Args)]
struct RunArgs {
    doc: String,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Parallel attempts in team mode.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Continue the latest run of this document.
    #[arg(long)]
    resume: bool,
    /// Run only this task; its dependencies are assumed done.
    #[arg(long)]
    task: Option<String>,
    /// Validate and print the plan without running anything.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Work on a dedicated `<prefix><run_id>` branch.
    #[arg(long)]
    branch: bool,
    #[arg(long)]
    model: Option<String>,
    /// With --resume: resume even a run that already finished.
    #[arg(long)]
    force: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Loop,
    Team,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Loop => RunMode::Loop,
            ModeArg::Team => RunMode::Team,
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    let root = cli.project.as_path();
    match cli.command {
        Command::Init { force } => cmd_init(root, force),
        Command::Generate { description } => cmd_generate(root, &description),
        Command::Parse { document, tasks } => cmd_parse(root, &document, &tasks),
        Command::Validate { doc, concurrency } => cmd_validate(root, &doc, concurrency),
        Command::Run(args) => cmd_run(root, args),
        Command::Status { run } => cmd_status(root, &run),
        Command::List => cmd_list(root),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let path = config_path(root);
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &TaskpilotConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_generate(root: &Path, description: &str) -> Result<i32> {
    let config = load_project_config(root)?;
    let executor =
        ProcessExecutor::new(config.agent.command.clone(), config.agent.output_limit_bytes)?;
    let planner = AgentPlanner::new(&executor, &config.agent, root);
    let store = FileStore::for_project(root);
    let codebase = codebase_context(root);
    let plan = generate_plan(
        &store,
        &planner,
        &planner,
        description,
        &codebase,
        config.max_attempts_default,
    )
    .map_err(with_hint)?;
    print_plan(&plan);
    Ok(exit_codes::OK)
}

fn cmd_parse(root: &Path, document: &Path, tasks: &Path) -> Result<i32> {
    let config = load_project_config(root)?;
    let body = fs::read_to_string(document)
        .with_context(|| format!("read document {}", document.display()))?;
    let raw = fs::read_to_string(tasks)
        .with_context(|| format!("read task output {}", tasks.display()))?;
    let store = FileStore::for_project(root);
    let plan = import_plan(&store, &body, &raw, config.max_attempts_default)
        .map_err(with_hint)?;
    print_plan(&plan);
    Ok(exit_codes::OK)
}

fn cmd_validate(root: &Path, doc: &str, concurrency: Option<usize>) -> Result<i32> {
    let config = load_project_config(root)?;
    let store = FileStore::for_project(root);
    let report = validate_document(&store, doc, concurrency.unwrap_or(config.concurrency))?;

    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if !report.is_valid() {
        for error in &report.errors {
            println!("error: {error}");
        }
        return Ok(exit_codes::INVALID);
    }
    println!("{} tasks, valid", report.task_count);
    println!("order: {}", report.order.join(" -> "));
    print_waves(&report.waves);
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, args: RunArgs) -> Result<i32> {
    let config = load_project_config(root)?;
    let run_config = RunConfig {
        mode: args.mode.map(RunMode::from).unwrap_or(config.mode),
        concurrency: args.concurrency.unwrap_or(config.concurrency),
        resume: args.resume,
        task_filter: args.task,
        dry_run: args.dry_run,
        max_iterations: args.max_iterations.unwrap_or(config.max_iterations),
        use_branch: args.branch,
        model_override: args.model,
        force: args.force,
    };

    let executor =
        ProcessExecutor::new(config.agent.command.clone(), config.agent.output_limit_bytes)?;
    let gates = ShellGateRunner {
        timeout: config.gate_timeout(),
        output_limit_bytes: config.gate_output_limit_bytes,
    };
    let recall: Box<dyn Recall> = if config.recall.enabled() {
        Box::new(CommandRecall::new(
            config.recall.command.clone(),
            root,
            config.recall_timeout(),
        )?)
    } else {
        Box::new(NoRecall)
    };
    let store = FileStore::for_project(root);
    let git = Git::new(root);
    let vcs = git.is_repo().then_some(&git as &dyn VersionControl);

    let orchestrator = Orchestrator::new(
        Collaborators {
            executor: &executor,
            gates: &gates,
            recall: recall.as_ref(),
            store: &store,
            vcs,
        },
        OrchestratorSettings::from_config(&config, root),
    );

    watch_interrupts();
    let finished = AtomicBool::new(false);
    let result = thread::scope(|scope| {
        scope.spawn(|| {
            while !finished.load(Ordering::SeqCst) {
                if INTERRUPT_REQUESTED.load(Ordering::SeqCst) {
                    orchestrator.abort();
                    return;
                }
                thread::sleep(INTERRUPT_POLL);
            }
        });
        let result = orchestrator.run(&args.doc, &run_config);
        finished.store(true, Ordering::SeqCst);
        result
    });

    let outcome = result.map_err(with_hint)?;
    print_outcome(&outcome);
    Ok(outcome_exit_code(&outcome))
}

fn cmd_status(root: &Path, run_id: &str) -> Result<i32> {
    let store = FileStore::for_project(root);
    print!("{}", run_status(&store, run_id)?.render());
    Ok(exit_codes::OK)
}

fn cmd_list(root: &Path) -> Result<i32> {
    let store = FileStore::for_project(root);
    let runs = list_runs(&store)?;
    if runs.is_empty() {
        println!("no runs recorded");
    }
    for run in runs {
        println!(
            "{}  {}  {:<9}  {}",
            run.id,
            run.doc_id,
            run.status.as_str(),
            run.started_at.to_rfc3339()
        );
    }
    Ok(exit_codes::OK)
}

fn load_project_config(root: &Path) -> Result<TaskpilotConfig> {
    load_config(&config_path(root))
}

/// Point users at `--resume` after a mid-run storage failure.
fn with_hint(err: anyhow::Error) -> anyhow::Error {
    match err.downcast_ref::<RunError>() {
        Some(RunError::Storage(_)) => {
            err.context("run aborted; continue with `taskpilot run <doc> --resume`")
        }
        _ => err,
    }
}

fn outcome_exit_code(outcome: &RunOutcome) -> i32 {
    if outcome.stop.is_interrupted() {
        exit_codes::INTERRUPTED
    } else if outcome.count(TaskStatus::Failed) > 0 {
        exit_codes::TASKS_FAILED
    } else {
        exit_codes::OK
    }
}

fn print_plan(plan: &PlanOutcome) {
    println!("{}  {}", plan.doc_id, plan.title);
    for warning in &plan.warnings {
        println!("warning: {warning}");
    }
    for task in &plan.tasks {
        let deps = if task.depends_on.is_empty() {
            String::new()
        } else {
            let deps: Vec<&str> = task.depends_on.iter().map(String::as_str).collect();
            format!("  (after {})", deps.join(", "))
        };
        println!("  {} {}{deps}", task.id, task.title);
    }
}

fn print_waves(waves: &[Vec<String>]) {
    for (idx, wave) in waves.iter().enumerate() {
        println!("wave {}: {}", idx + 1, wave.join(", "));
    }
}

fn print_outcome(outcome: &RunOutcome) {
    if outcome.stop == RunStop::DryRun {
        println!("dry run: {} tasks", outcome.outcomes.len());
        println!("order: {}", outcome.order.join(" -> "));
        print_waves(&outcome.waves);
        return;
    }
    if let Some(run_id) = &outcome.run_id {
        println!("run {run_id}");
    }
    for task in &outcome.outcomes {
        println!(
            "  {} {} ({} attempts)",
            task.task_id,
            task.status.as_str(),
            task.attempts
        );
    }
    let stop = match outcome.stop {
        RunStop::Finished => "finished",
        RunStop::DryRun => "dry run",
        RunStop::Aborted => "aborted",
        RunStop::IterationLimit => "stopped at the iteration limit",
        RunStop::Stalled => "stalled",
    };
    println!(
        "{stop}: {} completed, {} failed, {} skipped in {:.1}s",
        outcome.count(TaskStatus::Completed),
        outcome.count(TaskStatus::Failed),
        outcome.count(TaskStatus::Skipped),
        outcome.duration_ms as f64 / 1000.0
    );
}

/// Route SIGINT/SIGTERM to a watcher thread. A second signal exits at once.
///
/// Must run before any other thread is spawned so every thread inherits the
/// blocked mask; child processes get a clean mask from `std::process`.
#[cfg(unix)]
fn watch_interrupts() {
    use nix::sys::signal::{SigSet, Signal};

    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    if let Err(err) = signals.thread_block() {
        tracing::warn!(err = %err, "could not install interrupt handling");
        return;
    }
    thread::spawn(move || {
        while let Ok(signal) = signals.wait() {
            if INTERRUPT_REQUESTED.swap(true, Ordering::SeqCst) {
                std::process::exit(exit_codes::INTERRUPTED);
            }
            eprintln!("{signal:?} received; stopping agents (again to exit now)");
        }
    });
}

#[cfg(not(unix))]
fn watch_interrupts() {}
