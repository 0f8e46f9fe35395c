use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use tempo::admission::{AdmissionController, LimitInput, StaticSnapshot, SystemSnapshot};
use tempo::core::{PlanValidator, TaskPlan};
use tempo::orchestration::{
    DagExecutor, ExecutionEvent, ExecutorConfig, TaskContext, TaskFailure,
};
use tempo::{Config, Result};

/// Tempo - dependency-aware task plan executor
#[derive(Parser, Debug)]
#[command(name = "tempo")]
#[command(version, about, long_about = None)]
#[command(after_help = concat!(
    "ENVIRONMENT:\n",
    "    TEMPO_DEBUG=1                 Enable debug logging (alternative to --debug)\n",
    "    TEMPO_LOG=<filter>            Tracing filter directive, e.g. tempo=trace\n",
    "    TEMPO_PROFILE=stable|default  Runtime profile\n",
    "    TEMPO_PREEMPTION=1            Allow priority preemption\n",
    "    TEMPO_WEIGHTED_SCHEDULING=1   Order equal priorities by graph weight",
))]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a plan file (JSON or TOML) and print errors, warnings and stats
    Validate {
        plan: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute a plan with a simulated runner
    Run {
        plan: PathBuf,

        /// Simulated work per task, in milliseconds
        #[arg(long, default_value_t = 50)]
        delay_ms: u64,

        /// Task IDs that should fail (repeatable)
        #[arg(long = "fail")]
        fail: Vec<String>,

        /// Admission provider the run is dispatched under
        #[arg(long, default_value = tempo::admission::LOCAL_PROVIDER)]
        provider: String,

        #[arg(long, default_value = "default")]
        model: String,
    },

    /// Show how the effective concurrency limit is derived
    Limits {
        #[arg(long)]
        provider: String,

        #[arg(long)]
        model: String,

        #[arg(long)]
        tier: Option<String>,

        /// Executor instances sharing the provider budget
        #[arg(long)]
        instances: Option<u32>,

        /// Process-level ceiling on concurrent tasks
        #[arg(long)]
        hard_limit: Option<u32>,

        /// Scheduling adjustment in [-1, 1]
        #[arg(long, allow_hyphen_values = true)]
        adjustment: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tempo::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    tracing::debug!(profile = %config.profile, "tempo starting");

    match cli.command {
        Command::Validate { plan, json } => run_validate(&config, plan, json),
        Command::Run {
            plan,
            delay_ms,
            fail,
            provider,
            model,
        } => run_plan(&config, plan, delay_ms, fail, LimitInput::new(provider, model)),
        Command::Limits {
            provider,
            model,
            tier,
            instances,
            hard_limit,
            adjustment,
        } => {
            let mut input = LimitInput::new(provider, model);
            input.tier = tier;
            let snapshot = if instances.is_some() || hard_limit.is_some() || adjustment.is_some() {
                Some(SystemSnapshot {
                    hard_limit,
                    active_instances: instances,
                    scheduling_adjustment: adjustment,
                })
            } else {
                None
            };
            run_limits(&config, input, snapshot)
        }
    }
}

fn run_validate(config: &Config, path: PathBuf, json: bool) -> Result<()> {
    let mut plan = TaskPlan::load(&path)?;
    let report = PlanValidator::new(config.validation.clone()).validate_and_annotate(&mut plan);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Plan {} ({} tasks): {}",
            plan.id,
            plan.len(),
            if report.valid { "valid" } else { "INVALID" }
        );
        for error in &report.errors {
            println!("  error:   {}", error);
        }
        for warning in &report.warnings {
            println!("  warning: {}", warning);
        }
        if report.valid {
            println!(
                "  stats:   {} tasks, {} parallelizable, max depth {}, ~{}s estimated",
                report.stats.total_tasks,
                report.stats.parallelizable_tasks,
                plan.metadata.max_depth,
                plan.metadata.total_estimated_secs
            );
        }
    }

    if report.valid {
        Ok(())
    } else {
        Err(tempo::Error::InvalidPlan(report.errors))
    }
}

fn run_plan(
    config: &Config,
    path: PathBuf,
    delay_ms: u64,
    fail: Vec<String>,
    input: LimitInput,
) -> Result<()> {
    let plan = TaskPlan::load(&path)?;
    let admission = Arc::new(AdmissionController::from_config(config));
    let executor = DagExecutor::new(
        &plan,
        ExecutorConfig::from_config(config).with_limit_input(input),
        admission,
    )?;

    let failing: Arc<HashSet<String>> = Arc::new(fail.into_iter().collect());
    let delay = Duration::from_millis(delay_ms);

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let mut events = executor.subscribe();
        let printer = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ExecutionEvent::TaskStarted { task_id, attempt } => {
                        eprintln!("  -> {} (attempt {})", task_id, attempt)
                    }
                    ExecutionEvent::TaskCompleted { task_id } => eprintln!("  ok {}", task_id),
                    ExecutionEvent::TaskFailed { task_id, error, .. } => {
                        eprintln!("  !! {}: {}", task_id, error)
                    }
                    ExecutionEvent::TaskRetrying { task_id, delay, .. } => {
                        eprintln!("  .. {} retrying in {}ms", task_id, delay.as_millis())
                    }
                    ExecutionEvent::TaskPreempted { task_id, by } => {
                        eprintln!("  << {} preempted by {}", task_id, by)
                    }
                    ExecutionEvent::RunFinished { .. } => break,
                }
            }
        });

        let ctrl_c = executor.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctrl_c.cancel();
            }
        });

        let result = executor
            .run(move |ctx: TaskContext| {
                let failing = Arc::clone(&failing);
                async move {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(TaskFailure::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if failing.contains(ctx.id.as_str()) {
                        return Err(TaskFailure::msg(format!("forced failure of {}", ctx.id)));
                    }
                    Ok(serde_json::json!({
                        "task": ctx.id.to_string(),
                        "attempt": ctx.attempt,
                    }))
                }
            })
            .await;
        if result.is_err() {
            printer.abort();
        }
        let _ = printer.await;
        result
    })?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_limits(config: &Config, input: LimitInput, snapshot: Option<SystemSnapshot>) -> Result<()> {
    let mut controller = AdmissionController::from_config(config);
    if let Some(snapshot) = snapshot {
        controller = controller.with_snapshot_provider(Arc::new(StaticSnapshot(snapshot)));
    }
    let breakdown = controller.effective_limit(&input);
    println!("{}", serde_json::to_string_pretty(&breakdown)?);
    Ok(())
}
