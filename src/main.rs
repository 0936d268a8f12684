//! procfan - process-pool task dispatcher

mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use procfan::logging::{self, LogConfig};
use procfan::pool::WorkerCommand;
use procfan::{DispatchConfig, Dispatcher, tasks};
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::Level;

use cli::{Cli, Commands, RunArgs};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    // Worker processes never return from here.
    if let Commands::Run(args) = &cli.command
        && args.internal_worker
    {
        run_as_worker(args);
    }

    let log_config = log_config(&cli);
    logging::init(log_config.clone());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args, &log_config),
        Commands::Tasks => {
            cmd_tasks();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Resolve logging from the environment, then let CLI flags override it.
fn log_config(cli: &Cli) -> LogConfig {
    let mut config = LogConfig::for_dispatcher().with_env_overrides();

    if let Some(level) = cli.log_level {
        config = config.with_level(level);
    }
    if cli.quiet {
        config = config.with_level(Level::ERROR);
    } else if cli.verbose > 0 {
        let level = match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        config = config
            .with_level(level)
            .with_line_numbers(cli.verbose >= 3);
    }
    if let Some(filter) = &cli.log_filter {
        config = config.with_filter(filter.clone());
    }

    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    if let Some(rotation) = cli.log_rotation {
        config = config.with_rotation(rotation.into());
    }
    if cli.log_spans {
        config = config.with_span_events(true);
    }
    config
}

/// Serve as a pool worker for the task named in `args`.
fn run_as_worker(args: &RunArgs) -> ! {
    let mut config = LogConfig::for_worker().with_env_overrides();
    config.file_path = None;
    logging::init(config);

    match tasks::lookup(&args.task) {
        Some(task_fn) => procfan::run_worker(task_fn),
        None => {
            tracing::error!(task = %args.task, "Unknown task");
            std::process::exit(1);
        }
    }
}

fn read_tasks(args: &RunArgs) -> Result<Vec<Value>> {
    let raw = match &args.input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read tasks from stdin")?;
            buf
        }
    };

    serde_json::from_str::<Vec<Value>>(&raw).context("Input must be a JSON array of task values")
}

fn cmd_run(args: &RunArgs, log_config: &LogConfig) -> Result<()> {
    if tasks::lookup(&args.task).is_none() {
        bail!(
            "Unknown task '{}'. Run `procfan tasks` to list the built-in tasks",
            args.task
        );
    }

    let inputs = read_tasks(args)?;

    let mut worker = WorkerCommand::current_exe(&args.task)?;
    for (key, value) in log_config.worker_env() {
        worker = worker.env(key, value);
    }

    let config = DispatchConfig::new(worker)
        .with_pool_size(args.workers)
        .with_on_error(args.on_error.into())
        .with_halt_timeout(Duration::from_secs(args.halt_timeout));

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, halting workers...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl+C handler")?;

    let report = Dispatcher::new(config)
        .with_interrupt_flag(interrupted)
        .run(inputs)?;

    tracing::info!(
        tasks = report.stats.tasks,
        task_errors = report.stats.task_errors,
        elapsed_ms = report.stats.elapsed_ms as u64,
        "Run complete"
    );

    let output = if args.pretty {
        serde_json::to_string_pretty(&report.results)?
    } else {
        serde_json::to_string(&report.results)?
    };
    println!("{}", output);

    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&report.stats)?);
    }

    Ok(())
}

fn cmd_tasks() {
    for (name, description) in tasks::BUILTIN_TASKS {
        println!(
            "{} {}",
            format!("{:<10}", name).if_supports_color(Stdout, |text| text.bold()),
            description
        );
    }
}
