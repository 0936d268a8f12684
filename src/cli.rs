//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use procfan::OnError;
use procfan::logging::{self, LogFormat, LogRotation};
use procfan::pool::default_pool_size;
use std::path::PathBuf;
use tracing::Level;

/// Fan JSON tasks out to a pool of worker processes.
#[derive(Parser, Debug)]
#[command(name = "procfan")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, value_parser = parse_log_level, global = true)]
    pub log_level: Option<Level>,

    /// Log filter directives (e.g. "procfan=debug"); overrides the level flags.
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Rotation for --log-file.
    #[arg(long, value_enum, global = true)]
    pub log_rotation: Option<LogRotationArg>,

    /// Log span timings when spans close.
    #[arg(long, global = true)]
    pub log_spans: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a built-in task over a JSON array of inputs.
    Run(RunArgs),

    /// List the built-in tasks.
    Tasks,
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Built-in task to run on every input (see `procfan tasks`).
    #[arg(short, long)]
    pub task: String,

    /// Number of worker processes.
    #[arg(short, long, env = "PROCFAN_WORKERS", default_value_t = default_pool_size())]
    pub workers: usize,

    /// What to do when a task fails.
    #[arg(long, value_enum, env = "PROCFAN_ON_ERROR", default_value_t = OnErrorArg::Continue)]
    pub on_error: OnErrorArg,

    /// File containing a JSON array of task inputs (default: stdin).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Pretty-print the results array.
    #[arg(long)]
    pub pretty: bool,

    /// Print run statistics as JSON to stderr.
    #[arg(long)]
    pub stats: bool,

    /// Seconds to wait for each worker to exit after halt before killing it.
    #[arg(long, default_value_t = 30)]
    pub halt_timeout: u64,

    /// Serve commands on stdin as a worker process.
    #[arg(long = "internal-worker", hide = true)]
    pub internal_worker: bool,
}

/// Error policy for CLI arguments.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnErrorArg {
    /// Stop the run at the first failing task.
    Break,
    /// Record failures as null and keep going.
    #[default]
    Continue,
}

impl From<OnErrorArg> for OnError {
    fn from(arg: OnErrorArg) -> Self {
        match arg {
            OnErrorArg::Break => OnError::Break,
            OnErrorArg::Continue => OnError::Continue,
        }
    }
}

/// Log format for CLI arguments.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Log file rotation for CLI arguments.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogRotationArg {
    Hourly,
    Daily,
    Never,
}

impl From<LogRotationArg> for LogRotation {
    fn from(arg: LogRotationArg) -> Self {
        match arg {
            LogRotationArg::Hourly => LogRotation::Hourly,
            LogRotationArg::Daily => LogRotation::Daily,
            LogRotationArg::Never => LogRotation::Never,
        }
    }
}

fn parse_log_level(s: &str) -> Result<Level, String> {
    logging::parse_level(s).ok_or_else(|| {
        format!(
            "Unknown log level: '{}'. Valid options: error, warn, info, debug, trace",
            s
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["procfan", "run", "--task", "double"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.task, "double");
                assert_eq!(args.on_error, OnErrorArg::Continue);
                assert_eq!(args.halt_timeout, 30);
                assert!(args.workers >= 1);
                assert!(args.input.is_none());
                assert!(!args.internal_worker);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_all_flags() {
        let cli = Cli::try_parse_from([
            "procfan",
            "-vv",
            "--log-format",
            "json",
            "run",
            "--task",
            "square",
            "--workers",
            "3",
            "--on-error",
            "break",
            "--input",
            "tasks.json",
            "--pretty",
            "--stats",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, Some(LogFormatArg::Json));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.workers, 3);
                assert_eq!(OnError::from(args.on_error), OnError::Break);
                assert_eq!(args.input, Some(PathBuf::from("tasks.json")));
                assert!(args.pretty);
                assert!(args.stats);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_internal_worker_flag_parses() {
        let cli = Cli::try_parse_from(["procfan", "run", "--internal-worker", "--task", "double"])
            .unwrap();
        match cli.command {
            Commands::Run(args) => assert!(args.internal_worker),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_log_flags() {
        let cli = Cli::try_parse_from([
            "procfan",
            "--log-level",
            "debug",
            "--log-file",
            "/tmp/procfan.log",
            "--log-rotation",
            "never",
            "--log-spans",
            "tasks",
        ])
        .unwrap();
        assert_eq!(cli.log_level, Some(Level::DEBUG));
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/procfan.log")));
        assert_eq!(cli.log_rotation, Some(LogRotationArg::Never));
        assert!(cli.log_spans);
        assert!(Cli::try_parse_from(["procfan", "--log-level", "loud", "tasks"]).is_err());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["procfan", "-q", "-v", "tasks"]).is_err());
    }

    #[test]
    fn test_task_is_required() {
        assert!(Cli::try_parse_from(["procfan", "run"]).is_err());
    }
}
