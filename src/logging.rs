//! Logging setup shared by the dispatcher and its workers.
//!
//! All output goes to stderr: a worker's stdout is its reply pipe. Workers
//! inherit stderr from the dispatcher, and the dispatcher forwards its filter
//! and format through [`LogConfig::worker_env`] so both sides log alike.
//!
//! # Environment Variables
//!
//! - `PROCFAN_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCFAN_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCFAN_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PROCFAN_LOG_FILE` - Path to log file (in addition to stderr, dispatcher only)
//! - `PROCFAN_LOG_ROTATION` - Log file rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use procfan::logging::{LogConfig, init};
//!
//! init(LogConfig::for_dispatcher().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Environment variable carrying the log filter.
pub const LOG_ENV: &str = "PROCFAN_LOG";
/// Environment variable carrying the log level.
pub const LOG_LEVEL_ENV: &str = "PROCFAN_LOG_LEVEL";
/// Environment variable carrying the log format.
pub const LOG_FORMAT_ENV: &str = "PROCFAN_LOG_FORMAT";
/// Environment variable carrying the log file path.
pub const LOG_FILE_ENV: &str = "PROCFAN_LOG_FILE";
/// Environment variable carrying the log file rotation.
pub const LOG_ROTATION_ENV: &str = "PROCFAN_LOG_ROTATION";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON, one object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Log rotation for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    pub format: LogFormat,
    /// Log file in addition to stderr
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_line_numbers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_line_numbers: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the dispatching process.
    pub fn for_dispatcher() -> Self {
        Self::default()
    }

    /// Preset for worker processes: compact lines, no file output.
    ///
    /// Apply [`with_env_overrides`](Self::with_env_overrides) afterwards to
    /// pick up whatever the dispatcher forwarded.
    pub fn for_worker() -> Self {
        Self::default().with_format(LogFormat::Compact)
    }

    /// Set the base level, dropping any filter so the level takes effect.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self.filter = None;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_line_numbers(mut self, enabled: bool) -> Self {
        self.show_line_numbers = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set is not replaced by `PROCFAN_LOG`, `RUST_LOG` or
    /// `PROCFAN_LOG_LEVEL`. The binary applies these before its command-line
    /// flags, so flags win.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var(LOG_ENV) {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var(LOG_LEVEL_ENV)
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var(LOG_FORMAT_ENV)
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Some(rotation) = std::env::var(LOG_ROTATION_ENV)
            .ok()
            .and_then(|r| r.parse().ok())
        {
            self.rotation = rotation;
        }

        self
    }

    /// The filter directive this configuration resolves to.
    pub fn filter_directive(&self) -> String {
        self.filter
            .clone()
            .unwrap_or_else(|| self.level.to_string().to_lowercase())
    }

    /// Environment for worker processes so they log like this process.
    ///
    /// The log file is deliberately not forwarded: workers write to the
    /// inherited stderr only.
    pub fn worker_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (LOG_ENV, self.filter_directive()),
            (LOG_FORMAT_ENV, self.format.to_string()),
        ]
    }

    fn build_filter(&self) -> EnvFilter {
        let directive = self.filter_directive();
        EnvFilter::try_new(&directive).unwrap_or_else(|_| {
            eprintln!("Warning: Invalid log filter '{}', using default", directive);
            EnvFilter::new(self.level.to_string().to_lowercase())
        })
    }
}

/// Parse a log level string.
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// One formatting layer for `config`, writing to `writer`.
fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_target(config.show_target)
        .with_ansi(ansi)
        .with_writer(writer);

    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer
            .compact()
            .with_line_number(config.show_line_numbers)
            .boxed(),
        LogFormat::Pretty => layer.with_line_number(config.show_line_numbers).boxed(),
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs to stderr, and also to `config.file_path` when set. Subsequent calls
/// are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(&config, std::io::stderr, true)];

    if let Some(path) = &config.file_path {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("procfan.log");
        let appender = RollingFileAppender::new(config.rotation.into(), parent, file_name);
        layers.push(fmt_layer(&config, appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
