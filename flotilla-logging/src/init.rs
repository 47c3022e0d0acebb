use anyhow::{Context, Result};
use flotilla_config::{LogFormat, LoggingConfig};
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Name of the log file written when file logging is enabled
pub const LOG_FILE_NAME: &str = "flotilla.log";

/// Where console output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsoleTarget {
    #[default]
    Stdout,
    /// Used by worker processes, whose stdout is captured by the launcher
    Stderr,
}

/// Keeps the background file writer alive. Dropping it flushes pending
/// lines to disk.
#[must_use = "dropping the guard stops file logging"]
#[derive(Default)]
pub struct LoggingGuard {
    file_guard: Option<WorkerGuard>,
    log_file: Option<PathBuf>,
}

impl LoggingGuard {
    /// Path of the log file, when file logging is enabled
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn is_logging_to_file(&self) -> bool {
        self.file_guard.is_some()
    }
}

/// Build an env filter from an explicit level, falling back to `RUST_LOG`
/// and then to `info`
pub fn build_env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn console_layer<S, W>(
    format: LogFormat,
    writer: W,
    include_location: bool,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(include_location)
        .with_line_number(include_location);

    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Text => layer.boxed(),
    }
}

/// Assemble the subscriber without installing it
pub fn build_subscriber(
    config: &LoggingConfig,
    level_override: Option<&str>,
    target: ConsoleTarget,
    log_dir: Option<&Path>,
) -> Result<(impl Subscriber + Send + Sync + 'static, LoggingGuard)> {
    let level = level_override.unwrap_or_else(|| config.level.as_str());
    let env_filter = build_env_filter(level);

    let console = match target {
        ConsoleTarget::Stdout => {
            console_layer(config.format, std::io::stdout, config.include_location, true)
        }
        ConsoleTarget::Stderr => {
            console_layer(config.format, std::io::stderr, config.include_location, false)
        }
    };

    let mut guard = LoggingGuard::default();
    let file_layer = match log_dir {
        Some(dir) if config.log_to_file => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(LOG_FILE_NAME)
                .build(dir)
                .context("Failed to open log file")?;
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard.file_guard = Some(file_guard);
            guard.log_file = Some(dir.join(LOG_FILE_NAME));
            Some(console_layer(config.format, writer, config.include_location, false))
        }
        _ => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer);

    Ok((subscriber, guard))
}

/// Install the global subscriber described by the logging configuration.
///
/// Records emitted through the `log` facade by the lower crates are routed
/// into the same subscriber.
pub fn init_logging_from_config(
    config: &LoggingConfig,
    level_override: Option<&str>,
    target: ConsoleTarget,
    log_dir: Option<&Path>,
) -> Result<LoggingGuard> {
    let (subscriber, guard) = build_subscriber(config, level_override, target, log_dir)?;

    // Use try_init to avoid panic if global subscriber already set
    if subscriber.try_init().is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    if let Some(path) = guard.log_file() {
        tracing::debug!(log_file = %path.display(), "File logging enabled");
    }
    Ok(guard)
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<()> {
    let env_filter = build_env_filter(log_level);

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing for worker processes (output to stderr so that it
/// lands in the launcher's per-process log files)
pub fn init_worker_tracing(log_level: Option<&str>) -> Result<()> {
    let env_filter = match log_level {
        Some(level) => build_env_filter(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    tracing::debug!("Worker tracing initialized");
    Ok(())
}
