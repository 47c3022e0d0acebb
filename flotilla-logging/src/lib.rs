//! Logging setup for Flotilla processes
//!
//! The coordinator logs to stdout and, when enabled, to
//! `<output>/logs/flotilla.log`. Worker processes log to stderr, which the
//! launcher redirects into per-process files.

pub mod init;

pub use init::{
    build_env_filter, build_subscriber, init_logging_from_config, init_simple_tracing,
    init_worker_tracing, ConsoleTarget, LoggingGuard, LOG_FILE_NAME,
};
