//! CLI argument parsing definitions

use clap::{Args, Parser, Subcommand};
use flotilla_config::LauncherKind;
use flotilla_execution::DisplayFilter;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Map an operation over a task list with a pool of distributed workers
    Run(RunArgs),

    /// Start a remote worker and register it with a running pool
    Worker {
        /// Endpoint of the pool (tcp://host:port); may be repeated
        #[arg(long = "pool", value_name = "ENDPOINT", required = true)]
        pool: Vec<String>,

        /// Seconds without work before the worker shuts itself down
        #[arg(long, value_name = "SECS")]
        idle_timeout: Option<u64>,

        /// Address the worker's RPC server binds to
        #[arg(long, value_name = "ADDR")]
        bind_address: Option<String>,

        /// Host advertised to the pool instead of the detected addresses
        #[arg(long, value_name = "HOST")]
        advertise_host: Option<String>,
    },

    /// Run an encoded launch job (internal use)
    #[command(hide = true)]
    RunJob {
        #[arg(long, value_name = "BASE64")]
        job: String,
    },

    /// List the jobs mapped through a running pool
    Query(QueryArgs),

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Number of workers to launch
    #[arg(short = 'N', long = "distributionNodeCount", value_name = "N")]
    pub node_count: Option<u32>,

    /// Launch every worker remotely and keep this node free of tasks
    #[arg(long = "distributionUseDedicatedCoordinatorNode")]
    pub dedicated_coordinator: bool,

    /// Seconds a remote worker may sit idle before it exits
    #[arg(long = "distributedNodeIdleTimeout", value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Directory for results, logs and the run summary
    #[arg(short = 'o', long = "outputDirectory", value_name = "PATH")]
    pub output_directory: Option<PathBuf>,

    /// Coordinate in this process instead of launching a coordinator
    #[arg(long = "localCoordinator")]
    pub local_coordinator: bool,

    /// JSON or YAML file listing the tasks
    #[arg(long, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// A task input given inline (JSON, or plain text); may be repeated
    #[arg(long = "task", value_name = "INPUT", conflicts_with = "manifest")]
    pub tasks: Vec<String>,

    /// Operation the workers run on each task
    #[arg(long, value_name = "NAME")]
    pub operation: Option<String>,

    /// How workers are started: in_process, subprocess or slurm
    #[arg(long, value_name = "KIND")]
    pub launcher: Option<LauncherKind>,

    /// Attempts per task before its error is reported
    #[arg(long = "maxAttempts", value_name = "N")]
    pub max_attempts: Option<u32>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Endpoint of the pool (tcp://host:port)
    #[arg(value_name = "ENDPOINT")]
    pub endpoint: String,

    /// Which jobs to list: all, running, completed, incomplete or errors
    #[arg(short, long, value_name = "FILTER", default_value = "all")]
    pub display: DisplayFilter,

    /// List at most this many jobs
    #[arg(short, long, value_name = "N")]
    pub max: Option<usize>,

    /// Only list jobs whose label matches this regex
    #[arg(short, long, value_name = "REGEX")]
    pub list: Option<String>,

    /// Print each job's full task input
    #[arg(long)]
    pub show_descriptions: bool,

    /// Seconds to wait for the pool to answer
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub timeout: u64,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Generate a sample configuration file
    Generate {
        /// Output file path; prints to stdout when absent
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "flotilla",
            "run",
            "-N",
            "4",
            "--distributionUseDedicatedCoordinatorNode",
            "--distributedNodeIdleTimeout",
            "120",
            "-o",
            "out",
            "--localCoordinator",
            "--launcher",
            "slurm",
            "--maxAttempts",
            "3",
            "--task",
            "a",
            "--task",
            r#"{"name": "b"}"#,
        ])
        .unwrap();

        let Some(Commands::Run(args)) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.node_count, Some(4));
        assert!(args.dedicated_coordinator);
        assert_eq!(args.idle_timeout, Some(120));
        assert_eq!(args.output_directory, Some(PathBuf::from("out")));
        assert!(args.local_coordinator);
        assert_eq!(args.launcher, Some(LauncherKind::Slurm));
        assert_eq!(args.max_attempts, Some(3));
        assert_eq!(args.tasks.len(), 2);
    }

    #[test]
    fn test_manifest_conflicts_with_tasks() {
        let result = Cli::try_parse_from(["flotilla", "run", "--manifest", "t.yaml", "--task", "a"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_query_flags() {
        let cli = Cli::try_parse_from([
            "flotilla",
            "query",
            "tcp://10.0.0.5:4000",
            "--display",
            "e",
            "--max",
            "5",
            "--list",
            "^sample",
        ])
        .unwrap();

        let Some(Commands::Query(args)) = cli.command else {
            panic!("expected query command");
        };
        assert_eq!(args.endpoint, "tcp://10.0.0.5:4000");
        assert_eq!(args.display, DisplayFilter::Errors);
        assert_eq!(args.max, Some(5));
        assert_eq!(args.list.as_deref(), Some("^sample"));
        assert!(!args.show_descriptions);
    }

    #[test]
    fn test_worker_needs_pool() {
        assert!(Cli::try_parse_from(["flotilla", "worker"]).is_err());
        let cli = Cli::try_parse_from(["flotilla", "worker", "--pool", "tcp://h:1", "--pool", "tcp://h2:1"]).unwrap();
        match cli.command {
            Some(Commands::Worker { pool, .. }) => assert_eq!(pool.len(), 2),
            _ => panic!("expected worker command"),
        }
    }
}
