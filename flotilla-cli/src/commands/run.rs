//! `flotilla run`

use anyhow::{Context, Result};
use flotilla_config::{FlotillaConfig, LauncherKind};
use flotilla_execution::{
    ManifestMaster, Master, MasterWorkerExecutor, OutputDirStructure, RunReport, StaticMaster,
};
use flotilla_logging::{init_logging_from_config, ConsoleTarget};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{info, warn};

use crate::cli::RunArgs;

/// Command line flags take precedence over the file and the environment
pub fn apply_overrides(config: &mut FlotillaConfig, args: &RunArgs) {
    if let Some(count) = args.node_count {
        config.distribution.worker_count = count;
    }
    if args.dedicated_coordinator {
        config.distribution.use_dedicated_coordinator = true;
    }
    if let Some(seconds) = args.idle_timeout {
        config.distribution.idle_timeout = Duration::from_secs(seconds);
    }
    if let Some(attempts) = args.max_attempts {
        config.distribution.max_attempts = attempts;
    }
    if let Some(dir) = &args.output_directory {
        config.output.directory = dir.clone();
    }
    if args.local_coordinator {
        config.coordinator.local_coordinator = true;
    }
    if let Some(manifest) = &args.manifest {
        config.coordinator.manifest = Some(manifest.clone());
    }
    if let Some(operation) = &args.operation {
        config.coordinator.operation = operation.clone();
    }
    if let Some(kind) = args.launcher {
        config.launcher.kind = kind;
    }
}

/// An inline task: JSON when it parses, plain text otherwise
pub fn parse_task(text: &str) -> JsonValue {
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

/// Launched processes re-run this binary, so its path is fixed once here
fn resolve_executable(config: &mut FlotillaConfig) -> Result<()> {
    if config.launcher.executable.is_none() && config.launcher.kind != LauncherKind::InProcess {
        let exe = std::env::current_exe().context("Failed to resolve the flotilla executable")?;
        config.launcher.executable = Some(exe);
    }
    Ok(())
}

fn build_master(config: &FlotillaConfig, args: &RunArgs) -> Result<Box<dyn Master>> {
    if !args.tasks.is_empty() {
        return Ok(Box::new(StaticMaster::new(args.tasks.iter().map(|t| parse_task(t)).collect())));
    }
    match ManifestMaster::from_config(&config.coordinator) {
        Some(master) => Ok(Box::new(master)),
        None => Err(anyhow::anyhow!(
            "No tasks given. Pass --manifest <PATH> or one or more --task <INPUT>"
        )),
    }
}

pub async fn run_command(mut config: FlotillaConfig, args: &RunArgs, log_level: Option<&str>) -> Result<()> {
    apply_overrides(&mut config, args);
    config.validate_all().context("Invalid configuration")?;
    resolve_executable(&mut config)?;
    let master = build_master(&config, args)?;

    // Fix the output directory now so the log file lands inside it
    let output = OutputDirStructure::create(&config.output.directory, config.output.make_unique)
        .with_context(|| format!("Failed to create output directory {}", config.output.directory.display()))?;
    config.output.directory = output.root().to_path_buf();
    config.output.make_unique = false;

    let _guard = init_logging_from_config(&config.logging, log_level, ConsoleTarget::Stdout, Some(output.logs().as_path()))?;
    info!(
        workers = config.distribution.worker_count,
        launcher = %config.launcher.kind,
        operation = %config.coordinator.operation,
        output = %output.root().display(),
        "Starting run"
    );

    let executor = MasterWorkerExecutor::new(config);
    let report = executor
        .run(master.as_ref())
        .await
        .context("Run failed")?;

    match &report {
        RunReport::Completed { results, output_dir } => {
            println!(
                "Finished {} tasks ({} failed). Output in {}",
                results.len(),
                report.failures(),
                output_dir.display()
            );
        }
        RunReport::Launched { outcome, output_dir } => {
            println!("Coordinator finished: {:?}. Output in {}", outcome, output_dir.display());
        }
    }

    if report.failures() > 0 {
        warn!(failures = report.failures(), "Run finished with failures");
        anyhow::bail!("{} task(s) failed", report.failures());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn test_overrides() {
        let mut config = FlotillaConfig::default();
        let args = RunArgs {
            node_count: Some(8),
            dedicated_coordinator: true,
            idle_timeout: Some(30),
            output_directory: Some(PathBuf::from("/scratch/run")),
            operation: Some("command".to_string()),
            launcher: Some(LauncherKind::Slurm),
            max_attempts: Some(4),
            ..Default::default()
        };
        apply_overrides(&mut config, &args);

        assert_eq!(config.distribution.worker_count, 8);
        assert!(config.distribution.use_dedicated_coordinator);
        assert_eq!(config.distribution.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.distribution.max_attempts, 4);
        assert_eq!(config.output.directory, PathBuf::from("/scratch/run"));
        assert_eq!(config.coordinator.operation, "command");
        assert_eq!(config.launcher.kind, LauncherKind::Slurm);
        assert!(!config.coordinator.local_coordinator);
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let mut config = FlotillaConfig::default();
        config.distribution.worker_count = 3;
        config.coordinator.local_coordinator = true;
        apply_overrides(&mut config, &RunArgs::default());
        assert_eq!(config.distribution.worker_count, 3);
        assert!(config.coordinator.local_coordinator);
    }

    #[test]
    fn test_parse_task() {
        assert_eq!(parse_task(r#"{"name": "s1"}"#), json!({"name": "s1"}));
        assert_eq!(parse_task("7"), json!(7));
        assert_eq!(parse_task("reads_1.fq"), json!("reads_1.fq"));
    }

    #[test]
    fn test_executable_resolution() {
        let mut config = FlotillaConfig::default();
        config.launcher.kind = LauncherKind::InProcess;
        resolve_executable(&mut config).unwrap();
        assert!(config.launcher.executable.is_none());

        config.launcher.kind = LauncherKind::Subprocess;
        resolve_executable(&mut config).unwrap();
        assert!(config.launcher.executable.is_some());
    }

    #[test]
    fn test_master_needs_tasks() {
        let config = FlotillaConfig::default();
        assert!(build_master(&config, &RunArgs::default()).is_err());

        let args = RunArgs {
            tasks: vec!["a".to_string()],
            ..Default::default()
        };
        assert!(build_master(&config, &args).is_ok());
    }
}
