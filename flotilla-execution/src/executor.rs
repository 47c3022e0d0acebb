//! Top-level orchestration of a distributed run

use flotilla_config::FlotillaConfig;
use flotilla_core::ClosedError;
use flotilla_resilience::{AggregateError, Scoped};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::ExecutionError;
use crate::factory::DistributedPoolFactory;
use crate::launcher::{build_launcher, CoordinatorJob, InProcessLauncher, LaunchJob, LaunchOutcome};
use crate::master::Master;
use crate::node_runner::NodeRunner;
use crate::operations::OperationRegistry;
use crate::output_dir::OutputDirStructure;
use crate::pool::PoolOptions;
use crate::task::TaskResult;

/// File under `results/` holding one JSON line per task
pub const RESULTS_FILE: &str = "results.jsonl";

/// What [`MasterWorkerExecutor::run`] did
#[derive(Debug)]
pub enum RunReport {
    /// Coordinated in this process; results are in task order
    Completed {
        output_dir: PathBuf,
        results: Vec<TaskResult>,
    },
    /// Coordination was handed to a launcher
    Launched {
        output_dir: PathBuf,
        outcome: LaunchOutcome,
    },
}

impl RunReport {
    pub fn output_dir(&self) -> &Path {
        match self {
            RunReport::Completed { output_dir, .. } | RunReport::Launched { output_dir, .. } => output_dir,
        }
    }

    /// Failed tasks, or a failed coordinator launch
    pub fn failures(&self) -> usize {
        match self {
            RunReport::Completed { results, .. } => results.iter().filter(|r| r.is_err()).count(),
            RunReport::Launched { outcome, .. } => usize::from(!outcome.is_success()),
        }
    }
}

#[derive(Serialize)]
struct ResultLine<'a> {
    index: usize,
    input: &'a JsonValue,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn write_results(path: &Path, tasks: &[JsonValue], results: &[TaskResult]) -> Result<(), ExecutionError> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for (index, (input, result)) in tasks.iter().zip(results).enumerate() {
        let line = match result {
            Ok(value) => ResultLine {
                index,
                input,
                status: "succeeded",
                value: Some(value),
                error: None,
            },
            Err(e) => ResultLine {
                index,
                input,
                status: "failed",
                value: None,
                error: Some(e.to_string()),
            },
        };
        serde_json::to_writer(&mut file, &line)?;
        file.write_all(b"\n")?;
    }
    file.flush()?;
    Ok(())
}

/// Gets tasks from a [`Master`], builds the distributed pool and maps the
/// configured operation over the tasks
#[derive(Debug, Clone)]
pub struct MasterWorkerExecutor {
    config: FlotillaConfig,
    registry: OperationRegistry,
}

impl MasterWorkerExecutor {
    pub fn new(config: FlotillaConfig) -> Self {
        let registry = OperationRegistry::with_builtins(config.coordinator.command.clone());
        Self { config, registry }
    }

    /// Operations available to in-process workers and coordinators
    pub fn with_registry(mut self, registry: OperationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &FlotillaConfig {
        &self.config
    }

    pub async fn run(&self, master: &dyn Master) -> Result<RunReport, ExecutionError> {
        let output = OutputDirStructure::create(&self.config.output.directory, self.config.output.make_unique)?;
        info!(output = %output.root().display(), "Created output directory");

        let tasks = master.tasks(&output)?;
        info!(tasks = tasks.len(), "Master produced task list");

        if self.config.coordinator.local_coordinator {
            let results = self.coordinate(&output, tasks).await?;
            return Ok(RunReport::Completed {
                output_dir: output.root().to_path_buf(),
                results,
            });
        }

        let launcher = build_launcher(
            &self.config.launcher,
            self.stdio_dir(&output)?,
            NodeRunner::new(self.registry.clone()),
        )?;
        let job = LaunchJob::Coordinator(CoordinatorJob {
            config: self.config.clone(),
            output_dir: output.root().to_path_buf(),
            tasks,
        });
        info!(launcher = launcher.name(), "Launching coordinator");
        let outcome = launcher.launch(job).await?.wait().await?;
        if !outcome.is_success() {
            warn!(?outcome, "Coordinator did not complete");
        }
        Ok(RunReport::Launched {
            output_dir: output.root().to_path_buf(),
            outcome,
        })
    }

    fn stdio_dir(&self, output: &OutputDirStructure) -> Result<PathBuf, ExecutionError> {
        match &self.config.launcher.stdio_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Ok(dir.clone())
            }
            None => Ok(output.logs_subdir("stdio")?),
        }
    }

    /// Build the pool, run the tasks and close the pool. Runs in whichever
    /// process coordinates.
    pub async fn coordinate(
        &self,
        output: &OutputDirStructure,
        tasks: Vec<JsonValue>,
    ) -> Result<Vec<TaskResult>, ExecutionError> {
        let runner = NodeRunner::new(self.registry.clone());
        let remote = build_launcher(&self.config.launcher, self.stdio_dir(output)?, runner.clone())?;
        let local = InProcessLauncher::new(runner);

        let distribution = &self.config.distribution;
        let factory = DistributedPoolFactory::new(distribution.clone())
            .with_command(self.config.coordinator.command.clone());
        let options = PoolOptions::new(distribution.max_attempts).with_output_dir(output.root());
        let pool = factory.create(options, remote.as_ref(), &local).await?;

        let operation = &self.config.coordinator.operation;
        info!(operation = %operation, tasks = tasks.len(), "Mapping tasks");
        let mapped = pool.map(operation, tasks.clone()).await;
        let closed = pool.close().await;
        finish_run(&output.results().join(RESULTS_FILE), &tasks, mapped, closed)
    }
}

/// Record the results of a map, then report a failed pool close. The
/// results file is written whenever the map itself returned.
fn finish_run(
    path: &Path,
    tasks: &[JsonValue],
    mapped: Result<Vec<TaskResult>, ClosedError>,
    closed: Result<(), AggregateError>,
) -> Result<Vec<TaskResult>, ExecutionError> {
    let results = mapped?;
    let failed = results.iter().filter(|r| r.is_err()).count();
    info!(succeeded = results.len() - failed, failed, "Run finished");

    write_results(path, tasks, &results)?;
    if let Err(aggregate) = closed {
        warn!("Pool closed with errors after the run: {}", aggregate);
        return Err(aggregate.into());
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::{RunError, TaskError};
    use serde_json::json;

    #[test]
    fn test_results_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        let tasks = vec![json!("a"), json!({"name": "b"})];
        let results: Vec<TaskResult> = vec![
            Ok(json!("A")),
            Err(RunError::Task(TaskError::new("exit status 2"))),
        ];
        write_results(&path, &tasks, &results).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<JsonValue> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], json!({"index": 0, "input": "a", "status": "succeeded", "value": "A"}));
        assert_eq!(lines[1]["status"], "failed");
        assert_eq!(lines[1]["input"]["name"], "b");
        assert!(lines[1]["error"].as_str().unwrap().contains("exit status 2"));
    }

    #[test]
    fn test_results_written_when_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        let tasks = vec![json!(1), json!(2)];
        let closed = Err(AggregateError::new(
            "distributed pool",
            vec![anyhow::anyhow!("worker handle did not finish")],
        ));

        let err = finish_run(&path, &tasks, Ok(vec![Ok(json!(1)), Ok(json!(4))]), closed).unwrap_err();
        assert!(matches!(err, ExecutionError::Shutdown(_)));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().nth(1).unwrap().contains("\"value\":4"));
    }

    #[test]
    fn test_nothing_written_when_map_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RESULTS_FILE);
        let err = finish_run(&path, &[json!(1)], Err(ClosedError::new("worker pool")), Ok(())).unwrap_err();
        assert!(matches!(err, ExecutionError::Closed(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_report_failures() {
        let report = RunReport::Launched {
            output_dir: PathBuf::from("out"),
            outcome: LaunchOutcome::Exited { code: Some(1) },
        };
        assert_eq!(report.failures(), 1);
        assert_eq!(report.output_dir(), Path::new("out"));

        let report = RunReport::Completed {
            output_dir: PathBuf::from("out"),
            results: vec![Ok(json!(1)), Err(RunError::Task(TaskError::new("no")))],
        };
        assert_eq!(report.failures(), 1);
    }
}
