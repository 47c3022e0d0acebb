//! Launchers: start a job in-process, in a child process or as a batch job
//!
//! A [`LaunchJob`] is plain data. Subprocess and batch launchers hand it to
//! `<executable> run-job --job <base64 JSON>`, where a [`NodeRunner`] picks it
//! up again.

use async_trait::async_trait;
use base64::Engine;
use flotilla_config::{serde_duration, CommandTemplate, DistributionConfig, FlotillaConfig, LauncherConfig, LauncherKind, SlurmConfig};
use flotilla_ipc::ServerOptions;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ExecutionError, LaunchError};
use crate::node_runner::NodeRunner;
use crate::server::RemoteWorkerOptions;

/// Subcommand of the flotilla binary that runs an encoded job
pub const RUN_JOB_SUBCOMMAND: &str = "run-job";

/// Start a remote worker server and register it with a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWorkerJob {
    pub pool_endpoints: Vec<String>,
    #[serde(with = "serde_duration")]
    pub idle_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub rpc_timeout: Duration,
    #[serde(with = "serde_duration")]
    pub heartbeat_interval: Duration,
    pub bind_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
    /// Template of the `command` operation, when the run uses it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandTemplate>,
}

impl RemoteWorkerJob {
    pub fn new(
        pool_endpoints: Vec<String>,
        distribution: &DistributionConfig,
        command: Option<CommandTemplate>,
    ) -> Self {
        Self {
            pool_endpoints,
            idle_timeout: distribution.idle_timeout,
            rpc_timeout: distribution.rpc_timeout,
            heartbeat_interval: distribution.heartbeat_interval(),
            bind_address: distribution.bind_address.clone(),
            advertise_host: distribution.advertise_host.clone(),
            command,
        }
    }

    pub fn options(&self) -> RemoteWorkerOptions {
        RemoteWorkerOptions {
            idle_timeout: self.idle_timeout,
            rpc_timeout: self.rpc_timeout,
            server: ServerOptions {
                bind_address: self.bind_address.clone(),
                advertise_host: self.advertise_host.clone(),
                heartbeat_interval: self.heartbeat_interval,
            },
        }
    }
}

/// Build the distributed pool and map the tasks over it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorJob {
    pub config: FlotillaConfig,
    pub output_dir: PathBuf,
    pub tasks: Vec<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchJob {
    RemoteWorker(RemoteWorkerJob),
    Coordinator(CoordinatorJob),
}

impl LaunchJob {
    /// base64 of the JSON form, safe to pass as one command line argument
    pub fn encode(&self) -> Result<String, LaunchError> {
        let json = serde_json::to_vec(self)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self, LaunchError> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| LaunchError::InvalidJob(format!("not base64: {}", e)))?;
        serde_json::from_slice(&json).map_err(|e| LaunchError::InvalidJob(e.to_string()))
    }

    /// Short name used in log file names
    pub fn label(&self) -> &'static str {
        match self {
            LaunchJob::RemoteWorker(_) => "worker",
            LaunchJob::Coordinator(_) => "coordinator",
        }
    }

    /// Arguments following the executable
    pub fn command_args(&self) -> Result<Vec<String>, LaunchError> {
        Ok(vec![
            RUN_JOB_SUBCOMMAND.to_string(),
            "--job".to_string(),
            self.encode()?,
        ])
    }
}

/// How a launched job ended, as far as the launcher can tell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    Completed,
    Failed { error: String },
    /// The child process exited unsuccessfully
    Exited { code: Option<i32> },
    /// Handed to the batch scheduler; the job runs on its own from here
    Submitted { job_id: Option<String> },
}

impl LaunchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, LaunchOutcome::Completed | LaunchOutcome::Submitted { .. })
    }
}

#[derive(Debug)]
pub struct SubprocessHandle {
    child: Child,
    pid: Option<u32>,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
}

impl SubprocessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    pub async fn wait(mut self) -> Result<LaunchOutcome, LaunchError> {
        let status = self.child.wait().await?;
        debug!(pid = ?self.pid, %status, "Child process exited");
        if status.success() {
            Ok(LaunchOutcome::Completed)
        } else {
            Ok(LaunchOutcome::Exited { code: status.code() })
        }
    }
}

/// Output of a batch submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub job_id: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

/// Something a launched job can be awaited through
#[derive(Debug)]
pub enum LaunchHandle {
    InProcess(JoinHandle<Result<(), ExecutionError>>),
    Subprocess(SubprocessHandle),
    Batch(BatchHandle),
}

impl LaunchHandle {
    pub async fn wait(self) -> Result<LaunchOutcome, LaunchError> {
        match self {
            LaunchHandle::InProcess(handle) => Ok(match handle.await {
                Ok(Ok(())) => LaunchOutcome::Completed,
                Ok(Err(e)) => LaunchOutcome::Failed { error: e.to_string() },
                Err(e) => LaunchOutcome::Failed { error: e.to_string() },
            }),
            LaunchHandle::Subprocess(handle) => handle.wait().await,
            LaunchHandle::Batch(handle) => Ok(LaunchOutcome::Submitted {
                job_id: handle.job_id,
            }),
        }
    }
}

#[async_trait]
pub trait Launcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(&self, job: LaunchJob) -> Result<LaunchHandle, LaunchError>;
}

/// Runs jobs as tasks of the current runtime
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    runner: NodeRunner,
}

impl InProcessLauncher {
    pub fn new(runner: NodeRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn launch(&self, job: LaunchJob) -> Result<LaunchHandle, LaunchError> {
        debug!("Launching {} job in process", job.label());
        let runner = self.runner.clone();
        let handle = tokio::spawn(async move { runner.run(job).await });
        Ok(LaunchHandle::InProcess(handle))
    }
}

/// Runs jobs in child processes of the flotilla executable
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    executable: PathBuf,
    stdio_dir: PathBuf,
}

impl SubprocessLauncher {
    pub fn new(executable: impl Into<PathBuf>, stdio_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            stdio_dir: stdio_dir.into(),
        }
    }
}

#[async_trait]
impl Launcher for SubprocessLauncher {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn launch(&self, job: LaunchJob) -> Result<LaunchHandle, LaunchError> {
        std::fs::create_dir_all(&self.stdio_dir)?;
        let stem = format!("{}-{}", job.label(), Uuid::new_v4());
        let stdout_path = self.stdio_dir.join(format!("{}.stdout", stem));
        let stderr_path = self.stdio_dir.join(format!("{}.stderr", stem));
        let stdout = std::fs::File::create(&stdout_path)?;
        let stderr = std::fs::File::create(&stderr_path)?;

        // The child owns the log files; ours are dropped with the command.
        let child = Command::new(&self.executable)
            .args(job.command_args()?)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.executable.display().to_string(),
                source,
            })?;

        let pid = child.id();
        info!(pid = ?pid, stdout = %stdout_path.display(), "Launched {} process", job.label());
        Ok(LaunchHandle::Subprocess(SubprocessHandle {
            child,
            pid,
            stdout_path,
            stderr_path,
        }))
    }
}

static SUBMITTED_JOB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Submitted batch job (\d+)").expect("valid job id pattern"));

/// Quote `arg` for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Scheduler job id reported by `sbatch`
pub fn parse_job_id(stdout: &str) -> Option<String> {
    SUBMITTED_JOB
        .captures(stdout)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}

/// Submits jobs to Slurm
#[derive(Debug, Clone)]
pub struct SlurmLauncher {
    executable: PathBuf,
    stdio_dir: PathBuf,
    slurm: SlurmConfig,
}

impl SlurmLauncher {
    pub fn new(executable: impl Into<PathBuf>, stdio_dir: impl Into<PathBuf>, slurm: SlurmConfig) -> Self {
        Self {
            executable: executable.into(),
            stdio_dir: stdio_dir.into(),
            slurm,
        }
    }

    /// Batch script running `command`
    pub fn render_script(&self, job_name: &str, command: &[String]) -> String {
        let mut lines = vec![
            "#!/usr/bin/env bash".to_string(),
            format!("#SBATCH -N {}", self.slurm.nodes_per_job),
        ];
        if let Some(partition) = &self.slurm.partition {
            lines.push(format!("#SBATCH -p {}", partition));
        }
        if let Some(account) = &self.slurm.account {
            lines.push(format!("#SBATCH -A {}", account));
        }
        lines.push(format!("#SBATCH -J {}", job_name));
        let stdio = self.stdio_dir.join(format!("{}-%j", job_name));
        lines.push(format!("#SBATCH -o {}.stdout", stdio.display()));
        lines.push(format!("#SBATCH -e {}.stderr", stdio.display()));
        if let Some(limit) = &self.slurm.time_limit {
            lines.push(format!("#SBATCH -t {}", limit));
        }
        lines.push(String::new());
        lines.extend(self.slurm.prelude.iter().cloned());
        lines.push(
            command
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        );
        lines.push(String::new());
        lines.join("\n")
    }
}

#[async_trait]
impl Launcher for SlurmLauncher {
    fn name(&self) -> &'static str {
        "slurm"
    }

    async fn launch(&self, job: LaunchJob) -> Result<LaunchHandle, LaunchError> {
        let (program, submit_args) = self
            .slurm
            .submit_command
            .split_first()
            .ok_or_else(|| LaunchError::Configuration("empty slurm submit command".to_string()))?;
        std::fs::create_dir_all(&self.stdio_dir)?;

        let mut command = vec![self.executable.display().to_string()];
        command.extend(job.command_args()?);
        let job_name = format!("{}-{}", self.slurm.job_name, job.label());
        let script = self.render_script(&job_name, &command);

        let mut child = Command::new(program)
            .args(submit_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            // A submitter that exits early reports through its status
            if let Err(e) = stdin.write_all(script.as_bytes()).await {
                debug!("Could not write job script to {}: {}", program, e);
            }
        }
        let output = child.wait_with_output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(LaunchError::Submission {
                program: program.clone(),
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let job_id = parse_job_id(&stdout);
        info!(job_id = ?job_id, "Submitted {} job", job.label());
        Ok(LaunchHandle::Batch(BatchHandle {
            job_id,
            stdout,
            stderr,
        }))
    }
}

/// Launcher selected by the configuration
pub fn build_launcher(
    config: &LauncherConfig,
    stdio_dir: PathBuf,
    runner: NodeRunner,
) -> Result<Box<dyn Launcher>, LaunchError> {
    let executable = || {
        config.executable.clone().ok_or_else(|| {
            LaunchError::Configuration(format!(
                "the {} launcher needs the path of the flotilla executable",
                config.kind
            ))
        })
    };

    Ok(match config.kind {
        LauncherKind::InProcess => Box::new(InProcessLauncher::new(runner)),
        LauncherKind::Subprocess => Box::new(SubprocessLauncher::new(executable()?, stdio_dir)),
        LauncherKind::Slurm => Box::new(SlurmLauncher::new(
            executable()?,
            stdio_dir,
            config.slurm.clone(),
        )),
    })
}
