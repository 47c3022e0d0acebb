//! Launcher configuration

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where remote workers (and a non-local coordinator) are started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    /// Concurrent task inside the current process
    InProcess,
    /// Local child process
    #[default]
    Subprocess,
    /// Slurm batch job
    Slurm,
}

impl LauncherKind {
    pub const CHOICES: [&'static str; 3] = ["in_process", "subprocess", "slurm"];
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LauncherKind::InProcess => "in_process",
            LauncherKind::Subprocess => "subprocess",
            LauncherKind::Slurm => "slurm",
        };
        f.write_str(name)
    }
}

impl FromStr for LauncherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "in_process" | "inprocess" | "local" => Ok(LauncherKind::InProcess),
            "subprocess" | "process" => Ok(LauncherKind::Subprocess),
            "slurm" => Ok(LauncherKind::Slurm),
            _ => Err(format!(
                "Invalid launcher: {} (expected one of {})",
                s,
                Self::CHOICES.join(", ")
            )),
        }
    }
}

/// Launcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LauncherConfig {
    pub kind: LauncherKind,

    /// Flotilla executable used in launched command lines. Filled in from
    /// the running binary when not configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,

    /// Directory for the stdout/stderr files of launched processes.
    /// Defaults to `<output>/logs/stdio`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdio_dir: Option<PathBuf>,

    pub slurm: SlurmConfig,
}

/// Batch job options for the Slurm launcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    pub job_name: String,

    /// Wall clock limit in Slurm syntax, e.g. `1-00:00:00`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,

    pub nodes_per_job: u32,

    /// Submission program and its fixed arguments; the job script is
    /// written to its stdin
    pub submit_command: Vec<String>,

    /// Shell lines placed in the job script before the command, e.g.
    /// `module load ...`
    pub prelude: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            partition: None,
            account: None,
            job_name: "flotilla".to_string(),
            time_limit: None,
            nodes_per_job: 1,
            submit_command: vec!["sbatch".to_string()],
            prelude: Vec::new(),
        }
    }
}

impl Validatable for LauncherConfig {
    fn validate(&self) -> ConfigResult<()> {
        if let Some(executable) = &self.executable {
            if executable.as_os_str().is_empty() {
                return Err(self.validation_error("executable cannot be empty"));
            }
        }
        if self.kind == LauncherKind::Slurm {
            self.slurm.validate()?;
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "launcher"
    }
}

impl Validatable for SlurmConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.job_name, "job_name", self.domain_name())?;
        validate_positive(self.nodes_per_job, "nodes_per_job", self.domain_name())?;

        match self.submit_command.first() {
            Some(program) => validate_required_string(program, "submit_command", self.domain_name())?,
            None => return Err(self.validation_error("submit_command cannot be empty")),
        }

        if let Some(limit) = &self.time_limit {
            validate_required_string(limit, "time_limit", self.domain_name())?;
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "launcher.slurm"
    }
}
