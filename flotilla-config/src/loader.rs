//! Configuration loading and environment variable handling

use crate::domains::FlotillaConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "FLOTILLA".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<FlotillaConfig> {
        let path = path.as_ref();
        log::debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: FlotillaConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<FlotillaConfig> {
        let mut config = FlotillaConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<FlotillaConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut FlotillaConfig) -> ConfigResult<()> {
        self.apply_distribution_overrides(&mut config.distribution)?;
        self.apply_launcher_overrides(&mut config.launcher)?;
        self.apply_output_overrides(&mut config.output)?;
        self.apply_coordinator_overrides(&mut config.coordinator)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    fn apply_distribution_overrides(
        &self,
        config: &mut crate::domains::distribution::DistributionConfig,
    ) -> ConfigResult<()> {
        if let Some(count) = self.parse_env_var("WORKER_COUNT")? {
            config.worker_count = count;
        }

        if let Some(dedicated) = self.parse_env_var("USE_DEDICATED_COORDINATOR")? {
            config.use_dedicated_coordinator = dedicated;
        }

        if let Some(seconds) = self.parse_env_var::<u64>("IDLE_TIMEOUT")? {
            config.idle_timeout = Duration::from_secs(seconds);
        }

        if let Some(attempts) = self.parse_env_var("MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }

        if let Some(seconds) = self.parse_env_var::<u64>("RPC_TIMEOUT")? {
            config.rpc_timeout = Duration::from_secs(seconds);
        }

        if let Ok(bind) = self.get_env_var("BIND_ADDRESS") {
            config.bind_address = bind;
        }

        if let Ok(host) = self.get_env_var("ADVERTISE_HOST") {
            config.advertise_host = Some(host);
        }

        Ok(())
    }

    fn apply_launcher_overrides(
        &self,
        config: &mut crate::domains::launcher::LauncherConfig,
    ) -> ConfigResult<()> {
        if let Ok(kind) = self.get_env_var("LAUNCHER") {
            config.kind = crate::domains::launcher::LauncherKind::from_str(&kind)
                .map_err(|message| self.env_error("LAUNCHER", message))?;
        }

        if let Ok(executable) = self.get_env_var("EXECUTABLE") {
            config.executable = Some(PathBuf::from(executable));
        }

        if let Ok(dir) = self.get_env_var("STDIO_DIR") {
            config.stdio_dir = Some(PathBuf::from(dir));
        }

        if let Ok(partition) = self.get_env_var("SLURM_PARTITION") {
            config.slurm.partition = Some(partition);
        }

        if let Ok(account) = self.get_env_var("SLURM_ACCOUNT") {
            config.slurm.account = Some(account);
        }

        if let Ok(limit) = self.get_env_var("SLURM_TIME_LIMIT") {
            config.slurm.time_limit = Some(limit);
        }

        Ok(())
    }

    fn apply_output_overrides(
        &self,
        config: &mut crate::domains::output::OutputConfig,
    ) -> ConfigResult<()> {
        if let Ok(directory) = self.get_env_var("OUTPUT_DIRECTORY") {
            config.directory = PathBuf::from(directory);
        }

        if let Some(unique) = self.parse_env_var("OUTPUT_MAKE_UNIQUE")? {
            config.make_unique = unique;
        }

        Ok(())
    }

    fn apply_coordinator_overrides(
        &self,
        config: &mut crate::domains::coordinator::CoordinatorConfig,
    ) -> ConfigResult<()> {
        if let Some(local) = self.parse_env_var("LOCAL_COORDINATOR")? {
            config.local_coordinator = local;
        }

        if let Ok(manifest) = self.get_env_var("MANIFEST") {
            config.manifest = Some(PathBuf::from(manifest));
        }

        if let Ok(operation) = self.get_env_var("OPERATION") {
            config.operation = operation;
        }

        Ok(())
    }

    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(level) = self.get_env_var("LOG_LEVEL") {
            config.level = level;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|message| self.env_error("LOG_FORMAT", message))?;
        }

        if let Some(to_file) = self.parse_env_var("LOG_TO_FILE")? {
            config.log_to_file = to_file;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }

    /// Get and parse an environment variable with prefix, if set
    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|e| self.env_error(name, e.to_string())),
            Err(_) => Ok(None),
        }
    }

    fn env_error(&self, name: &str, message: String) -> ConfigError {
        ConfigError::Env {
            var: format!("{}_{}", self.prefix, name),
            message,
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
