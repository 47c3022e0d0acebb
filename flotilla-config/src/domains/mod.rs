//! Domain-specific configuration modules

pub mod coordinator;
pub mod distribution;
pub mod launcher;
pub mod logging;
pub mod output;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main Flotilla configuration combining all domains
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FlotillaConfig {
    /// Worker count, timeouts and RPC binding
    pub distribution: distribution::DistributionConfig,

    /// How workers and coordinators are started
    pub launcher: launcher::LauncherConfig,

    /// Output directory layout
    pub output: output::OutputConfig,

    /// Task source and worker operation
    pub coordinator: coordinator::CoordinatorConfig,

    /// Logging configuration
    pub logging: logging::LoggingConfig,
}

impl FlotillaConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.distribution.validate()?;
        self.launcher.validate()?;
        self.output.validate()?;
        self.coordinator.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = FlotillaConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
