//! Domain-driven configuration management for Flotilla
//!
//! This crate provides the plain configuration structs consumed by the
//! dispatch core, split by functional domains, with validation, defaults,
//! and environment variable support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    coordinator::{CommandTemplate, CoordinatorConfig, COMMAND_OPERATION},
    distribution::DistributionConfig,
    launcher::{LauncherConfig, LauncherKind, SlurmConfig},
    logging::{LogFormat, LoggingConfig},
    output::OutputConfig,
    FlotillaConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration;
