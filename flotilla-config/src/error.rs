//! Errors raised while loading or validating configuration

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An override variable holds an unusable value
    #[error("{var}: {message}")]
    Env { var: String, message: String },

    #[error("Invalid {domain} configuration: {message}")]
    Invalid { domain: &'static str, message: String },
}
