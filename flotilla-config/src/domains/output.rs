//! Output directory configuration

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where run results, logs and the run summary go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub directory: PathBuf,

    /// Pick `<directory>2`, `<directory>3`, ... instead of reusing an
    /// existing directory
    #[serde(default = "crate::domains::utils::default_true")]
    pub make_unique: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("flotilla_output"),
            make_unique: true,
        }
    }
}

impl Validatable for OutputConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(self.validation_error("directory cannot be empty"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "output"
    }
}
