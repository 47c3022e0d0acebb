//! Coordinator configuration: where the task list comes from and what each
//! worker runs

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Name of the built-in operation that runs an external program
pub const COMMAND_OPERATION: &str = "command";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Run the coordinator in the calling process instead of launching it
    pub local_coordinator: bool,

    /// JSON or YAML file holding the list of task inputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,

    /// Worker operation applied to every task input
    pub operation: String,

    /// Program run by the `command` operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandTemplate>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_coordinator: false,
            manifest: None,
            operation: "echo".to_string(),
            command: None,
        }
    }
}

/// Program plus argument template. `{field}` placeholders in the arguments
/// are replaced with fields of the task input; `{input}` is the whole input
/// as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Validatable for CoordinatorConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.operation, "operation", self.domain_name())?;

        if self.operation == COMMAND_OPERATION {
            match &self.command {
                Some(command) => validate_required_string(&command.program, "command.program", self.domain_name())?,
                None => {
                    return Err(self.validation_error(
                        "operation 'command' requires a command template",
                    ))
                }
            }
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "coordinator"
    }
}
