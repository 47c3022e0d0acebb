//! Operations a worker can run
//!
//! Workers never receive code, only the name of an operation and its input.
//! Each process builds its [`OperationRegistry`] explicitly at startup.

use async_trait::async_trait;
use flotilla_config::CommandTemplate;
use flotilla_core::TaskError;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::debug;

use crate::task::TaskInvocation;

/// Name of the built-in operation returning its input unchanged
pub const ECHO_OPERATION: &str = "echo";

pub use flotilla_config::COMMAND_OPERATION;

/// Something a worker can apply to a task input
#[async_trait]
pub trait Operation: Send + Sync {
    async fn run(&self, input: JsonValue) -> Result<JsonValue, TaskError>;
}

/// Returns the input unchanged
pub struct EchoOperation;

#[async_trait]
impl Operation for EchoOperation {
    async fn run(&self, input: JsonValue) -> Result<JsonValue, TaskError> {
        Ok(input)
    }
}

struct FnOperation<F>(F);

#[async_trait]
impl<F> Operation for FnOperation<F>
where
    F: Fn(JsonValue) -> Result<JsonValue, TaskError> + Send + Sync,
{
    async fn run(&self, input: JsonValue) -> Result<JsonValue, TaskError> {
        (self.0)(input)
    }
}

struct AsyncFnOperation<F>(F);

#[async_trait]
impl<F, Fut> Operation for AsyncFnOperation<F>
where
    F: Fn(JsonValue) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, TaskError>> + Send + 'static,
{
    async fn run(&self, input: JsonValue) -> Result<JsonValue, TaskError> {
        (self.0)(input).await
    }
}

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[A-Za-z_][A-Za-z0-9_]*\}").expect("valid placeholder pattern"));

/// Runs an external program built from a [`CommandTemplate`].
///
/// `{field}` placeholders take the value of that field of the task input,
/// `{input}` the whole input. A non-zero exit fails the task.
pub struct CommandOperation {
    template: CommandTemplate,
}

impl CommandOperation {
    pub fn new(template: CommandTemplate) -> Self {
        Self { template }
    }

    /// Program and arguments for one input
    pub fn render(&self, input: &JsonValue) -> Result<(String, Vec<String>), TaskError> {
        let program = render_arg(&self.template.program, input)?;
        let args = self
            .template
            .args
            .iter()
            .map(|arg| render_arg(arg, input))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((program, args))
    }
}

fn placeholder_value(name: &str, input: &JsonValue) -> Result<String, TaskError> {
    let value = if name == "input" {
        input
    } else {
        input
            .get(name)
            .ok_or_else(|| TaskError::new(format!("task input has no field '{}'", name)))?
    };
    Ok(match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn render_arg(template: &str, input: &JsonValue) -> Result<String, TaskError> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for placeholder in PLACEHOLDER.find_iter(template) {
        let text = placeholder.as_str();
        rendered.push_str(&template[last..placeholder.start()]);
        rendered.push_str(&placeholder_value(&text[1..text.len() - 1], input)?);
        last = placeholder.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

fn tail(bytes: &[u8], max_lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(max_lines)..].join("\n")
}

#[async_trait]
impl Operation for CommandOperation {
    async fn run(&self, input: JsonValue) -> Result<JsonValue, TaskError> {
        let (program, args) = self.render(&input)?;
        debug!(program = %program, ?args, "Running command");

        let output = tokio::process::Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TaskError::new(format!("failed to start '{}': {}", program, e)))?;

        if !output.status.success() {
            return Err(TaskError::with_details(
                format!("'{}' exited with {}", program, output.status),
                json!({
                    "exit_code": output.status.code(),
                    "stderr": tail(&output.stderr, 20),
                }),
            ));
        }

        Ok(json!({
            "exit_code": 0,
            "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
        }))
    }
}

/// Named operations available to the workers of one process
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Arc<dyn Operation>>,
}

impl OperationRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `echo`, and `command` when a template is given
    pub fn with_builtins(command: Option<CommandTemplate>) -> Self {
        let mut registry = Self::new();
        registry.register(ECHO_OPERATION, EchoOperation);
        if let Some(template) = command {
            registry.register(COMMAND_OPERATION, CommandOperation::new(template));
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, operation: impl Operation + 'static) -> &mut Self {
        self.operations.insert(name.into(), Arc::new(operation));
        self
    }

    /// Register a synchronous function
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JsonValue) -> Result<JsonValue, TaskError> + Send + Sync + 'static,
    {
        self.register(name, FnOperation(f))
    }

    /// Register an asynchronous function
    pub fn register_async<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, TaskError>> + Send + 'static,
    {
        self.register(name, AsyncFnOperation(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run a task. Unknown operations and panics become task errors.
    pub async fn run(&self, task: &TaskInvocation) -> Result<JsonValue, TaskError> {
        let operation = self
            .operations
            .get(&task.operation)
            .cloned()
            .ok_or_else(|| TaskError::new(format!("unknown operation '{}'", task.operation)))?;

        match AssertUnwindSafe(operation.run(task.input.clone()))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(TaskError::new(format!(
                    "operation '{}' panicked: {}",
                    task.operation, message
                )))
            }
        }
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}
