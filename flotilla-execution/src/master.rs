//! Sources of the task list for a run

use flotilla_config::CoordinatorConfig;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

use crate::error::ExecutionError;
use crate::output_dir::OutputDirStructure;

/// Produces the tasks of a run. Called once, after the output directory
/// exists, so a master may leave inputs for the workers there.
pub trait Master: Send + Sync {
    fn tasks(&self, output: &OutputDirStructure) -> Result<Vec<JsonValue>, ExecutionError>;
}

/// Reads the tasks from a JSON array or a YAML list
#[derive(Debug, Clone)]
pub struct ManifestMaster {
    path: PathBuf,
}

impl ManifestMaster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The manifest named by the coordinator configuration, if any
    pub fn from_config(config: &CoordinatorConfig) -> Option<Self> {
        config.manifest.as_ref().map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, text: &str) -> Result<JsonValue, String> {
        let is_json = self
            .path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            serde_json::from_str(text).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(text).map_err(|e| e.to_string())
        }
    }
}

impl Master for ManifestMaster {
    fn tasks(&self, _output: &OutputDirStructure) -> Result<Vec<JsonValue>, ExecutionError> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            ExecutionError::ManifestError(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        match self.parse(&text) {
            Ok(JsonValue::Array(tasks)) => Ok(tasks),
            Ok(JsonValue::Null) => Ok(Vec::new()),
            Ok(other) => Err(ExecutionError::ManifestError(format!(
                "{} must hold a list of tasks, found {}",
                self.path.display(),
                kind_of(&other)
            ))),
            Err(e) => Err(ExecutionError::ManifestError(format!(
                "cannot parse {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "a mapping",
    }
}

/// A fixed task list
#[derive(Debug, Clone, Default)]
pub struct StaticMaster {
    tasks: Vec<JsonValue>,
}

impl StaticMaster {
    pub fn new(tasks: Vec<JsonValue>) -> Self {
        Self { tasks }
    }
}

impl Master for StaticMaster {
    fn tasks(&self, _output: &OutputDirStructure) -> Result<Vec<JsonValue>, ExecutionError> {
        Ok(self.tasks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output() -> (tempfile::TempDir, OutputDirStructure) {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputDirStructure::open(dir.path());
        (dir, output)
    }

    #[test]
    fn test_json_manifest() {
        let (dir, output) = output();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, r#"[{"name": "s1"}, "s2", 3]"#).unwrap();

        let tasks = ManifestMaster::new(&path).tasks(&output).unwrap();
        assert_eq!(tasks, vec![json!({"name": "s1"}), json!("s2"), json!(3)]);
    }

    #[test]
    fn test_yaml_manifest() {
        let (dir, output) = output();
        let path = dir.path().join("tasks.yaml");
        std::fs::write(&path, "- name: s1\n  reads: r1.fq\n- name: s2\n  reads: r2.fq\n").unwrap();

        let tasks = ManifestMaster::new(&path).tasks(&output).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1], json!({"name": "s2", "reads": "r2.fq"}));

        std::fs::write(&path, "").unwrap();
        assert!(ManifestMaster::new(&path).tasks(&output).unwrap().is_empty());
    }

    #[test]
    fn test_manifest_errors() {
        let (dir, output) = output();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, r#"{"name": "s1"}"#).unwrap();
        let err = ManifestMaster::new(&path).tasks(&output).unwrap_err();
        assert!(err.to_string().contains("found a mapping"));

        let missing = ManifestMaster::new(dir.path().join("missing.yaml"));
        assert!(matches!(missing.tasks(&output), Err(ExecutionError::ManifestError(_))));
    }

    #[test]
    fn test_from_config() {
        let mut config = CoordinatorConfig::default();
        assert!(ManifestMaster::from_config(&config).is_none());
        config.manifest = Some(PathBuf::from("tasks.yaml"));
        assert_eq!(ManifestMaster::from_config(&config).unwrap().path(), Path::new("tasks.yaml"));
    }
}
