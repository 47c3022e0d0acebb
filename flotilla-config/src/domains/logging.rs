//! Logging configuration

use crate::error::ConfigResult;
use crate::validation::{validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, either a bare level (`info`) or per-target
    /// levels (`info,flotilla_ipc=debug`)
    pub level: String,

    pub format: LogFormat,

    /// Also write logs to `<output>/logs/flotilla.log`
    #[serde(default = "crate::domains::utils::default_false")]
    pub log_to_file: bool,

    /// Add file and line to each event
    #[serde(default = "crate::domains::utils::default_false")]
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            log_to_file: false,
            include_location: false,
        }
    }
}

/// Line format of console and file output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    #[default]
    Text,
    Compact,
    /// Multi-line, for reading by eye
    Pretty,
}

impl LogFormat {
    pub const CHOICES: [&'static str; 4] = ["json", "text", "compact", "pretty"];
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = match self {
            LogFormat::Json => 0,
            LogFormat::Text => 1,
            LogFormat::Compact => 2,
            LogFormat::Pretty => 3,
        };
        f.write_str(Self::CHOICES[index])
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [LogFormat::Json, LogFormat::Text, LogFormat::Compact, LogFormat::Pretty]
            .into_iter()
            .find(|format| format.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("expected one of {}, got '{}'", Self::CHOICES.join(", "), s))
    }
}

impl Validatable for LoggingConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.level, "level", self.domain_name())?;
        if self.level.split(',').any(|directive| directive.trim().is_empty()) {
            return Err(self.validation_error(format!("level '{}' has an empty directive", self.level)));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_names() {
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::Compact.to_string(), "compact");
        let err = LogFormat::from_str("xml").unwrap_err();
        assert!(err.contains("json, text, compact, pretty"));
    }

    #[test]
    fn test_level_directives() {
        let mut config = LoggingConfig::default();
        assert!(config.validate().is_ok());

        config.level = "info,flotilla_ipc=debug".to_string();
        assert!(config.validate().is_ok());

        config.level = "info,,debug".to_string();
        assert!(config.validate().is_err());
        config.level = " ".to_string();
        assert!(config.validate().is_err());
    }
}
