//! Per-domain validation

use crate::error::{ConfigError, ConfigResult};
use std::time::Duration;

/// A configuration domain that can check its own values
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;

    /// Name used in error messages, e.g. `distribution`
    fn domain_name(&self) -> &'static str;

    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::Invalid {
            domain: self.domain_name(),
            message: message.into(),
        }
    }
}

fn invalid(domain: &'static str, message: String) -> ConfigError {
    ConfigError::Invalid { domain, message }
}

pub fn validate_required_string(value: &str, field_name: &str, domain: &'static str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(invalid(domain, format!("{} cannot be empty", field_name)));
    }
    Ok(())
}

pub fn validate_positive(value: u32, field_name: &str, domain: &'static str) -> ConfigResult<()> {
    if value == 0 {
        return Err(invalid(domain, format!("{} must be at least 1", field_name)));
    }
    Ok(())
}

pub fn validate_nonzero_duration(value: Duration, field_name: &str, domain: &'static str) -> ConfigResult<()> {
    if value.is_zero() {
        return Err(invalid(domain, format!("{} must be longer than zero", field_name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_helpers() {
        assert!(validate_required_string("x", "name", "output").is_ok());
        assert!(validate_required_string("  ", "name", "output").is_err());
        assert!(validate_positive(1, "max_attempts", "distribution").is_ok());
        assert!(validate_nonzero_duration(Duration::from_millis(1), "idle_timeout", "distribution").is_ok());

        let err = validate_positive(0, "max_attempts", "distribution").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid distribution configuration: max_attempts must be at least 1"
        );
        let err = validate_nonzero_duration(Duration::ZERO, "rpc_timeout", "distribution").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { domain: "distribution", .. }));
    }
}
