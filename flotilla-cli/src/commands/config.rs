//! `flotilla config`

use anyhow::{Context, Result};
use flotilla_config::{ConfigLoader, FlotillaConfig};
use std::fs;
use std::path::Path;
use tracing::{error, info};

/// Handle configuration validation
pub fn handle_config_validate(config_file: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!("Configuration file not found: {:?}", config_file));
    }

    match ConfigLoader::new().from_file(config_file) {
        Ok(_config) => {
            println!("✅ Configuration file is valid");
            info!("Configuration validation passed");
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed: {}", e);
            error!("Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handle configuration generation
pub fn handle_config_generate(output: Option<&Path>, force: bool) -> Result<()> {
    let sample = FlotillaConfig::generate_sample();
    let Some(output) = output else {
        print!("{}", sample);
        return Ok(());
    };

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }
    fs::write(output, sample).context("Failed to write configuration file")?;

    println!("✅ Configuration generated at: {:?}", output);
    println!("🔧 Validate with: flotilla config validate --config-file {:?}", output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("flotilla.yaml");

        handle_config_generate(Some(&path), false).unwrap();
        handle_config_validate(&path).unwrap();

        assert!(handle_config_generate(Some(&path), false).is_err());
        handle_config_generate(Some(&path), true).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "distribution:\n  max_attempts: 0\n").unwrap();
        assert!(handle_config_validate(&path).is_err());
        assert!(handle_config_validate(&dir.path().join("missing.yaml")).is_err());
    }
}
