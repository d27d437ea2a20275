use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Environment variable that replaces `var_directory`.
pub const VAR_DIR_ENV: &str = "UNPACKD_VAR_DIR";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Where the database and job logs live.
///
/// Precedence: `cli_override`, then `UNPACKD_VAR_DIR`, then the config file,
/// then the platform data directory.
pub fn resolve_var_dir(
    config: &Config,
    cli_override: Option<&Path>,
) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = cli_override {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = std::env::var_os(VAR_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = &config.var_directory {
        return Ok(dir.clone());
    }
    dirs::data_local_dir()
        .map(|d| d.join("unpackd"))
        .ok_or_else(|| ConfigError::Validation {
            message: format!(
                "No var directory configured and no platform data directory; set {} or var_directory",
                VAR_DIR_ENV
            ),
        })
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.database.busy_base_delay_ms > config.database.busy_max_delay_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "database.busy_base_delay_ms ({}) exceeds busy_max_delay_ms ({})",
                config.database.busy_base_delay_ms, config.database.busy_max_delay_ms
            ),
        });
    }

    if config.tool.path.is_none() && config.tool.candidates.is_empty() {
        return Err(ConfigError::Validation {
            message: "tool.candidates must not be empty when tool.path is unset".to_string(),
        });
    }

    Ok(())
}
