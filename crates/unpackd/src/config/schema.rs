use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::RetryPolicy;
use crate::domain::FailedReason;
use crate::extract::tool::{SearchPathResolver, DEFAULT_CANDIDATES};
use crate::worker::DispatcherConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub var_directory: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
    #[serde(default = "default_job_fatal_reasons")]
    pub job_fatal_reasons: Vec<FailedReason>,
    #[serde(default)]
    pub tool: ToolConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Four hours.
fn default_extract_timeout_secs() -> u64 {
    14_400
}

fn default_job_fatal_reasons() -> Vec<FailedReason> {
    vec![FailedReason::ToolMissing]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            var_directory: None,
            poll_interval_ms: default_poll_interval_ms(),
            extract_timeout_secs: default_extract_timeout_secs(),
            job_fatal_reasons: default_job_fatal_reasons(),
            tool: ToolConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    /// `None` when the limit is disabled (`0`).
    pub fn extract_timeout(&self) -> Option<Duration> {
        (self.extract_timeout_secs > 0).then(|| Duration::from_secs(self.extract_timeout_secs))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            job_fatal_reasons: self.job_fatal_reasons.clone(),
        }
    }

    pub fn tool_resolver(&self) -> SearchPathResolver {
        SearchPathResolver::new(self.tool.path.clone(), self.tool.candidates.clone())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.database.busy_retries,
            base_delay: Duration::from_millis(self.database.busy_base_delay_ms),
            max_delay: Duration::from_millis(self.database.busy_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Explicit 7-Zip executable; searched on `PATH` when unset or unusable.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_candidates")]
    pub candidates: Vec<String>,
}

fn default_candidates() -> Vec<String> {
    DEFAULT_CANDIDATES.iter().map(|c| c.to_string()).collect()
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            path: None,
            candidates: default_candidates(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
    #[serde(default = "default_busy_base_delay_ms")]
    pub busy_base_delay_ms: u64,
    #[serde(default = "default_busy_max_delay_ms")]
    pub busy_max_delay_ms: u64,
}

fn default_busy_retries() -> u32 {
    8
}

fn default_busy_base_delay_ms() -> u64 {
    50
}

fn default_busy_max_delay_ms() -> u64 {
    1000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_retries: default_busy_retries(),
            busy_base_delay_ms: default_busy_base_delay_ms(),
            busy_max_delay_ms: default_busy_max_delay_ms(),
        }
    }
}
