//! Locating the 7-Zip executable.

use std::ffi::OsString;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, warn};

/// Executable names tried in order when no explicit path is configured.
pub const DEFAULT_CANDIDATES: &[&str] = &["7zz", "7z", "7za"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("7-Zip executable not found (looked for: {candidates})")]
    NotFound { candidates: String },
}

/// Resolves the extraction tool once per job.
pub trait ToolResolver: Send + Sync {
    fn resolve(&self) -> Result<PathBuf, ToolError>;
}

/// Explicit path first, then a search of `PATH` for the candidate names.
#[derive(Debug, Clone)]
pub struct SearchPathResolver {
    explicit: Option<PathBuf>,
    candidates: Vec<String>,
    search_path: Option<OsString>,
}

impl SearchPathResolver {
    pub fn new(explicit: Option<PathBuf>, candidates: Vec<String>) -> Self {
        let candidates = if candidates.is_empty() {
            DEFAULT_CANDIDATES.iter().map(|c| c.to_string()).collect()
        } else {
            candidates
        };
        Self {
            explicit,
            candidates,
            search_path: None,
        }
    }

    /// Searches `dirs` instead of the process `PATH`.
    pub fn with_search_path(mut self, dirs: impl Into<OsString>) -> Self {
        self.search_path = Some(dirs.into());
        self
    }

    /// First candidate found on the search path, in candidate order.
    fn search(&self) -> Option<PathBuf> {
        self.candidates.iter().find_map(|name| {
            let found = match &self.search_path {
                Some(dirs) => {
                    let cwd = std::env::current_dir().unwrap_or_default();
                    which::which_in(name, Some(dirs), cwd)
                }
                None => which::which(name),
            };
            found.ok()
        })
    }
}

impl Default for SearchPathResolver {
    fn default() -> Self {
        Self::new(None, Vec::new())
    }
}

impl ToolResolver for SearchPathResolver {
    fn resolve(&self) -> Result<PathBuf, ToolError> {
        if let Some(explicit) = &self.explicit {
            match which::which(explicit) {
                Ok(found) => return Ok(found),
                Err(e) => warn!(
                    "Configured 7-Zip path {} is not usable ({}), searching PATH",
                    explicit.display(),
                    e
                ),
            }
        }

        match self.search() {
            Some(found) => {
                debug!("Resolved 7-Zip at {}", found.display());
                Ok(found)
            }
            None => Err(ToolError::NotFound {
                candidates: self.candidates.join(", "),
            }),
        }
    }
}
