//! Whitelisted 7-Zip argument vector.
//!
//! Only the switches below are ever emitted. Each value is its own argv
//! element and the process is spawned directly, so archive names and
//! passwords are never interpreted by a shell.

use std::ffi::OsString;
use std::path::Path;

use thiserror::Error;

use crate::domain::ConflictPolicy;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgsError {
    #[error("invalid overwrite mode '{0}' (allowed: aoa, aos, aou, aot or a, s, u, t)")]
    InvalidOverwriteMode(String),

    #[error("archive path must not be empty")]
    EmptyArchivePath,

    #[error("output directory must not be empty")]
    EmptyOutputDir,
}

/// The `-ao?` overwrite switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteMode {
    /// `-aoa`: overwrite existing files.
    OverwriteAll,
    /// `-aos`: skip existing files.
    SkipExisting,
    /// `-aou`: rename extracted files.
    RenameExtracted,
    /// `-aot`: rename existing files.
    RenameExisting,
}

impl OverwriteMode {
    pub fn switch(&self) -> &'static str {
        match self {
            OverwriteMode::OverwriteAll => "-aoa",
            OverwriteMode::SkipExisting => "-aos",
            OverwriteMode::RenameExtracted => "-aou",
            OverwriteMode::RenameExisting => "-aot",
        }
    }

    /// Parses a switch given as `aoa`, `-aoa` or the bare suffix `a`.
    pub fn from_switch(value: &str) -> Result<Self, ArgsError> {
        let suffix = value
            .strip_prefix("-ao")
            .or_else(|| value.strip_prefix("ao"))
            .unwrap_or(value);
        match suffix {
            "a" => Ok(OverwriteMode::OverwriteAll),
            "s" => Ok(OverwriteMode::SkipExisting),
            "u" => Ok(OverwriteMode::RenameExtracted),
            "t" => Ok(OverwriteMode::RenameExisting),
            _ => Err(ArgsError::InvalidOverwriteMode(value.to_string())),
        }
    }
}

impl From<ConflictPolicy> for OverwriteMode {
    fn from(policy: ConflictPolicy) -> Self {
        match policy {
            ConflictPolicy::Skip => OverwriteMode::SkipExisting,
            ConflictPolicy::Overwrite => OverwriteMode::OverwriteAll,
            ConflictPolicy::Rename => OverwriteMode::RenameExtracted,
        }
    }
}

/// Builds `x <archive> -o<out_dir> -ao? -y [-p<password>]`.
///
/// The password switch is only added for a non-empty password.
pub fn build_extract_args(
    archive_path: &Path,
    out_dir: &Path,
    overwrite: OverwriteMode,
    password: Option<&str>,
) -> Result<Vec<OsString>, ArgsError> {
    if archive_path.as_os_str().is_empty() {
        return Err(ArgsError::EmptyArchivePath);
    }
    if out_dir.as_os_str().is_empty() {
        return Err(ArgsError::EmptyOutputDir);
    }

    let mut out_switch = OsString::from("-o");
    out_switch.push(out_dir.as_os_str());

    let mut args = vec![
        OsString::from("x"),
        archive_path.as_os_str().to_os_string(),
        out_switch,
        OsString::from(overwrite.switch()),
        OsString::from("-y"),
    ];
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        args.push(OsString::from(format!("-p{}", password)));
    }
    Ok(args)
}

/// Renders an argument vector for logs with the password masked.
pub fn display_args(args: &[OsString]) -> String {
    args.iter()
        .map(|a| {
            let a = a.to_string_lossy();
            if a.starts_with("-p") {
                "-p***".to_string()
            } else {
                a.into_owned()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
