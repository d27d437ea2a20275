//! Per-job plain-text log file.
//!
//! Subprocess output and dispatcher progress for one job go here rather
//! than to tracing, so the file is a complete post-mortem trace. Write
//! failures are reported once through tracing and otherwise ignored; a
//! broken log must never fail an extraction.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::warn;

/// Append-only sink for one job's log file.
pub struct JobLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
    write_failed: AtomicBool,
}

impl JobLog {
    /// Opens `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
            write_failed: AtomicBool::new(false),
        })
    }

    /// A sink that drops everything, for jobs whose log file could not be opened.
    pub fn discard(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
            write_failed: AtomicBool::new(true),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `text` verbatim.
    pub fn write(&self, text: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(text.as_bytes()) {
            if !self.write_failed.swap(true, Ordering::Relaxed) {
                warn!("Failed to write job log {}: {}", self.path.display(), e);
            }
        }
    }

    /// Appends `line` followed by a newline.
    pub fn line(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        if line.ends_with('\n') {
            self.write(line);
        } else {
            self.write(&format!("{}\n", line));
        }
    }
}

/// Reads at most the last `max_bytes` of a job log.
///
/// A missing file reads as empty. A cut that lands inside a multi-byte
/// character is repaired lossily.
pub fn read_tail(path: &Path, max_bytes: u64) -> io::Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;

    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
