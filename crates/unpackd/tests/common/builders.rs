//! Builders for job submissions.

#![allow(dead_code)]

use unpackd::domain::{ConflictPolicy, OutputMode, ZipSlipPolicy};
use unpackd::{JobOptionsDraft, NewItem, NewJob, PasswordStrategy};

/// A complete draft: sibling output dir, skip on conflict, zip-slip blocked.
pub fn draft(password: PasswordStrategy) -> JobOptionsDraft {
    JobOptionsDraft {
        output_mode: Some(OutputMode::SiblingNamedDir),
        output_dir: None,
        conflict_policy: Some(ConflictPolicy::Skip),
        zip_slip_policy: Some(ZipSlipPolicy::Block),
        password,
    }
}

/// A submission with one item per archive under `root`.
pub fn job_with_archives(root: &str, archives: &[&str], options: JobOptionsDraft) -> NewJob {
    archives.iter().fold(NewJob::new(root, options), |job, name| {
        job.with_item(NewItem::for_archive(format!("{}/{}", root, name)))
    })
}
