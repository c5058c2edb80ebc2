//! # Archive Status
//!
//! Reports whether each run's container has reached the archive. A
//! container still being copied in shows up as a `<container>.gcp` sibling.

use crate::run::{RunIdentity, TemplateError};
use std::path::PathBuf;

/// Suffix the copy tool gives to an in-flight transfer.
pub const PARTIAL_SUFFIX: &str = ".gcp";

/// Archive state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Found,
    PartialTransfer,
    NotFound,
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ArchiveStatus::Found => "found",
            ArchiveStatus::PartialTransfer => "partial transfer",
            ArchiveStatus::NotFound => "not found",
        })
    }
}

fn partial_path(container: &std::path::Path) -> PathBuf {
    let mut name = container.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub fn archive_status(run: &RunIdentity) -> Result<ArchiveStatus, TemplateError> {
    let container = run.container_path()?;
    Ok(if container.is_file() {
        ArchiveStatus::Found
    } else if partial_path(&container).is_file() {
        ArchiveStatus::PartialTransfer
    } else {
        ArchiveStatus::NotFound
    })
}

/// Status of every run, in the order given.
pub fn check_runs(runs: &[RunIdentity]) -> Result<Vec<(RunIdentity, ArchiveStatus)>, TemplateError> {
    runs.iter()
        .map(|run| Ok((run.clone(), archive_status(run)?)))
        .collect()
}
