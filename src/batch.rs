//! # Batch Retrieval Scheduler
//!
//! Drives the cache and the extraction engine over a whole set of runs:
//!
//! 1. classify every run (product already present, cached in some tier,
//!    archive only, or missing everywhere)
//! 2. stage all archive-only runs with one combined request, dropping the
//!    runs whose containers turn out to be unrecallable
//! 3. promote and extract the remaining runs on a bounded worker pool
//!
//! A failure in one run is logged and reported without affecting the
//! others. Only a fatal staging failure aborts the batch.

use crate::cache::{CacheError, CacheTier, TieredCache};
use crate::extract::{ExtractError, ExtractOutcome, extract};
use crate::run::RunIdentity;
use crate::storage::ArchiveTools;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that abort a whole batch
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("max_workers must be at least 1")]
    NoWorkers,

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors confined to a single run
#[derive(Error, Debug)]
pub enum RunError {
    #[error("{0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Extract(#[from] ExtractError),

    #[error("Extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Could not remove local copy: {0}")]
    Clean(#[from] std::io::Error),
}

/// Options for [`run_batch`].
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Variables to extract; empty keeps every data variable.
    pub variables: Vec<String>,
    pub max_workers: usize,
    /// Re-extract runs whose product already exists.
    pub rerun: bool,
    /// Delete each run's Local-tier copy after a successful extraction.
    pub clean: bool,
    /// Show a progress bar while extracting.
    pub progress: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            variables: Vec::new(),
            max_workers: 4,
            rerun: false,
            clean: false,
            progress: false,
        }
    }
}

/// Per-batch accounting of what happened to each run.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub extracted: Vec<RunIdentity>,
    pub skipped_existing: Vec<RunIdentity>,
    pub missing: Vec<RunIdentity>,
    pub unrecallable: Vec<RunIdentity>,
    pub failed: Vec<(RunIdentity, String)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.extracted.len()
            + self.skipped_existing.len()
            + self.missing.len()
            + self.unrecallable.len()
            + self.failed.len()
    }
}

/// Output path of the extracted product for `run` under `outdir`.
pub fn product_path(outdir: &Path, run: &RunIdentity) -> PathBuf {
    outdir.join(run.extracted_file_name())
}

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] Extracting {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

async fn process_run<T: ArchiveTools>(
    cache: &TieredCache<T>,
    run: RunIdentity,
    tier: CacheTier,
    options: &BatchOptions,
    outdir: &Path,
) -> Result<ExtractOutcome, RunError> {
    let raw = cache.fetch(&run, tier).await?;
    let out = product_path(outdir, &run);
    let variables = options.variables.clone();
    let rerun = options.rerun;
    let task_run = run.clone();
    let raw_file = raw.clone();
    let outcome =
        tokio::task::spawn_blocking(move || extract(&raw_file, &variables, &task_run, &out, rerun)).await??;
    if options.clean && outcome == ExtractOutcome::Written {
        tokio::fs::remove_file(&raw).await?;
    }
    Ok(outcome)
}

/// Retrieves and extracts every run in `runs` into `outdir`.
pub async fn run_batch<T: ArchiveTools>(
    cache: &TieredCache<T>,
    runs: &[RunIdentity],
    options: &BatchOptions,
    outdir: &Path,
) -> Result<BatchReport, BatchError> {
    if options.max_workers == 0 {
        return Err(BatchError::NoWorkers);
    }
    tokio::fs::create_dir_all(outdir).await?;

    let mut report = BatchReport::default();
    let mut pending = Vec::new();
    for run in runs {
        if product_path(outdir, run).is_file() && !options.rerun {
            report.skipped_existing.push(run.clone());
            continue;
        }
        match cache.locate(run).await? {
            Some(tier) => pending.push((run.clone(), tier)),
            None => {
                info!(
                    "{} not found; skipping.",
                    run.container_path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|_| run.to_string())
                );
                report.missing.push(run.clone());
            }
        }
    }

    let to_stage: Vec<RunIdentity> = pending
        .iter()
        .filter(|(_, tier)| *tier == CacheTier::Archive)
        .map(|(run, _)| run.clone())
        .collect();
    report.unrecallable = cache.stage(&to_stage).await?;
    pending.retain(|(run, _)| !report.unrecallable.contains(run));

    info!(
        "Extracting {} run(s) with {} worker(s)",
        pending.len(),
        options.max_workers
    );
    let pb = progress_bar(pending.len(), options.progress);
    let results: Vec<(RunIdentity, Result<ExtractOutcome, RunError>)> = stream::iter(pending)
        .map(|(run, tier)| {
            let pb = pb.clone();
            async move {
                let result = process_run(cache, run.clone(), tier, options, outdir).await;
                pb.inc(1);
                (run, result)
            }
        })
        .buffer_unordered(options.max_workers)
        .collect()
        .await;
    pb.finish_and_clear();

    for (run, result) in results {
        match result {
            Ok(ExtractOutcome::Written) => report.extracted.push(run),
            Ok(ExtractOutcome::SkippedExisting) => report.skipped_existing.push(run),
            Err(e) => {
                error!("{}: {}", run, e);
                report.failed.push((run, e.to_string()));
            }
        }
    }
    if !report.unrecallable.is_empty() {
        warn!("{} run(s) could not be recalled from the archive", report.unrecallable.len());
    }
    Ok(report)
}
