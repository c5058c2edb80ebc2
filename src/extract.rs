//! # Extraction & Normalization
//!
//! Turns one raw model history file into a standardized per-run product:
//!
//! - only the requested variables are kept
//! - the `time` dimension becomes `lead`, numbered `0..N-1` in `months` or
//!   `days` since initialization
//! - `init` (the run's initialization date) becomes a length-one, unlimited
//!   leading dimension and `member` a scalar coordinate
//! - every data variable is compressed at deflate level 3
//!
//! Extraction is idempotent: an existing product is left untouched unless a
//! rerun is requested, and products are written atomically.

use crate::calendar::{CALENDAR, TIME_UNITS, date_to_days, init_date};
use crate::dataset::{Dataset, DatasetError, Encoding, Variable};
use crate::run::{RunIdentity, TemplateError};
use log::{debug, info};
use std::path::Path;
use thiserror::Error;

/// Deflate level applied to every extracted data variable.
pub const DEFLATE_LEVEL: i32 = 3;

/// Errors that can occur while extracting a run
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("File {0} has no 'time' dimension")]
    MissingTime(String),

    #[error("Invalid initialization date {0}-{1:02}")]
    InvalidDate(i32, u32),

    #[error("Invalid archive template: {0}")]
    Template(#[from] TemplateError),
}

/// Result type for extraction
pub type ExtractResult<T> = Result<T, ExtractError>;

/// What [`extract`] did for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Written,
    SkippedExisting,
}

/// Units of `lead` for a run with `steps` time steps in `domain`.
pub fn lead_units(domain: &str, steps: usize) -> &'static str {
    if steps > 12 || domain.contains("daily") {
        "days"
    } else {
        "months"
    }
}

/// Builds the normalized product for `run` from an already opened raw file.
///
/// An empty `variables` list keeps every data variable.
pub fn normalize(raw: &Dataset, variables: &[String], run: &RunIdentity) -> ExtractResult<Dataset> {
    let names: Vec<String> = if variables.is_empty() {
        raw.data_var_names()
    } else {
        variables.to_vec()
    };
    let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let mut ds = raw.select(&refs)?;

    let steps = ds
        .dim_len("time")
        .ok_or_else(|| ExtractError::MissingTime(run.member_file_name()))?;
    ds.remove_variable("time");
    ds.rename_dim("time", "lead")?;
    ds.add_coord(
        "lead",
        Variable::from_vec("lead", (0..steps).map(|i| i as f64).collect())
            .with_attr("units", lead_units(&run.domain, steps)),
    )?;

    let init = init_date(run.init_year, run.init_month)
        .ok_or(ExtractError::InvalidDate(run.init_year, run.init_month))?;
    ds.add_coord("member", Variable::scalar(run.ensemble_member as f64))?;
    ds.add_coord(
        "init",
        Variable::scalar(date_to_days(init))
            .with_attr("units", TIME_UNITS)
            .with_attr("calendar", CALENDAR),
    )?;
    ds.expand_dims("init")?;
    ds.set_unlimited(Some("init"));

    let archive_dir = run.archive_dir()?;
    let version = archive_dir
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    ds.set_attr(&format!("cefi_archive_version_ens{:02}", run.ensemble_member), version);
    Ok(ds)
}

/// Encoding used for every extracted product.
pub fn product_encoding(ds: &Dataset) -> Encoding {
    ds.data_var_names()
        .iter()
        .fold(Encoding::new().int32("member").int32("lead").unlimited("init"), |enc, name| {
            enc.compress(name, DEFLATE_LEVEL)
        })
}

/// Extracts `variables` for `run` from `raw_file` into `out_file`.
pub fn extract(
    raw_file: &Path,
    variables: &[String],
    run: &RunIdentity,
    out_file: &Path,
    rerun: bool,
) -> ExtractResult<ExtractOutcome> {
    if out_file.is_file() && !rerun {
        debug!("{} exists; skipping", out_file.display());
        return Ok(ExtractOutcome::SkippedExisting);
    }
    info!("Extracting {} -> {}", raw_file.display(), out_file.display());
    let raw = Dataset::open(raw_file)?;
    let product = normalize(&raw, variables, run)?;
    product.write(out_file, &product_encoding(&product))?;
    Ok(ExtractOutcome::Written)
}
