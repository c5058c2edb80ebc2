//! # Forecast Aggregation
//!
//! Combines per-run extracted products into aggregate datasets and derives
//! climatologies and anomalies from them.
//!
//! Two aggregation modes exist:
//!
//! - **members** (default): each member's runs are concatenated along
//!   `init`, then the members are concatenated along `member` with an outer
//!   join on `init`, so missing member/init combinations become NaN
//! - **ensemble mean**: the available members of each initialization are
//!   averaged first and the averages concatenated along `init`, which keeps
//!   memory bounded for large (daily) products
//!
//! [`combine_new`] handles a single freshly initialized forecast: it gathers
//! the members of one initialization and expresses them as anomalies against
//! an existing climatology.

use crate::calendar::{CALENDAR, TIME_UNITS, add_months, date_to_days, days_to_date};
use crate::climatology::{self, ClimatologyError, anomaly, init_months, month_slice, needs_smoothing};
use crate::cleanup::wildcard_match;
use crate::dataset::{Dataset, DatasetError, Encoding, Variable};
use crate::run::{TemplateError, extracted_file_name, format_template};
use indexmap::IndexMap;
use log::{info, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Variables carried over from older extraction tools and dropped on combine.
pub const LEGACY_VARIABLES: [&str; 4] = ["ens", "verif", "mstart", "ystart"];

/// Deflate level for aggregated data variables.
pub const DEFLATE_LEVEL: i32 = 3;

/// Errors that can occur while combining forecasts
#[derive(Error, Debug)]
pub enum CombineError {
    #[error("No extracted files found for {0}")]
    NoInputs(String),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Climatology error: {0}")]
    Climatology(#[from] ClimatologyError),

    #[error("Invalid output name template: {0}")]
    Template(#[from] TemplateError),

    #[error("Invalid date encoded in '{0}'")]
    InvalidDate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CombineResult<T> = Result<T, CombineError>;

/// One extracted product available for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedInput {
    pub year: i32,
    pub month: u32,
    pub member: u32,
    pub path: PathBuf,
}

/// What to aggregate.
#[derive(Debug, Clone)]
pub struct CombineRequest {
    pub var: String,
    pub domain: String,
    /// Climatology window, inclusive.
    pub first_year: i32,
    pub last_year: i32,
    /// Keep only the ensemble mean instead of individual members.
    pub mean_mode: bool,
}

/// Result of [`combine`].
#[derive(Debug, Clone)]
pub struct Combined {
    pub climatology: Dataset,
    /// Aggregated forecasts with `<var>_anom` next to `<var>`.
    pub forecast: Dataset,
}

pub fn climatology_file_name(domain: &str, var: &str, first_year: i32, last_year: i32) -> String {
    format!("climatology_{}_{}_{}_{}.nc", domain, var, first_year, last_year)
}

pub fn forecast_file_name(domain: &str, var: &str, mean_mode: bool) -> String {
    if mean_mode {
        format!("forecasts_{}_{}_ensmean.nc", domain, var)
    } else {
        format!("forecasts_{}_{}.nc", domain, var)
    }
}

pub fn anomaly_name(var: &str) -> String {
    format!("{}_anom", var)
}

/// Lists the extracted products present under `extracted_dir` for every
/// year, month and member `1..=ensemble_size`.
pub fn discover_inputs(
    extracted_dir: &Path,
    domain: &str,
    years: std::ops::RangeInclusive<i32>,
    months: &[u32],
    ensemble_size: u32,
) -> Vec<ExtractedInput> {
    let mut inputs = Vec::new();
    for member in 1..=ensemble_size {
        for year in years.clone() {
            for &month in months {
                let path = extracted_dir.join(extracted_file_name(year, month, member, domain));
                if path.is_file() {
                    inputs.push(ExtractedInput {
                        year,
                        month,
                        member,
                        path,
                    });
                }
            }
        }
    }
    inputs
}

fn load(path: &Path, var: &str) -> CombineResult<Dataset> {
    let mut ds = Dataset::open(path)?.select(&[var])?;
    ds.drop_vars(&LEGACY_VARIABLES);
    Ok(ds)
}

/// Sets `lead` to `0..N-1`, keeping its attributes.
fn renumber_lead(ds: &mut Dataset) -> CombineResult<()> {
    let Some(n) = ds.dim_len("lead") else {
        return Ok(());
    };
    let mut lead = Variable::from_vec("lead", (0..n).map(|i| i as f64).collect());
    if let Some(existing) = ds.coord("lead") {
        lead.attrs = existing.attrs.clone();
    }
    ds.add_coord("lead", lead)?;
    Ok(())
}

/// Concatenates the inputs into one dataset holding `var`.
fn aggregate(request: &CombineRequest, inputs: &[ExtractedInput]) -> CombineResult<Dataset> {
    let var = request.var.as_str();
    let combined = if request.mean_mode {
        let mut by_init: IndexMap<(i32, u32), Vec<&ExtractedInput>> = IndexMap::new();
        for input in inputs {
            by_init.entry((input.year, input.month)).or_default().push(input);
        }
        let mut means = Vec::with_capacity(by_init.len());
        for ((year, month), members) in by_init {
            info!("Ensemble mean of {} member(s) for {}-{:02}", members.len(), year, month);
            let parts = members
                .iter()
                .map(|m| load(&m.path, var))
                .collect::<CombineResult<Vec<_>>>()?;
            let mut mean = if parts.len() == 1 {
                parts.into_iter().next().unwrap_or_default()
            } else {
                Dataset::concat(&parts, "member")?.mean_over("member")?
            };
            mean.drop_vars(&["member"]);
            means.push(mean);
        }
        info!("Concatenating {} ensemble means along init", means.len());
        Dataset::concat(&means, "init")?
    } else {
        let mut by_member: IndexMap<u32, Vec<&ExtractedInput>> = IndexMap::new();
        for input in inputs {
            by_member.entry(input.member).or_default().push(input);
        }
        let mut members = Vec::with_capacity(by_member.len());
        for (member, runs) in by_member {
            info!("Concatenating {} initialization(s) of member {:02}", runs.len(), member);
            let parts = runs
                .iter()
                .map(|r| load(&r.path, var))
                .collect::<CombineResult<Vec<_>>>()?;
            members.push(Dataset::concat(&parts, "init")?);
        }
        info!("Concatenating {} member(s)", members.len());
        Dataset::concat(&members, "member")?
    };

    let mut ds = combined.sort_by("init")?;
    ds.drop_vars(&LEGACY_VARIABLES);
    renumber_lead(&mut ds)?;
    ds.set_unlimited(None);
    Ok(ds)
}

/// Aggregates `inputs`, then derives the climatology of `request.var` and
/// its anomalies.
pub fn combine(request: &CombineRequest, inputs: &[ExtractedInput]) -> CombineResult<Combined> {
    if inputs.is_empty() {
        return Err(CombineError::NoInputs(format!("{} in {}", request.var, request.domain)));
    }
    let var = request.var.as_str();
    let mut forecast = aggregate(request, inputs)?;

    let ensmean = if request.mean_mode {
        forecast.clone()
    } else {
        forecast.mean_over("member")?
    };
    let lead_len = forecast.dim_len("lead").unwrap_or(0);
    let smooth = needs_smoothing(&request.domain, lead_len);
    let clim = climatology::climatology(&ensmean, var, request.first_year, request.last_year, smooth)?;

    let anom = anomaly(&forecast, var, &clim)?;
    forecast.add_data_var(&anomaly_name(var), anom)?;
    if let Some(months) = init_months(&forecast) {
        forecast.add_coord("month", months)?;
    }
    Ok(Combined {
        climatology: clim,
        forecast,
    })
}

fn aggregate_encoding(ds: &Dataset) -> Encoding {
    let mut enc = Encoding::new();
    for name in ["member", "month", "lead"] {
        if ds.contains(name) {
            enc = enc.int32(name);
        }
    }
    for name in ds.data_var_names() {
        enc = enc.compress(&name, DEFLATE_LEVEL);
    }
    enc
}

/// Writes the climatology and forecast products into `outdir`, returning
/// their paths.
pub fn write_products(
    request: &CombineRequest,
    combined: &Combined,
    outdir: &Path,
) -> CombineResult<(PathBuf, PathBuf)> {
    let clim_path = outdir.join(climatology_file_name(
        &request.domain,
        &request.var,
        request.first_year,
        request.last_year,
    ));
    info!("Writing climatology {}", clim_path.display());
    combined
        .climatology
        .write(&clim_path, &aggregate_encoding(&combined.climatology))?;

    let forecast_path = outdir.join(forecast_file_name(&request.domain, &request.var, request.mean_mode));
    info!("Writing forecasts {}", forecast_path.display());
    combined
        .forecast
        .write(&forecast_path, &aggregate_encoding(&combined.forecast))?;
    Ok((clim_path, forecast_path))
}

/// Settings for combining one new initialization.
#[derive(Debug, Clone)]
pub struct NewForecastRequest {
    pub year: i32,
    pub month: u32,
    pub domain: String,
    pub variables: Vec<String>,
    /// Directory holding the extracted member files.
    pub extracted_dir: PathBuf,
    /// Directory holding `climatology_*.nc` products.
    pub climatology_dir: PathBuf,
    pub climatology_first_year: i32,
    pub climatology_last_year: i32,
    /// Output name template with `{freq}`, `{var}`, `{year}`, `{month}`.
    pub combined_name: String,
    pub output_dir: PathBuf,
}

/// Member files of one initialization, sorted by name.
pub fn new_forecast_members(extracted_dir: &Path, year: i32, month: u32, domain: &str) -> CombineResult<Vec<PathBuf>> {
    let pattern = format!("{}-{:02}-e??.{}.nc", year, month, domain);
    let mut files = Vec::new();
    for entry in std::fs::read_dir(extracted_dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| wildcard_match(&pattern, n));
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `valid_time` for every lead of an initialization, in days since the
/// epoch, and the output frequency label.
fn valid_times(init: f64, leads: &[f64], daily: bool) -> CombineResult<Vec<f64>> {
    let date = days_to_date(init).ok_or_else(|| CombineError::InvalidDate("init".to_string()))?;
    leads
        .iter()
        .map(|&lead| {
            if daily {
                Ok(init + lead)
            } else {
                add_months(date, lead.max(0.0) as u32)
                    .map(date_to_days)
                    .ok_or_else(|| CombineError::InvalidDate("valid_time".to_string()))
            }
        })
        .collect()
}

/// Combines the members of one new initialization into one file per
/// variable, with anomalies against the stored climatology.
pub fn combine_new(request: &NewForecastRequest) -> CombineResult<Vec<PathBuf>> {
    let files = new_forecast_members(&request.extracted_dir, request.year, request.month, &request.domain)?;
    if files.is_empty() {
        return Err(CombineError::NoInputs(format!(
            "{}-{:02} in {}",
            request.year,
            request.month,
            request.extracted_dir.display()
        )));
    }
    info!("Combining {} member(s) of {}-{:02}", files.len(), request.year, request.month);
    let parts = files
        .iter()
        .map(|f| {
            let mut ds = Dataset::open(f)?;
            ds.drop_vars(&LEGACY_VARIABLES);
            Ok(ds)
        })
        .collect::<CombineResult<Vec<_>>>()?;
    let mut members = Dataset::concat(&parts, "member")?;
    members.squeeze("init")?;
    members.set_unlimited(None);

    let init = members
        .coord("init")
        .and_then(|c| c.values().first().copied())
        .ok_or_else(|| CombineError::InvalidDate("init".to_string()))?;
    let leads = members.coord_values("lead").unwrap_or_default();
    let daily = members.coord("lead").and_then(|l| l.text_attr("units")) == Some("days");
    let freq = if daily { "daily" } else { "monthly" };
    let valid_time = Variable::from_vec("lead", valid_times(init, &leads, daily)?)
        .with_attr("units", TIME_UNITS)
        .with_attr("calendar", CALENDAR);

    std::fs::create_dir_all(&request.output_dir)?;
    let mut written = Vec::with_capacity(request.variables.len());
    for var in &request.variables {
        info!("{}", var);
        let clim_path = request.climatology_dir.join(climatology_file_name(
            &request.domain,
            var,
            request.climatology_first_year,
            request.climatology_last_year,
        ));
        let clim_slice = if clim_path.is_file() {
            let clim = Dataset::open(&clim_path)?;
            month_slice(&clim, var, request.month)
        } else {
            None
        };

        let mut res = members.select(&[var.as_str()])?;
        res.add_data_var("valid_time", valid_time.clone())?;
        let mut anom = res.require(var)?.clone();
        anom.attrs.retain(|k, _| k == "units");
        match clim_slice {
            Some(c) => {
                if !climatology::subtract_broadcast(&mut anom.data, &c) {
                    return Err(ClimatologyError::ShapeMismatch(var.clone()).into());
                }
            }
            None => {
                warn!(
                    "Climatology not found for month {}. Setting anomalies to NaN",
                    request.month
                );
                anom.data.fill(f64::NAN);
            }
        }
        res.add_data_var(&anomaly_name(var), anom)?;
        res.transpose_front(&["lead", "member"]);

        let name = format_template(
            &request.combined_name,
            &[
                ("freq", freq.to_string()),
                ("var", var.clone()),
                ("year", request.year.to_string()),
                ("month", request.month.to_string()),
            ],
        )?;
        let path = request.output_dir.join(name);
        let mut enc = Encoding::new().compress(var, DEFLATE_LEVEL).compress(&anomaly_name(var), DEFLATE_LEVEL);
        for int_var in ["lead", "member", "month", "valid_time"] {
            if res.contains(int_var) {
                enc = enc.int32(int_var);
            }
        }
        res.write(&path, &enc)?;
        written.push(path);
    }
    Ok(written)
}
