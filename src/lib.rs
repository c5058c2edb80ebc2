//! # ncforecast
//!
//! A Rust library for post-processing ensembles of regional ocean forecasts:
//! recalling model history from a tape archive, extracting variables, and
//! aggregating runs into climatologies, anomalies and region averages.
//!
//! ## Features
//!
//! - **Tiered cache**: member files are promoted Archive → Intermediate →
//!   Local on demand, with one bulk staging request per batch
//! - **Extraction**: one normalized file per run with `init`, `lead` and
//!   `member` coordinates
//! - **Aggregation**: member concatenation, ensemble means, monthly
//!   climatologies with cyclic smoothing, and anomalies
//! - **Region averages**: area-weighted means over named mask regions
//! - **Regression**: per-gridpoint logistic regression for exceedance
//!   probabilities
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ncforecast::batch::{BatchOptions, run_batch};
//! use ncforecast::cache::TieredCache;
//! use ncforecast::input::PipelineConfig;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::from_file("config.yaml")?;
//! let runs = config.retrospective_runs("ocean_month", Some(2020), None);
//! let cache = TieredCache::new(config.cache_config(), config.shell_tools());
//! let options = BatchOptions {
//!     variables: config.physical_variables("ocean_month")?,
//!     ..BatchOptions::default()
//! };
//! let report = run_batch(&cache, &runs, &options, &config.extracted_dir("ocean_month")).await?;
//! println!("{} runs extracted", report.extracted.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! name: NWA12_COBALT
//! filesystem:
//!   forecast_history: /archive/e{ensemble:02d}/{year}/history
//!   forecast_output_data: /work/forecasts
//!   intermediate_cache: /ptmp/cache
//!   local_cache: /vftmp/cache
//! retrospective_forecasts:
//!   first_year: 1993
//!   last_year: 2019
//!   months: [3, 6, 9, 12]
//!   ensemble_size: 10
//! new_forecasts:
//!   ensemble_size: 10
//! climatology:
//!   first_year: 1993
//!   last_year: 2019
//! variables:
//!   ocean_month: [tos, sos]
//! ```

pub mod batch;
pub mod cache;
pub mod calendar;
pub mod cleanup;
pub mod cli;
pub mod climatology;
pub mod combine;
pub mod commands;
pub mod dataset;
pub mod extract;
pub mod input;
pub mod log;
pub mod logreg;
pub mod region;
pub mod run;
pub mod status;
pub mod storage;

#[cfg(test)]
mod cli_tests;
#[cfg(test)]
mod test_support;
