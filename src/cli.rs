//! # CLI Module
//!
//! This module provides the command-line interface for ncforecast, including:
//! - Argument parsing with clap
//! - Environment variable support with the NCFORECAST_ prefix
//! - Subcommands for every pipeline stage
//! - Parsers for variable lists and initialization months

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Archive retrieval, extraction and climatology aggregation for ocean forecasts
#[derive(Parser, Debug)]
#[command(name = "ncforecast")]
#[command(about = "Retrieve, extract and aggregate NetCDF ocean forecast ensembles")]
#[command(version)]
#[command(long_about = "
ncforecast post-processes ensembles of regional ocean forecasts. It recalls
model history from a tape archive through a tiered cache, extracts the
configured variables into one file per run, and aggregates them into
climatologies, anomalies and region averages.

STAGES:
  • extract: recall and extract retrospective or new forecasts
  • combine: build climatologies and anomaly forecasts
  • combine-new: combine the members of one real-time forecast
  • region-average: area-weighted means over named regions
  • logreg: fit exceedance-probability regression coefficients
  • cleanup: remove extracted products and local cache copies
  • status: check which runs have reached the archive

EXAMPLES:
  # Extract all retrospective runs of a domain
  ncforecast -c config.yaml extract -d ocean_month

  # Extract one new forecast, cleaning the local cache as it goes
  ncforecast -c config.yaml extract -d ocean_daily --new -y 2024 -m 3 --clean

  # Climatology and anomalies for two variables, ensemble mean only
  ncforecast -c config.yaml combine -d ocean_month --var tos,sos --mean

  # Region averages of the combined files
  ncforecast -c config.yaml region-average -d ocean_month --var tos

  # Exceedance regression against gridded observations
  ncforecast -c config.yaml logreg --var tos --observations glorys_tos.nc

  # Generate completions
  ncforecast completions bash > ~/.bash_completion.d/ncforecast
")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode - suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(short, long, global = true, env = "NCFORECAST_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter implied by the verbosity flags.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Recall forecast runs from the archive and extract variables
    #[command(long_about = "
Recall forecast runs through the tiered cache and extract the configured
variables into one file per run under <output>/extracted/<domain>/.

Runs whose extracted file already exists are skipped unless --rerun is given.
All runs that need an archive recall are staged in a single request.

EXAMPLES:
  # Every retrospective run
  ncforecast -c config.yaml extract -d ocean_month

  # Only March initializations of 2010, four runs at a time
  ncforecast -c config.yaml extract -d ocean_month -y 2010 -m 3 --workers 4

  # Show where each run would come from without touching anything
  ncforecast -c config.yaml extract -d ocean_month --dry-run
")]
    Extract {
        /// Model output domain
        #[arg(short, long, default_value = "ocean_month", env = "NCFORECAST_DOMAIN")]
        domain: String,

        /// Initialization year (default: every configured year)
        #[arg(short, long)]
        year: Option<i32>,

        /// Initialization month (default: every configured month)
        #[arg(short, long, value_parser = parse_month)]
        month: Option<u32>,

        /// Extract a new forecast using the new-forecast ensemble size
        #[arg(long, requires_all = ["year", "month"])]
        new: bool,

        /// Variables to extract: comma-separated names or 'all'
        #[arg(long, value_parser = parse_var_selection, default_value = "all")]
        var: VarSelection,

        /// Re-extract runs whose output already exists
        #[arg(short, long)]
        rerun: bool,

        /// Delete each run's local cache copy after extraction
        #[arg(long)]
        clean: bool,

        /// Report which tier holds each run and exit
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of runs processed concurrently
        #[arg(short, long, default_value_t = 4, env = "NCFORECAST_WORKERS")]
        workers: usize,
    },

    /// Build climatologies and anomaly forecasts from extracted runs
    #[command(long_about = "
Combine extracted retrospective runs of each variable into
forecasts_<domain>_<var>[_ensmean].nc and
climatology_<domain>_<var>_<first>_<last>.nc under the output root.

EXAMPLES:
  # One variable, all members
  ncforecast -c config.yaml combine -d ocean_month --var tos

  # Every configured variable, ensemble mean only
  ncforecast -c config.yaml combine -d ocean_month --mean
")]
    Combine {
        /// Model output domain
        #[arg(short, long, default_value = "ocean_month", env = "NCFORECAST_DOMAIN")]
        domain: String,

        /// Variables to combine: comma-separated names or 'all'
        #[arg(long, value_parser = parse_var_selection, default_value = "all")]
        var: VarSelection,

        /// Keep only the ensemble mean, dropping individual members
        #[arg(long)]
        mean: bool,
    },

    /// Combine the members of one new forecast with anomalies
    CombineNew {
        /// Model output domain
        #[arg(short, long, default_value = "ocean_month", env = "NCFORECAST_DOMAIN")]
        domain: String,

        /// Initialization year
        #[arg(short, long)]
        year: i32,

        /// Initialization month
        #[arg(short, long, value_parser = parse_month)]
        month: u32,

        /// Variables to combine: comma-separated names or 'all'
        #[arg(long, value_parser = parse_var_selection, default_value = "all")]
        var: VarSelection,

        /// Output directory (default: <output>/individual)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Area-weighted averages over the configured regions
    RegionAverage {
        /// Model output domain
        #[arg(short, long, default_value = "ocean_month", env = "NCFORECAST_DOMAIN")]
        domain: String,

        /// Variables whose combined files are averaged: comma-separated or 'all'
        #[arg(long, value_parser = parse_var_selection, default_value = "all")]
        var: VarSelection,

        /// Average the ensemble-mean combined files
        #[arg(long)]
        mean: bool,

        /// Average every extracted run file instead of the combined files
        #[arg(long, conflicts_with = "mean")]
        extracted: bool,

        /// Recompute averages that already exist
        #[arg(short, long)]
        rerun: bool,
    },

    /// Fit logistic-regression exceedance coefficients at every grid point
    Logreg {
        /// Model output domain of the combined forecast
        #[arg(short, long, default_value = "ocean_month", env = "NCFORECAST_DOMAIN")]
        domain: String,

        /// Forecast variable of the combined file
        #[arg(long)]
        var: String,

        /// Gridded observations [time, y, x] on the forecast grid
        #[arg(long, env = "NCFORECAST_OBSERVATIONS")]
        observations: PathBuf,

        /// Observed variable name (default: same as --var)
        #[arg(long)]
        obs_var: Option<String>,

        /// Quantile levels of the observations, comma-separated
        #[arg(long, value_delimiter = ',', default_value = "0.1,0.33,0.5,0.67,0.9")]
        quantiles: Vec<f64>,

        /// First initialization year used in the fit
        #[arg(long, requires = "last_year")]
        first_year: Option<i32>,

        /// Last initialization year used in the fit
        #[arg(long, requires = "first_year")]
        last_year: Option<i32>,

        /// Output file (default: <output>/post_post_processed/logreg_coefs_forecast_<var>.nc)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove extracted products and local cache copies of a domain
    Cleanup {
        /// Model output domain
        #[arg(short, long, default_value = "ocean_month", env = "NCFORECAST_DOMAIN")]
        domain: String,

        /// List the files without deleting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Check which retrospective runs have reached the archive
    Status {
        /// Model output domain
        #[arg(short, long, default_value = "ocean_month", env = "NCFORECAST_DOMAIN")]
        domain: String,

        /// Only this initialization year
        #[arg(short, long)]
        year: Option<i32>,

        /// Only this initialization month
        #[arg(short, long, value_parser = parse_month)]
        month: Option<u32>,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file to validate (default: --config)
        config_file: Option<PathBuf>,

        /// Print the parsed configuration
        #[arg(long)]
        detailed: bool,
    },

    /// Generate shell completions
    #[command(long_about = "
Generate shell completion scripts for bash, zsh, fish and PowerShell.

EXAMPLES:
  # Bash
  ncforecast completions bash > ~/.bash_completion.d/ncforecast

  # Zsh, written to a file
  ncforecast completions zsh -o _ncforecast
")]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Which variables a command operates on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VarSelection {
    /// Every variable configured for the domain
    All,
    /// Named variables, in the order given
    Names(Vec<String>),
}

/// Parse a variable selection: `all` or a comma-separated list of names
fn parse_var_selection(s: &str) -> Result<VarSelection, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok(VarSelection::All);
    }
    let names: Vec<String> = s.split(',').map(|n| n.trim().to_string()).collect();
    if names.iter().any(|n| n.is_empty()) {
        return Err(format!("Invalid variable list '{}': empty name", s));
    }
    Ok(VarSelection::Names(names))
}

/// Parse a calendar month number
fn parse_month(s: &str) -> Result<u32, String> {
    let month: u32 = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid month '{}'", s))?;
    if !(1..=12).contains(&month) {
        return Err(format!("Month must be between 1 and 12, got {}", month));
    }
    Ok(month)
}
