//! # Input Configuration Module
//!
//! This module provides configuration parsing and validation for forecast
//! post-processing jobs. A single YAML (or JSON) file describes where the
//! forecast archive lives, which retrospective runs exist, the climatology
//! period, which variables to process per domain, and the regions to average.
//!
//! ## Configuration Structure
//!
//! - **name**: experiment name, used in cache paths
//! - **filesystem**: archive template, output root and cache roots
//! - **retrospective_forecasts**: years, initialization months, ensemble size
//! - **new_forecasts**: ensemble size of real-time forecasts
//! - **climatology**: first and last year of the reference period
//! - **variables**: per-domain variable lists
//! - **regions**: mask file and region names
//! - **tools**: external commands used for staging, copying and unpacking
//!
//! ## Variable Lists
//!
//! Each entry is either a plain variable name or a vector pair:
//!
//! ```yaml
//! variables:
//!   ocean_month:
//!     - tos
//!     - name: ssuv
//!       u: ssu
//!       v: ssv
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use ncforecast::input::PipelineConfig;
//!
//! let config = PipelineConfig::from_file("config.yaml")?;
//! let names = config.physical_variables("ocean_month")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::cache::CacheConfig;
use crate::run::RunIdentity;
use crate::storage::ShellTools;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading or validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported configuration format '{0}' (expected .yaml, .yml or .json)")]
    UnsupportedFormat(String),

    #[error("Domain '{0}' has no variables configured")]
    UnknownDomain(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Combined new-forecast file name used when none is configured.
pub const DEFAULT_COMBINED_NAME: &str = "forecast_{freq}_{var}_{year}-{month:02d}.nc";

/// Locations of the archive, outputs and cache tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filesystem {
    /// Archive directory template with `{year}`, `{month}` and `{ensemble}`
    /// placeholders.
    pub forecast_history: String,
    /// Root of every product written by the pipeline.
    pub forecast_output_data: PathBuf,
    pub intermediate_cache: PathBuf,
    pub local_cache: PathBuf,
    /// Name of the combined new-forecast file, as a template over `{year}`
    /// and `{month}`.
    #[serde(default)]
    pub combined_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrospectiveForecasts {
    pub first_year: i32,
    pub last_year: i32,
    pub months: Vec<u32>,
    pub ensemble_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewForecasts {
    pub ensemble_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Climatology {
    pub first_year: i32,
    pub last_year: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regions {
    pub mask_file: PathBuf,
    pub names: Vec<String>,
}

/// External commands used by the archive tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tools {
    #[serde(default = "default_stage_command")]
    pub stage_command: String,
    #[serde(default = "default_copy_command")]
    pub copy_command: String,
    #[serde(default = "default_tar_command")]
    pub tar_command: String,
}

fn default_stage_command() -> String {
    "dmget".to_string()
}

fn default_copy_command() -> String {
    "gcp".to_string()
}

fn default_tar_command() -> String {
    "tar".to_string()
}

impl Default for Tools {
    fn default() -> Self {
        Tools {
            stage_command: default_stage_command(),
            copy_command: default_copy_command(),
            tar_command: default_tar_command(),
        }
    }
}

/// A configured variable: a single field, or the two components of a vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableSpec {
    Scalar(String),
    VectorPair { name: String, u: String, v: String },
}

impl VariableSpec {
    /// Name under which the variable is configured.
    pub fn name(&self) -> &str {
        match self {
            VariableSpec::Scalar(name) => name,
            VariableSpec::VectorPair { name, .. } => name,
        }
    }

    /// Names of the variables actually present in model output.
    pub fn physical_names(&self) -> Vec<String> {
        match self {
            VariableSpec::Scalar(name) => vec![name.clone()],
            VariableSpec::VectorPair { u, v, .. } => vec![u.clone(), v.clone()],
        }
    }
}

/// Expands a variable list into physical variable names, keeping order and
/// dropping repeats.
pub fn expand_variables(specs: &[VariableSpec]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in specs.iter().flat_map(VariableSpec::physical_names) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Complete configuration of a post-processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub filesystem: Filesystem,
    pub retrospective_forecasts: RetrospectiveForecasts,
    pub new_forecasts: NewForecasts,
    pub climatology: Climatology,
    pub variables: IndexMap<String, Vec<VariableSpec>>,
    #[serde(default)]
    pub regions: Option<Regions>,
    #[serde(default)]
    pub tools: Tools,
}

impl PipelineConfig {
    /// Loads a configuration file, choosing YAML or JSON by its extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn from_yaml(yaml_str: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(yaml_str)?)
    }

    pub fn from_json(json_str: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json_str)?)
    }

    /// Checks the configuration for values no job could run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let retro = &self.retrospective_forecasts;
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("name must not be empty".to_string()));
        }
        if retro.first_year > retro.last_year {
            return Err(ConfigError::Invalid(format!(
                "retrospective_forecasts.first_year ({}) is after last_year ({})",
                retro.first_year, retro.last_year
            )));
        }
        if retro.months.is_empty() {
            return Err(ConfigError::Invalid("retrospective_forecasts.months is empty".to_string()));
        }
        if let Some(month) = retro.months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(ConfigError::Invalid(format!("month {month} is outside 1-12")));
        }
        if retro.ensemble_size == 0 || self.new_forecasts.ensemble_size == 0 {
            return Err(ConfigError::Invalid("ensemble_size must be at least 1".to_string()));
        }
        if self.climatology.first_year > self.climatology.last_year {
            return Err(ConfigError::Invalid(format!(
                "climatology.first_year ({}) is after last_year ({})",
                self.climatology.first_year, self.climatology.last_year
            )));
        }
        if self.variables.is_empty() {
            return Err(ConfigError::Invalid("no variables configured".to_string()));
        }
        for (domain, specs) in &self.variables {
            for spec in specs {
                if spec.physical_names().iter().any(|n| n.trim().is_empty()) {
                    return Err(ConfigError::Invalid(format!(
                        "domain '{domain}' has an empty variable name in '{}'",
                        spec.name()
                    )));
                }
            }
        }
        if let Some(regions) = &self.regions {
            if regions.names.is_empty() {
                return Err(ConfigError::Invalid("regions.names is empty".to_string()));
            }
        }
        Ok(())
    }

    /// Configured variables of `domain`.
    pub fn domain_variables(&self, domain: &str) -> ConfigResult<&[VariableSpec]> {
        self.variables
            .get(domain)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigError::UnknownDomain(domain.to_string()))
    }

    /// Physical variable names of `domain`, vector pairs expanded.
    pub fn physical_variables(&self, domain: &str) -> ConfigResult<Vec<String>> {
        Ok(expand_variables(self.domain_variables(domain)?))
    }

    /// Retrospective runs of `domain`, optionally narrowed to one year and
    /// one month.
    pub fn retrospective_runs(&self, domain: &str, year: Option<i32>, month: Option<u32>) -> Vec<RunIdentity> {
        let retro = &self.retrospective_forecasts;
        let years = match year {
            Some(y) => y..=y,
            None => retro.first_year..=retro.last_year,
        };
        let months = match month {
            Some(m) => vec![m],
            None => retro.months.clone(),
        };
        RunIdentity::grid(
            years,
            &months,
            retro.ensemble_size,
            domain,
            &self.name,
            &self.filesystem.forecast_history,
        )
    }

    /// Every member of one real-time forecast.
    pub fn new_forecast_runs(&self, domain: &str, year: i32, month: u32) -> Vec<RunIdentity> {
        RunIdentity::grid(
            year..=year,
            &[month],
            self.new_forecasts.ensemble_size,
            domain,
            &self.name,
            &self.filesystem.forecast_history,
        )
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            local_root: self.filesystem.local_cache.clone(),
            intermediate_root: self.filesystem.intermediate_cache.clone(),
        }
    }

    pub fn shell_tools(&self) -> ShellTools {
        ShellTools::new(&self.tools.stage_command, &self.tools.copy_command, &self.tools.tar_command)
    }

    /// `<output>/extracted/<domain>`
    pub fn extracted_dir(&self, domain: &str) -> PathBuf {
        self.filesystem.forecast_output_data.join("extracted").join(domain)
    }

    /// `<output>/extracted_region_average/<domain>`
    pub fn extracted_region_dir(&self, domain: &str) -> PathBuf {
        self.filesystem
            .forecast_output_data
            .join("extracted_region_average")
            .join(domain)
    }

    /// `<output>/individual`
    pub fn individual_dir(&self) -> PathBuf {
        self.filesystem.forecast_output_data.join("individual")
    }

    /// `<output>/post_post_processed`
    pub fn postprocessed_dir(&self) -> PathBuf {
        self.filesystem.forecast_output_data.join("post_post_processed")
    }

    /// Name template of combined new-forecast files.
    pub fn combined_name(&self) -> &str {
        self.filesystem
            .combined_name
            .as_deref()
            .unwrap_or(DEFAULT_COMBINED_NAME)
    }

    /// Local-tier directories of every retrospective ensemble member.
    pub fn local_member_dirs(&self) -> Vec<PathBuf> {
        let size = self
            .retrospective_forecasts
            .ensemble_size
            .max(self.new_forecasts.ensemble_size);
        (1..=size)
            .map(|e| crate::run::local_dir(&self.filesystem.local_cache, &self.name, e))
            .collect()
    }
}
