//! # Forecast Run Descriptor
//!
//! A [`RunIdentity`] names one forecast run (initialization year and month,
//! ensemble member, history domain) and derives every path the pipeline
//! needs for it. Path derivation is a set of pure functions of the identity
//! fields: nothing here touches the filesystem.
//!
//! | Item | Form |
//! |------|------|
//! | archive directory | `forecast_history` template with `{year}`, `{month}`, `{ensemble}` |
//! | container | `{year}{month:02}01.nc.tar` |
//! | member file | `{year}{month:02}01.{domain}.nc` |
//! | intermediate dir | `<root>/<archive dir without leading />/{year}{month:02}01.nc` |
//! | local dir | `<root>/forecast_data/<name>/e{ensemble:02}` |
//! | extracted file | `{year}-{month:02}-e{ensemble:02}.{domain}.nc` |

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors raised while expanding path templates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Unknown placeholder '{{{0}}}' in template '{1}'")]
    UnknownPlaceholder(String, String),

    #[error("Invalid format spec '{0}' in template '{1}'")]
    InvalidFormat(String, String),

    #[error("Unterminated placeholder in template '{0}'")]
    Unterminated(String),
}

/// Expands `{key}` and `{key:0Nd}` placeholders from `values`.
///
/// `{{` and `}}` produce literal braces.
pub fn format_template(template: &str, values: &[(&str, String)]) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => return Err(TemplateError::Unterminated(template.to_string())),
                    }
                }
                let (key, spec) = match field.split_once(':') {
                    Some((k, s)) => (k, Some(s)),
                    None => (field.as_str(), None),
                };
                let value = values
                    .iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v)
                    .ok_or_else(|| TemplateError::UnknownPlaceholder(key.to_string(), template.to_string()))?;
                match spec {
                    None => out.push_str(value),
                    Some(spec) => out.push_str(&pad(value, spec, template)?),
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn pad(value: &str, spec: &str, template: &str) -> Result<String, TemplateError> {
    let invalid = || TemplateError::InvalidFormat(spec.to_string(), template.to_string());
    let digits = spec.strip_suffix('d').unwrap_or(spec);
    let (zero, width) = match digits.strip_prefix('0') {
        Some(rest) => (true, rest),
        None => (false, digits),
    };
    if width.is_empty() {
        return Ok(value.to_string());
    }
    let width: usize = width.parse().map_err(|_| invalid())?;
    Ok(if zero {
        format!("{:0>width$}", value, width = width)
    } else {
        format!("{:>width$}", value, width = width)
    })
}

/// Archive directory for one run, from the `forecast_history` template.
pub fn archive_dir(template: &str, year: i32, month: u32, ensemble: u32) -> Result<PathBuf, TemplateError> {
    format_template(
        template,
        &[
            ("year", year.to_string()),
            ("month", month.to_string()),
            ("ensemble", ensemble.to_string()),
        ],
    )
    .map(PathBuf::from)
}

pub fn container_name(year: i32, month: u32) -> String {
    format!("{}{:02}01.nc.tar", year, month)
}

pub fn member_file_name(year: i32, month: u32, domain: &str) -> String {
    format!("{}{:02}01.{}.nc", year, month, domain)
}

/// Intermediate-tier directory mirroring the archive layout under `root`.
pub fn intermediate_dir(root: &Path, archive_dir: &Path, year: i32, month: u32) -> PathBuf {
    let relative: PathBuf = archive_dir
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    root.join(relative).join(format!("{}{:02}01.nc", year, month))
}

/// Local-tier directory private to one experiment and member.
pub fn local_dir(root: &Path, name: &str, ensemble: u32) -> PathBuf {
    root.join("forecast_data").join(name).join(format!("e{:02}", ensemble))
}

pub fn extracted_file_name(year: i32, month: u32, ensemble: u32, domain: &str) -> String {
    format!("{}-{:02}-e{:02}.{}.nc", year, month, ensemble, domain)
}

/// Immutable identity of one forecast run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunIdentity {
    pub init_year: i32,
    pub init_month: u32,
    pub ensemble_member: u32,
    pub domain: String,
    pub name: String,
    pub archive_template: String,
}

impl RunIdentity {
    pub fn new(
        init_year: i32,
        init_month: u32,
        ensemble_member: u32,
        domain: &str,
        name: &str,
        archive_template: &str,
    ) -> Self {
        RunIdentity {
            init_year,
            init_month,
            ensemble_member,
            domain: domain.to_string(),
            name: name.to_string(),
            archive_template: archive_template.to_string(),
        }
    }

    /// All runs for the cartesian product of years, months and members
    /// `1..=ensemble_size`, ordered by year, then month, then member.
    pub fn grid(
        years: std::ops::RangeInclusive<i32>,
        months: &[u32],
        ensemble_size: u32,
        domain: &str,
        name: &str,
        archive_template: &str,
    ) -> Vec<RunIdentity> {
        let mut runs = Vec::new();
        for year in years {
            for &month in months {
                for member in 1..=ensemble_size {
                    runs.push(RunIdentity::new(year, month, member, domain, name, archive_template));
                }
            }
        }
        runs
    }

    pub fn archive_dir(&self) -> Result<PathBuf, TemplateError> {
        archive_dir(&self.archive_template, self.init_year, self.init_month, self.ensemble_member)
    }

    /// Full path of the archived container.
    pub fn container_path(&self) -> Result<PathBuf, TemplateError> {
        Ok(self.archive_dir()?.join(self.container_name()))
    }

    pub fn container_name(&self) -> String {
        container_name(self.init_year, self.init_month)
    }

    pub fn member_file_name(&self) -> String {
        member_file_name(self.init_year, self.init_month, &self.domain)
    }

    pub fn intermediate_dir(&self, root: &Path) -> Result<PathBuf, TemplateError> {
        Ok(intermediate_dir(root, &self.archive_dir()?, self.init_year, self.init_month))
    }

    pub fn local_dir(&self, root: &Path) -> PathBuf {
        local_dir(root, &self.name, self.ensemble_member)
    }

    pub fn extracted_file_name(&self) -> String {
        extracted_file_name(self.init_year, self.init_month, self.ensemble_member, &self.domain)
    }
}

impl std::fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{:02} e{:02} ({})",
            self.init_year, self.init_month, self.ensemble_member, self.domain
        )
    }
}
