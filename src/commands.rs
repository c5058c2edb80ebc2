//! Execution of the command-line subcommands.

use crate::batch::{BatchOptions, product_path, run_batch};
use crate::cache::TieredCache;
use crate::cleanup::{CleanupTargets, cleanup};
use crate::cli::{Cli, Commands, VarSelection};
use crate::combine::{
    CombineRequest, NewForecastRequest, combine, combine_new, discover_inputs, forecast_file_name,
    write_products,
};
use crate::dataset::{Dataset, Encoding};
use crate::input::{PipelineConfig, VariableSpec, expand_variables};
use crate::log::{config_echo, show_batch_report, show_greeting, show_status_table};
use crate::logreg::{
    EXCEEDED, PREDICTOR, QUANTILE_VALUE, coefficients_file_name, fit_dataset, observed_quantiles,
    quantiles_file_name, regression_inputs,
};
use crate::region::{RegionMask, region_average_extracted, region_average_file, region_mean_name};
use crate::status::check_runs;
use anyhow::{Context, Result, bail};
use clap::CommandFactory;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

/// Loads and validates the configuration at `path`.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let Some(path) = path else {
        bail!("no configuration file given: pass --config or set NCFORECAST_CONFIG");
    };
    let config = PipelineConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

/// Observed quantiles computed by an earlier run, when they exist at `path`
/// with the same levels.
fn cached_quantiles(path: &Path, levels: &[f64]) -> Option<Dataset> {
    if !path.exists() {
        return None;
    }
    match Dataset::open(path) {
        Ok(ds) if ds.coord_values("quantile").as_deref() == Some(levels) => {
            debug!("Reusing quantiles in {}", path.display());
            Some(ds)
        }
        Ok(_) => {
            info!("Levels changed, recomputing {}", path.display());
            None
        }
        Err(e) => {
            warn!("Ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

/// Physical variable names for a selection. Named vector pairs expand into
/// their components; other names are taken as given.
pub fn select_variables(config: &PipelineConfig, domain: &str, selection: &VarSelection) -> Result<Vec<String>> {
    match selection {
        VarSelection::All => Ok(config.physical_variables(domain)?),
        VarSelection::Names(names) => {
            let configured = config.domain_variables(domain).unwrap_or_default();
            let specs: Vec<VariableSpec> = names
                .iter()
                .map(|name| {
                    configured
                        .iter()
                        .find(|spec| spec.name() == name)
                        .cloned()
                        .unwrap_or_else(|| VariableSpec::Scalar(name.clone()))
                })
                .collect();
            Ok(expand_variables(&specs))
        }
    }
}

/// Runs the parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone();
    let quiet = cli.quiet;
    let verbose = cli.verbose;

    let load = |path: Option<&Path>| -> Result<PipelineConfig> {
        if !quiet {
            if let Some(p) = path {
                show_greeting(&p.display().to_string());
            }
        }
        let config = load_config(path)?;
        if verbose {
            config_echo(&config);
        }
        Ok(config)
    };

    match cli.command {
        Commands::Extract {
            domain,
            year,
            month,
            new,
            var,
            rerun,
            clean,
            dry_run,
            workers,
        } => {
            let config = load(config_path.as_deref())?;
            let runs = match (new, year, month) {
                (true, Some(y), Some(m)) => config.new_forecast_runs(&domain, y, m),
                _ => config.retrospective_runs(&domain, year, month),
            };
            let variables = select_variables(&config, &domain, &var)?;
            let outdir = config.extracted_dir(&domain);
            let cache = TieredCache::new(config.cache_config(), config.shell_tools());

            if dry_run {
                for run in &runs {
                    let source = if product_path(&outdir, run).is_file() {
                        "already extracted".to_string()
                    } else {
                        match cache.locate(run).await? {
                            Some(tier) => tier.to_string(),
                            None => "missing".to_string(),
                        }
                    };
                    println!("{}: {}", run, source);
                }
                return Ok(());
            }

            let options = BatchOptions {
                variables,
                max_workers: workers,
                rerun,
                clean,
                progress: !quiet,
            };
            let report = run_batch(&cache, &runs, &options, &outdir)
                .await
                .context("Batch extraction failed")?;
            if !quiet {
                show_batch_report(&report);
            }
            if !report.is_success() {
                bail!("{} of {} run(s) failed", report.failed.len(), report.total());
            }
        }

        Commands::Combine { domain, var, mean } => {
            let config = load(config_path.as_deref())?;
            let retro = &config.retrospective_forecasts;
            let inputs = discover_inputs(
                &config.extracted_dir(&domain),
                &domain,
                retro.first_year..=retro.last_year,
                &retro.months,
                retro.ensemble_size,
            );
            info!("Found {} extracted file(s)", inputs.len());
            let outdir = &config.filesystem.forecast_output_data;
            std::fs::create_dir_all(outdir)
                .with_context(|| format!("Failed to create {}", outdir.display()))?;
            for name in select_variables(&config, &domain, &var)? {
                let request = CombineRequest {
                    var: name.clone(),
                    domain: domain.clone(),
                    first_year: config.climatology.first_year,
                    last_year: config.climatology.last_year,
                    mean_mode: mean,
                };
                let combined = combine(&request, &inputs).with_context(|| format!("Failed to combine {}", name))?;
                let (clim, forecast) = write_products(&request, &combined, outdir)
                    .with_context(|| format!("Failed to write products for {}", name))?;
                debug!("Wrote {} and {}", clim.display(), forecast.display());
            }
        }

        Commands::CombineNew {
            domain,
            year,
            month,
            var,
            output,
        } => {
            let config = load(config_path.as_deref())?;
            let request = NewForecastRequest {
                year,
                month,
                domain: domain.clone(),
                variables: select_variables(&config, &domain, &var)?,
                extracted_dir: config.extracted_dir(&domain),
                climatology_dir: config.filesystem.forecast_output_data.clone(),
                climatology_first_year: config.climatology.first_year,
                climatology_last_year: config.climatology.last_year,
                combined_name: config.combined_name().to_string(),
                output_dir: output.unwrap_or_else(|| config.individual_dir()),
            };
            let written = combine_new(&request)
                .with_context(|| format!("Failed to combine new forecast {}-{:02}", year, month))?;
            for path in written {
                info!("Wrote {}", path.display());
            }
        }

        Commands::RegionAverage {
            domain,
            var,
            mean,
            extracted,
            rerun,
        } => {
            let config = load(config_path.as_deref())?;
            let Some(regions) = config.regions.clone() else {
                bail!("configuration has no 'regions' section");
            };
            let mask = RegionMask::open(&regions.mask_file)
                .with_context(|| format!("Failed to open mask file {}", regions.mask_file.display()))?;
            if extracted {
                let written = region_average_extracted(
                    &config.extracted_dir(&domain),
                    &config.extracted_region_dir(&domain),
                    &domain,
                    config.retrospective_forecasts.ensemble_size,
                    &mask,
                    &regions.names,
                    rerun,
                )
                .context("Failed to region-average extracted files")?;
                info!("Wrote {} region-average file(s)", written.len());
            } else {
                let root = &config.filesystem.forecast_output_data;
                for name in select_variables(&config, &domain, &var)? {
                    let input = root.join(forecast_file_name(&domain, &name, mean));
                    let output = root.join(region_mean_name(&input));
                    region_average_file(&input, &output, &mask, &regions.names, false, rerun)
                        .with_context(|| format!("Failed to region-average {}", input.display()))?;
                }
            }
        }

        Commands::Logreg {
            domain,
            var,
            observations,
            obs_var,
            quantiles,
            first_year,
            last_year,
            output,
        } => {
            let config = load(config_path.as_deref())?;
            let obs_var = obs_var.unwrap_or_else(|| var.clone());
            let postprocessed = config.postprocessed_dir();
            std::fs::create_dir_all(&postprocessed)
                .with_context(|| format!("Failed to create {}", postprocessed.display()))?;

            let forecast_path = config
                .filesystem
                .forecast_output_data
                .join(forecast_file_name(&domain, &var, false));
            let forecast = Dataset::open(&forecast_path)
                .with_context(|| format!("Failed to open {}", forecast_path.display()))?;
            let obs = Dataset::open(&observations)
                .with_context(|| format!("Failed to open {}", observations.display()))?;

            let quantile_path = postprocessed.join(quantiles_file_name(&var));
            let thresholds = match cached_quantiles(&quantile_path, &quantiles) {
                Some(ds) => ds,
                None => {
                    let ds = observed_quantiles(&obs, &obs_var, &quantiles).with_context(|| {
                        format!("Failed to compute quantiles from {}", observations.display())
                    })?;
                    ds.write(&quantile_path, &Encoding::new().int32("month"))
                        .with_context(|| format!("Failed to write {}", quantile_path.display()))?;
                    info!("Wrote {}", quantile_path.display());
                    ds
                }
            };

            let years = first_year.zip(last_year);
            let inputs = regression_inputs(&forecast, &var, &obs, &obs_var, &thresholds, years)
                .with_context(|| format!("Failed to match {} with observations", var))?;
            let coefs = fit_dataset(&inputs, PREDICTOR, QUANTILE_VALUE, EXCEEDED)
                .with_context(|| format!("Failed to fit coefficients for {}", var))?;
            let output = output.unwrap_or_else(|| postprocessed.join(coefficients_file_name(&var)));
            if let Some(parent) = output.parent() {
                std::fs::create_dir_all(parent)?;
            }
            coefs
                .write(&output, &Encoding::new().int32("month").int32("lead"))
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Wrote {}", output.display());
        }

        Commands::Cleanup { domain, dry_run } => {
            let config = load(config_path.as_deref())?;
            let targets = CleanupTargets {
                domain: domain.clone(),
                extracted_dir: config.extracted_dir(&domain),
                local_dirs: config.local_member_dirs(),
            };
            let affected = cleanup(&targets, dry_run).context("Cleanup failed")?;
            if !quiet {
                let verb = if dry_run { "Would remove" } else { "Removed" };
                println!("{} {} file(s)", verb, affected.len());
            }
        }

        Commands::Status { domain, year, month } => {
            let config = load(config_path.as_deref())?;
            let runs = config.retrospective_runs(&domain, year, month);
            let statuses = check_runs(&runs).context("Failed to derive archive paths")?;
            show_status_table(&statuses);
        }

        Commands::Validate { config_file, detailed } => {
            let path: Option<PathBuf> = config_file.or(config_path);
            let config = load_config(path.as_deref())?;
            println!("Configuration is valid");
            if detailed {
                config_echo(&config);
            }
        }

        Commands::Completions { shell, output } => {
            let mut command = Cli::command();
            let bin_name = command.get_name().to_string();
            match output {
                Some(path) => {
                    let mut file = std::fs::File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    clap_complete::generate(shell, &mut command, bin_name, &mut file);
                }
                None => clap_complete::generate(shell, &mut command, bin_name, &mut std::io::stdout()),
            }
        }
    }
    Ok(())
}
