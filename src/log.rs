//! Console summaries printed by the command-line front end.

use crate::batch::BatchReport;
use crate::input::PipelineConfig;
use crate::status::ArchiveStatus;
use crate::run::RunIdentity;
use std::time::Duration;

pub fn show_greeting(config_path: &str) {
    println!("=== Ocean Forecast Post-Processing ===");
    println!("Loading configuration from: {}", config_path);
}

pub fn config_echo(config: &PipelineConfig) {
    let retro = &config.retrospective_forecasts;
    println!("\nConfiguration:");
    println!("  Experiment: {}", config.name);
    println!("  Archive template: {}", config.filesystem.forecast_history);
    println!("  Output root: {}", config.filesystem.forecast_output_data.display());
    println!(
        "  Retrospective: {}-{}, months {:?}, {} members",
        retro.first_year, retro.last_year, retro.months, retro.ensemble_size
    );
    println!(
        "  Climatology: {}-{}",
        config.climatology.first_year, config.climatology.last_year
    );
    for (domain, specs) in &config.variables {
        let names: Vec<&str> = specs.iter().map(|s| s.name()).collect();
        println!("    {}: {}", domain, names.join(", "));
    }
    if let Some(regions) = &config.regions {
        println!("  Regions: {}", regions.names.join(", "));
    }
}

pub fn show_batch_report(report: &BatchReport) {
    println!("\nBatch Results:");
    println!("  Extracted: {}", report.extracted.len());
    println!("  Skipped (already extracted): {}", report.skipped_existing.len());
    println!("  Missing from archive: {}", report.missing.len());
    println!("  Unrecallable: {}", report.unrecallable.len());
    println!("  Failed: {}", report.failed.len());
    for run in &report.unrecallable {
        println!("    unrecallable {}", run);
    }
    for (run, reason) in &report.failed {
        println!("    failed {}: {}", run, reason);
    }
}

pub fn show_status_table(statuses: &[(RunIdentity, ArchiveStatus)]) {
    println!("\nArchive Status:");
    for (run, status) in statuses {
        println!("  {}: {}", run, status);
    }
    let found = statuses.iter().filter(|(_, s)| *s == ArchiveStatus::Found).count();
    println!("  {} of {} containers found", found, statuses.len());
}

pub fn show_farewell_with_timing(elapsed: Duration) {
    println!("\n=== Completed in {:.2}s ===", elapsed.as_secs_f64());
}
