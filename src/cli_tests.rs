//! # CLI Integration Tests
//!
//! Argument parsing for every subcommand, and a full pipeline driven
//! through the command layer against a scratch archive.

#[cfg(test)]
mod tests {
    use clap::Parser;
    use std::path::PathBuf;

    use crate::cli::{Cli, Commands, VarSelection};

    /// Test basic CLI argument parsing
    #[test]
    fn test_cli_help() {
        let result = Cli::try_parse_from(["ncforecast", "--help"]);
        assert!(result.is_err()); // --help causes early exit with "error"

        let error = result.unwrap_err();
        assert!(error.to_string().contains("ocean forecast"));
    }

    /// Test version argument
    #[test]
    fn test_cli_version() {
        let result = Cli::try_parse_from(["ncforecast", "--version"]);
        assert!(result.is_err()); // --version causes early exit
    }

    /// Test global flags
    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["ncforecast", "--verbose", "--config", "/path/to/config.yaml", "status"]);
        assert!(cli.verbose);
        assert!(!cli.quiet);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yaml")));

        // Global flags are accepted after the subcommand too
        let cli = Cli::parse_from(["ncforecast", "cleanup", "-q", "-c", "c.yaml"]);
        assert!(cli.quiet);
        assert_eq!(cli.config, Some(PathBuf::from("c.yaml")));
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["ncforecast", "-q", "-v", "status"]).is_err());
    }

    #[test]
    fn test_extract_defaults() {
        let cli = Cli::parse_from(["ncforecast", "extract"]);
        if let Commands::Extract {
            domain,
            year,
            month,
            new,
            var,
            rerun,
            clean,
            dry_run,
            workers,
        } = cli.command
        {
            assert_eq!(domain, "ocean_month");
            assert_eq!(year, None);
            assert_eq!(month, None);
            assert!(!new && !rerun && !clean && !dry_run);
            assert_eq!(var, VarSelection::All);
            assert_eq!(workers, 4);
        } else {
            panic!("Expected Extract command");
        }
    }

    #[test]
    fn test_extract_new_forecast() {
        let cli = Cli::parse_from([
            "ncforecast", "extract", "-d", "ocean_daily", "--new", "-y", "2024", "-m", "3", "--clean", "--workers", "8",
        ]);
        if let Commands::Extract {
            domain,
            year,
            month,
            new,
            clean,
            workers,
            ..
        } = cli.command
        {
            assert_eq!(domain, "ocean_daily");
            assert_eq!((year, month), (Some(2024), Some(3)));
            assert!(new && clean);
            assert_eq!(workers, 8);
        } else {
            panic!("Expected Extract command");
        }

        // A new forecast needs both year and month
        assert!(Cli::try_parse_from(["ncforecast", "extract", "--new", "-y", "2024"]).is_err());
        assert!(Cli::try_parse_from(["ncforecast", "extract", "-m", "13"]).is_err());
    }

    #[test]
    fn test_combine_command() {
        let cli = Cli::parse_from(["ncforecast", "combine", "--var", "tos,sos", "--mean"]);
        if let Commands::Combine { domain, var, mean } = cli.command {
            assert_eq!(domain, "ocean_month");
            assert_eq!(var, VarSelection::Names(vec!["tos".into(), "sos".into()]));
            assert!(mean);
        } else {
            panic!("Expected Combine command");
        }
    }

    #[test]
    fn test_combine_new_requires_date() {
        assert!(Cli::try_parse_from(["ncforecast", "combine-new", "-y", "2024"]).is_err());
        let cli = Cli::parse_from(["ncforecast", "combine-new", "-y", "2024", "-m", "12", "-o", "/tmp/out"]);
        if let Commands::CombineNew { year, month, output, .. } = cli.command {
            assert_eq!((year, month), (2024, 12));
            assert_eq!(output, Some(PathBuf::from("/tmp/out")));
        } else {
            panic!("Expected CombineNew command");
        }
    }

    #[test]
    fn test_region_average_flags() {
        assert!(Cli::try_parse_from(["ncforecast", "region-average", "--mean", "--extracted"]).is_err());
        let cli = Cli::parse_from(["ncforecast", "region-average", "--extracted", "-r"]);
        if let Commands::RegionAverage { extracted, rerun, mean, .. } = cli.command {
            assert!(extracted && rerun && !mean);
        } else {
            panic!("Expected RegionAverage command");
        }
    }

    #[test]
    fn test_logreg_defaults() {
        let cli = Cli::parse_from([
            "ncforecast",
            "logreg",
            "--var",
            "tos",
            "--observations",
            "glorys_tos.nc",
        ]);
        if let Commands::Logreg {
            domain,
            var,
            observations,
            obs_var,
            quantiles,
            first_year,
            output,
            ..
        } = cli.command
        {
            assert_eq!((domain.as_str(), var.as_str()), ("ocean_month", "tos"));
            assert_eq!(observations, PathBuf::from("glorys_tos.nc"));
            assert_eq!(obs_var, None);
            assert_eq!(quantiles, vec![0.1, 0.33, 0.5, 0.67, 0.9]);
            assert_eq!((first_year, output), (None, None));
        } else {
            panic!("Expected Logreg command");
        }
    }

    #[test]
    fn test_logreg_year_window_needs_both_ends() {
        let args = ["ncforecast", "logreg", "--var", "tos", "--observations", "o.nc"];
        let partial = Cli::try_parse_from(args.iter().chain(&["--first-year", "1994"]));
        assert!(partial.is_err());

        let full = args.iter().chain(&["--first-year", "1994", "--last-year", "2022"]);
        let full = full.chain(&["--quantiles", "0.25,0.75", "--obs-var", "thetao"]);
        if let Commands::Logreg {
            quantiles,
            obs_var,
            first_year,
            last_year,
            ..
        } = Cli::parse_from(full).command
        {
            assert_eq!(quantiles, vec![0.25, 0.75]);
            assert_eq!(obs_var.as_deref(), Some("thetao"));
            assert_eq!((first_year, last_year), (Some(1994), Some(2022)));
        } else {
            panic!("Expected Logreg command");
        }
    }

    #[test]
    fn test_completions_command() {
        let cli = Cli::parse_from(["ncforecast", "completions", "zsh", "-o", "_ncforecast"]);
        if let Commands::Completions { shell, output } = cli.command {
            assert_eq!(shell, clap_complete::Shell::Zsh);
            assert_eq!(output, Some(PathBuf::from("_ncforecast")));
        } else {
            panic!("Expected Completions command");
        }
        assert!(Cli::try_parse_from(["ncforecast", "completions", "tcsh"]).is_err());
    }

    #[test]
    fn test_validate_command() {
        let cli = Cli::parse_from(["ncforecast", "validate", "config.yaml", "--detailed"]);
        if let Commands::Validate { config_file, detailed } = cli.command {
            assert_eq!(config_file, Some(PathBuf::from("config.yaml")));
            assert!(detailed);
        } else {
            panic!("Expected Validate command");
        }
    }
}

#[cfg(test)]
mod pipeline_tests {
    use crate::cli::{Cli, VarSelection};
    use crate::commands::{load_config, run, select_variables};
    use crate::dataset::{Dataset, Encoding, Variable};
    use crate::run::RunIdentity;
    use crate::test_support::tar_container;
    use clap::Parser;
    use ndarray::array;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Workspace {
        dir: TempDir,
    }

    impl Workspace {
        /// Writes a configuration, a region mask and a two-member Jan/Feb
        /// 2020 archive.
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let root = dir.path();
            let config = format!(
                r#"
name: test_exp
filesystem:
  forecast_history: "{root}/archive/e{{ensemble:02d}}/{{year}}"
  forecast_output_data: {root}/out
  intermediate_cache: {root}/ptmp
  local_cache: {root}/vftmp
retrospective_forecasts:
  first_year: 2020
  last_year: 2020
  months: [1, 2]
  ensemble_size: 2
new_forecasts:
  ensemble_size: 2
climatology:
  first_year: 2020
  last_year: 2020
variables:
  ocean_month:
    - tos
    - name: ts
      u: tos
      v: sos
regions:
  mask_file: {root}/mask.nc
  names: [all]
tools:
  stage_command: "true"
  copy_command: cp
  tar_command: tar
"#,
                root = root.display()
            );
            std::fs::write(root.join("config.yaml"), config).unwrap();

            let mut mask = Dataset::new();
            let ones = array![[1.0, 1.0], [1.0, 1.0]].into_dyn();
            mask.add_data_var("areacello", Variable::new(&["yh", "xh"], ones.clone())).unwrap();
            mask.add_data_var("all", Variable::new(&["yh", "xh"], ones)).unwrap();
            mask.write(root.join("mask.nc"), &Encoding::new()).unwrap();

            let template = format!("{}/archive/e{{ensemble:02d}}/{{year}}", root.display());
            for run in RunIdentity::grid(2020..=2020, &[1, 2], 2, "ocean_month", "test_exp", &template) {
                tar_container(&run, run.ensemble_member as f64, &root.join("scratch")).unwrap();
            }
            Workspace { dir }
        }

        fn config_path(&self) -> PathBuf {
            self.dir.path().join("config.yaml")
        }

        fn out(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        async fn run(&self, args: &[&str]) -> anyhow::Result<()> {
            let config = self.config_path();
            let mut argv = vec!["ncforecast", "-q", "-c", config.to_str().unwrap()];
            argv.extend_from_slice(args);
            run(Cli::parse_from(argv)).await
        }
    }

    fn count_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_select_variables_expands_pairs() -> Result<(), Box<dyn std::error::Error>> {
        let ws = Workspace::new();
        let config = load_config(Some(&ws.config_path()))?;
        assert_eq!(select_variables(&config, "ocean_month", &VarSelection::All)?, vec!["tos", "sos"]);
        let named = VarSelection::Names(vec!["ts".into(), "zos".into()]);
        assert_eq!(select_variables(&config, "ocean_month", &named)?, vec!["tos", "sos", "zos"]);
        assert!(select_variables(&config, "ice_month", &VarSelection::All).is_err());
        Ok(())
    }

    #[test]
    fn test_missing_config_is_reported() {
        let err = load_config(None).unwrap_err();
        assert!(err.to_string().contains("no configuration file"));
    }

    #[tokio::test]
    async fn test_full_pipeline_through_commands() -> Result<(), Box<dyn std::error::Error>> {
        let ws = Workspace::new();
        let out = ws.out();
        let extracted = out.join("extracted").join("ocean_month");

        ws.run(&["validate"]).await?;
        ws.run(&["status"]).await?;

        ws.run(&["extract", "--dry-run"]).await?;
        assert_eq!(count_files(&extracted), 0);

        ws.run(&["extract", "--var", "tos"]).await?;
        assert_eq!(count_files(&extracted), 4);
        assert!(extracted.join("2020-02-e02.ocean_month.nc").is_file());

        ws.run(&["combine", "--var", "tos"]).await?;
        assert!(out.join("climatology_ocean_month_tos_2020_2020.nc").is_file());
        let forecast = Dataset::open(out.join("forecasts_ocean_month_tos.nc"))?;
        assert_eq!(forecast.coord_values("member"), Some(vec![1.0, 2.0]));

        ws.run(&["region-average", "--var", "tos"]).await?;
        let averaged = Dataset::open(out.join("forecasts_ocean_month_tos_regionmean.nc"))?;
        assert_eq!(averaged.labels("region"), Some(&vec!["all".to_string()]));

        ws.run(&["region-average", "--extracted"]).await?;
        assert_eq!(count_files(&out.join("extracted_region_average").join("ocean_month")), 4);

        ws.run(&["combine-new", "-y", "2020", "-m", "1", "--var", "tos"]).await?;
        let combined = Dataset::open(out.join("individual").join("forecast_monthly_tos_2020-01.nc"))?;
        assert!(combined.data_var("valid_time").is_some());
        let anom = combined.require("tos_anom")?;
        assert!(anom.data.iter().all(|v| (v.abs() - 0.5).abs() < 1e-12));

        let completions = ws.dir.path().join("_ncforecast");
        ws.run(&["completions", "bash", "-o", completions.to_str().unwrap()]).await?;
        assert!(std::fs::metadata(&completions)?.len() > 0);

        ws.run(&["cleanup", "--dry-run"]).await?;
        assert_eq!(count_files(&extracted), 4);
        ws.run(&["cleanup"]).await?;
        assert_eq!(count_files(&extracted), 0);
        let local = ws.dir.path().join("vftmp").join("forecast_data").join("test_exp").join("e01");
        assert_eq!(count_files(&local), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_region_average_without_regions_fails() -> Result<(), Box<dyn std::error::Error>> {
        let ws = Workspace::new();
        let text = std::fs::read_to_string(ws.config_path())?;
        let trimmed: String = text
            .split("regions:")
            .next()
            .unwrap_or_default()
            .to_string()
            + "tools:\n  stage_command: \"true\"\n";
        std::fs::write(ws.config_path(), trimmed)?;

        let err = ws.run(&["region-average", "--var", "tos"]).await.unwrap_err();
        assert!(err.to_string().contains("regions"));
        Ok(())
    }
}
