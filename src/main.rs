use clap::Parser;
use ncforecast::cli::{Cli, Commands};
use ncforecast::commands;
use ncforecast::log::show_farewell_with_timing;
use std::process;
use std::time::Instant;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_filter())).init();

    let start_time = Instant::now();
    let timed = !cli.quiet && !matches!(cli.command, Commands::Completions { .. });

    if let Err(e) = commands::run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }

    if timed {
        show_farewell_with_timing(start_time.elapsed());
    }
}
