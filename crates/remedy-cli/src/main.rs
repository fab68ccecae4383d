mod cmd;
mod locate;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, schedule::ScheduleSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "remedy",
    about = "Alert-driven remediation: mine alert patterns, replay alerts through rules, preview schedules",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: nearest remedy.yaml, else built-in defaults)
    #[arg(long, global = true, env = "REMEDY_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate or print the effective configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Mine frequent patterns, sequences and correlations from an alert file
    Patterns {
        /// JSON Lines file, one alert per line
        #[arg(long)]
        alerts: PathBuf,
    },

    /// Replay an alert file through a rule file and report what ran
    Replay {
        /// JSON Lines file, one alert per line
        #[arg(long)]
        alerts: PathBuf,

        /// YAML list of automations
        #[arg(long)]
        rules: PathBuf,

        /// Route matches through the priority queue instead of running them directly
        #[arg(long)]
        queued: bool,
    },

    /// Inspect schedule timing
    Schedule {
        #[command(subcommand)]
        subcommand: ScheduleSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Replay { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = locate::resolve_config(cli.config.as_deref());
    let config_path = config_path.as_deref();

    let result = match cli.command {
        Commands::Config { subcommand } => cmd::config::run(config_path, subcommand, cli.json),
        Commands::Patterns { alerts } => cmd::patterns::run(config_path, &alerts, cli.json),
        Commands::Replay {
            alerts,
            rules,
            queued,
        } => cmd::replay::run(config_path, &alerts, &rules, queued, cli.json),
        Commands::Schedule { subcommand } => cmd::schedule::run(subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
