//! deepseis CLI — train and inspect seismic facies segmentation experiments.

mod commands;

use clap::Parser;
use deepseis_core::{ConfigLoader, ExperimentConfig};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// deepseis: patch-based seismic facies segmentation
#[derive(Parser, Debug)]
#[command(name = "deepseis", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Experiment file plus command-line overrides.
#[derive(clap::Args, Debug, Clone)]
struct ConfigArgs {
    /// Experiment YAML file
    #[arg(long)]
    cfg: PathBuf,

    /// Override a config key, e.g. --opt TRAIN.MAX_LR=0.02 (repeatable)
    #[arg(long = "opt", value_name = "KEY=VALUE")]
    opts: Vec<String>,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<ExperimentConfig> {
        ConfigLoader::new(&self.cfg)
            .with_overrides(&self.opts)?
            .load()
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
    }
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a model
    Train {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Inspect experiment configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect datasets
    Dataset {
        #[command(subcommand)]
        action: DatasetAction,
    },
    /// List registered models
    Models,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Load and validate a config
    Check {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Print the fully resolved config as YAML
    Show {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(clap::Subcommand, Debug)]
enum DatasetAction {
    /// Count slices and patches per split
    Inspect {
        #[command(flatten)]
        config: ConfigArgs,

        /// Only this split (train, val, or a name under splits/)
        #[arg(long)]
        split: Option<String>,
    },
}

impl Commands {
    fn config_args(&self) -> Option<&ConfigArgs> {
        match self {
            Commands::Train { config }
            | Commands::Config {
                action: ConfigAction::Check { config } | ConfigAction::Show { config },
            }
            | Commands::Dataset {
                action: DatasetAction::Inspect { config, .. },
            } => Some(config),
            Commands::Models => None,
        }
    }
}

/// Human-readable stderr layer plus a daily-rolling JSON file under `log_dir`.
fn init_tracing(verbose: u8, quiet: bool, log_dir: &Path) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    if std::fs::create_dir_all(log_dir).is_err() {
        tracing_subscriber::registry().with(stderr_layer).init();
        tracing::warn!(dir = %log_dir.display(), "Log directory unavailable, file logging disabled");
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "deepseis.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // The config names the log directory, so it is resolved before logging starts.
    let config = match cli.command.config_args() {
        Some(args) => Some(args.load()?),
        None => None,
    };
    let log_dir = config
        .as_ref()
        .map(|c| c.log_dir.clone())
        .unwrap_or_else(|| PathBuf::from("log"));
    let _guard = init_tracing(cli.verbose, cli.quiet, &log_dir);

    commands::handle_command(cli.command, config).await
}
