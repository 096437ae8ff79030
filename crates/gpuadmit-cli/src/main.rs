//! gpuadmit CLI
//!
//! Dry-run tool for operators: resolve tolerations, check nodes and simulate
//! placements against a cluster snapshot file.

mod commands;

use clap::{Parser, Subcommand};
use gpuadmit_core::{AdmitConfig, LoggingConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::subscriber::SetGlobalDefaultError;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::ResourceArgs;

/// gpuadmit - GPU-aware taint/toleration admission
#[derive(Parser, Debug)]
#[command(name = "gpuadmit")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the tolerations a task would be given
    Tolerations {
        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// Check whether one node would admit a task
    Check {
        /// Cluster snapshot file (TOML)
        #[arg(long)]
        cluster: PathBuf,

        /// Node to check
        #[arg(long)]
        node: String,

        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// Place one task against a cluster snapshot
    Place {
        /// Cluster snapshot file (TOML)
        #[arg(long)]
        cluster: PathBuf,

        #[command(flatten)]
        resources: ResourceArgs,
    },

    /// Place a batch of tasks against a cluster snapshot
    Simulate {
        /// Cluster snapshot file (TOML)
        #[arg(long)]
        cluster: PathBuf,

        /// Task file (TOML)
        #[arg(long)]
        tasks: PathBuf,

        /// Run all placements concurrently instead of in file order
        #[arg(long)]
        concurrent: bool,
    },
}

fn init_logging(
    logging: &LoggingConfig,
    level_override: Option<&str>,
    verbose: bool,
) -> Result<(), SetGlobalDefaultError> {
    let log_level = if verbose {
        Level::DEBUG
    } else {
        match level_override
            .unwrap_or(logging.level.as_str())
            .to_lowercase()
            .as_str()
        {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let writer = match logging
        .file
        .as_ref()
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
    {
        Some(Ok(file)) => BoxMakeWriter::new(Mutex::new(file)),
        Some(Err(e)) => {
            eprintln!("Failed to open log file, logging to stderr: {}", e);
            BoxMakeWriter::new(std::io::stderr)
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    // RUST_LOG takes precedence when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);

    if logging.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AdmitConfig::from_file(path)?,
        None => AdmitConfig::default(),
    };

    if let Err(e) = init_logging(&config.logging, cli.log_level.as_deref(), cli.verbose) {
        eprintln!("Failed to set up logging: {}", e);
    }

    match cli.command {
        Commands::Tolerations { resources } => {
            commands::tolerations(&config, &resources, cli.json)?;
        }
        Commands::Check {
            cluster,
            node,
            resources,
        } => {
            commands::check(&config, &cluster, &node, &resources, cli.json).await?;
        }
        Commands::Place { cluster, resources } => {
            commands::place(&config, &cluster, &resources, cli.json).await?;
        }
        Commands::Simulate {
            cluster,
            tasks,
            concurrent,
        } => {
            commands::simulate(&config, &cluster, &tasks, concurrent, cli.json).await?;
        }
    }

    Ok(())
}
