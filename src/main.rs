//! `sonic-exporter` binary: CLI parsing, configuration loading and the
//! serve loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sonic_exporter::collector::{open_store, probe_store};
use sonic_exporter::config::ExporterConfig;
use sonic_exporter::logging::init_logging;
use sonic_exporter::server::serve;
use sonic_exporter::{CollectorRegistry, EXPORTER_FULL_NAME, EXPORTER_VERSION};

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "sonic-exporter",
    version,
    about = "Snapshot-cached Prometheus exporter for SONiC switch state",
    long_about = "Reads VLAN, LAG, FDB, LLDP and container state from the SONiC \
                  databases on a schedule and serves the latest consistent \
                  snapshot to Prometheus scrapes."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "sonic-exporter.toml", env = "SONIC_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "SONIC_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve metrics over HTTP (default)
    Run {
        /// Listen address, e.g. 0.0.0.0:9101
        #[arg(long)]
        listen: Option<String>,

        /// Path serving the text exposition
        #[arg(long)]
        metrics_path: Option<String>,

        /// Serve from JSON database dumps instead of redis
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Print the fully resolved configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Refresh every enabled domain once and print the exposition
    Snapshot {
        /// Serve from JSON database dumps instead of redis
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn load_config(path: &Path) -> AnyhowResult<ExporterConfig> {
    if path.exists() {
        ExporterConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        ExporterConfig::from_env().context("Failed to load config from environment")
    }
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = ExporterConfig::load(config_path)
        .with_context(|| format!("Configuration {} is invalid", config_path.display()))?;
    println!("Configuration is valid");

    if verbose {
        println!("{}", "=".repeat(60));
        println!("{}", toml::to_string_pretty(&config).context("Failed to serialize configuration")?);
    }

    println!("  listen address: {}", config.server.listen_address);
    println!("  metrics path:   {}", config.server.metrics_path);
    println!("  store:          {}", config.store.address);
    println!("  domains:        {}", config.enabled_domains().join(", "));
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = ExporterConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!("  target: {} / {}", std::env::consts::ARCH, std::env::consts::OS);
    println!("  domains: vlan, lag, fdb, lldp, docker");
}

async fn handle_snapshot(config: &ExporterConfig) -> AnyhowResult<()> {
    let store = open_store(&config.store).context("Failed to open source store")?;
    probe_store(store.as_ref()).await;
    let registry = CollectorRegistry::from_config(config, store);

    for (domain, result) in registry.refresh_all().await {
        if let Err(e) = result {
            warn!(target: "sonic::engine", domain, error = %e, "Refresh failed");
        }
    }
    print!("{}", registry.render().await.context("Failed to render exposition")?);
    Ok(())
}

async fn handle_run(config: ExporterConfig) -> AnyhowResult<()> {
    let store = open_store(&config.store).context("Failed to open source store")?;
    probe_store(store.as_ref()).await;
    let registry = Arc::new(CollectorRegistry::from_config(&config, store));

    info!(
        target: "sonic::engine",
        domains = ?config.enabled_domains(),
        "Starting {} v{}",
        EXPORTER_FULL_NAME,
        EXPORTER_VERSION
    );
    serve(&config.server, registry).await.context("HTTP server failed")
}

// ----------------------------------------------------------------------------
// Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        _ => {}
    }

    let mut config = load_config(&cli.config)?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config).context("Failed to initialize logging")?;

    match cli.command {
        Some(Commands::Snapshot { fixtures }) => {
            if fixtures.is_some() {
                config.store.fixtures = fixtures;
            }
            handle_snapshot(&config).await
        }
        Some(Commands::Run {
            listen,
            metrics_path,
            fixtures,
        }) => {
            if let Some(listen) = listen {
                config.server.listen_address = listen;
            }
            if let Some(path) = metrics_path {
                config.server.metrics_path = path;
            }
            if fixtures.is_some() {
                config.store.fixtures = fixtures;
            }
            config.validate().context("Invalid command line overrides")?;
            handle_run(config).await
        }
        None => handle_run(config).await,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => Ok(()),
    }
}
