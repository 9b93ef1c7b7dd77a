//! ONTAP Driver Core
//!
//! Loads a backend definition, initializes the backend against a simulated
//! appliance and reports the pools it would publish. With `--nodes`, also
//! reconciles host access for the given node list.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ontap_driver_core::{Backend, DriverConfig, NodeInfo, SimulatedAppliance};

// =============================================================================
// CLI Arguments
// =============================================================================

/// ONTAP Driver Core - storage backend control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend definition (YAML, or JSON with a .json extension)
    #[arg(long, env = "DRIVER_CONFIG")]
    config: PathBuf,

    /// Aggregates of the simulated SVM as name:type (type hdd, hybrid or ssd)
    #[arg(long = "aggregate", env = "SIM_AGGREGATES", value_delimiter = ',', default_value = "aggr1:ssd")]
    aggregates: Vec<String>,

    /// Node list (YAML or JSON) to reconcile host access for
    #[arg(long, env = "NODES_FILE")]
    nodes: Option<PathBuf>,

    /// Print backend metrics in Prometheus text format
    #[arg(long, env = "PRINT_METRICS")]
    metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting ONTAP driver core");
    info!("  Version: {}", ontap_driver_core::VERSION);
    info!("  Config: {}", args.config.display());

    let config = DriverConfig::from_file(&args.config)
        .with_context(|| format!("loading backend config {}", args.config.display()))?;

    let appliance = Arc::new(SimulatedAppliance::new());
    for spec in &args.aggregates {
        let (name, aggregate_type) = spec.split_once(':').unwrap_or((spec.as_str(), "hdd"));
        appliance.add_aggregate(name, aggregate_type, 1 << 40, 0);
    }

    let backend = Backend::initialize(config, appliance)
        .await
        .context("initializing backend")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&backend.published_pools()).context("encoding pools")?
    );

    if let Some(path) = &args.nodes {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading node list {}", path.display()))?;
        let nodes: Vec<NodeInfo> = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&raw).context("parsing node list")?
        } else {
            serde_yaml::from_str(&raw).context("parsing node list")?
        };

        let report = backend
            .reconcile_node_access(&nodes)
            .await
            .context("reconciling node access")?;
        info!(
            backend = %backend.name(),
            added = report.added,
            removed = report.removed,
            "Node access reconciled"
        );
    }

    if args.metrics {
        print!("{}", backend.metrics().encode_text()?);
    }

    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so stdout stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
