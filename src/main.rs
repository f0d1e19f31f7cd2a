use anyhow::Context;
use clap::Parser;
use phxload::config::Config;
use phxload::metrics::MetricsCollector;
use phxload::report::RunReport;
use phxload::scheduler::BatchScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[cfg(feature = "fast-allocator")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "phxload")]
#[command(about = "Synthetic load generator for Phoenix-style realtime channels", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Target WebSocket URL (overrides config)
    #[arg(long)]
    url: Option<String>,

    /// Number of waves (overrides config)
    #[arg(long)]
    waves: Option<u32>,

    /// Clients started per wave (overrides config)
    #[arg(long)]
    clients_per_wave: Option<u32>,

    /// Generate example configuration file
    #[arg(long, value_name = "FILE")]
    generate_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the config's
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Handle config generation
    if let Some(config_path) = args.generate_config {
        println!("Generating example configuration file: {:?}", config_path);
        Config::create_example(&config_path)?;
        println!("Example configuration file created successfully!");
        println!("Edit the file and run: phxload --config {:?}", config_path);
        return Ok(());
    }

    // Load configuration
    let mut config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)
            .with_context(|| format!("loading configuration from {:?}", config_path))?
    } else {
        Config::default()
    };

    // Apply CLI overrides, then re-validate
    if let Some(url) = args.url {
        config.target.url = url;
    }
    if let Some(waves) = args.waves {
        config.load.waves = waves;
    }
    if let Some(clients) = args.clients_per_wave {
        config.load.clients_per_wave = clients;
    }
    config.validate().context("invalid configuration")?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format)?;

    let run_id = Uuid::new_v4();
    info!(%run_id, "phxload v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        url = %config.target.url,
        waves = config.load.waves,
        clients_per_wave = config.load.clients_per_wave,
        "run configuration"
    );

    let config = Arc::new(config);
    let metrics = Arc::new(MetricsCollector::new());
    let scheduler = BatchScheduler::new(config.clone(), metrics.clone());

    // Ctrl+C force-stops every wave; the run still ends with a report
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, stopping all waves...");
            signal_token.cancel();
        }
    });

    let started = Instant::now();
    if let Err(e) = scheduler.run(cancel).await {
        error!("Scheduler error: {}", e);
        return Err(e.into());
    }

    let report = RunReport::evaluate(&metrics, &config.thresholds, run_id, started.elapsed());
    println!("{}", report.render());

    if !report.passed() {
        error!("One or more thresholds failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level '{}'", level))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    Ok(())
}
