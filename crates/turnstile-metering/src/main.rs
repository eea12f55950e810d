use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use turnstile_metering::config::MeteringConfig;
use turnstile_metering::server::MeteringServer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "turnstile-metering")]
#[command(about = "Turnstile Metering Service - Usage ingestion and billing aggregation")]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Generate sample configuration file")]
    gen_config: bool,

    #[arg(long, help = "Dry run mode (validate config without starting)")]
    dry_run: bool,

    #[clap(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.gen_config {
        let config = MeteringConfig::default();
        let toml = toml::to_string_pretty(&config)?;
        println!("{}", toml);
        return Ok(());
    }

    let config = MeteringConfig::load(args.config)?;

    turnstile_common::logging::init_logging(
        &args.verbosity,
        env!("CARGO_BIN_NAME"),
        &config.service.log_level,
    )?;

    info!("Starting Turnstile Metering Service");
    info!("Environment: {}", config.service.environment);
    info!("Service ID: {}", config.service.service_id);
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }

    let server = MeteringServer::new(config.clone());

    if args.dry_run {
        info!("Configuration validated successfully (dry-run mode)");
        return Ok(());
    }

    info!("Preparing store schema");
    server.run_schema_setup().await?;
    info!("Store schema ready");

    info!(
        "Consuming {} with {} consumer(s)",
        config.log.topic, config.log.consumers
    );

    if let Err(e) = server.serve(shutdown_signal()).await {
        error!("Server error: {}", e);
        return Err(e);
    }

    info!("Turnstile Metering Service stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
