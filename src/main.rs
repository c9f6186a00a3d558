//! Main entry point for the ranked ladder service

use anyhow::Result;
use clap::Parser;
use ranked_ladder::config::AppConfig;
use ranked_ladder::service::AppState;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

/// Ranked Ladder - 1v1 matchmaking with Glicko-2 ratings
#[derive(Parser)]
#[command(
    name = "ranked-ladder",
    version,
    about = "A 1v1 ranked ladder service with interval matchmaking and Glicko-2 ratings",
    long_about = "Ranked Ladder queues players per platform, pairs them by overlapping rating \
                 intervals, tracks matches until both sides agree on the score, applies Glicko-2 \
                 updates and decays the certainty of inactive players every rating period. \
                 Commands are consumed from and events published to an AMQP broker."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    #[arg(long, value_name = "PORT", help = "Override health and metrics port")]
    health_port: Option<u16>,

    #[arg(long, value_name = "FILE", help = "Override the ladder data file")]
    data_file: Option<PathBuf>,

    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

fn display_startup_banner(config: &AppConfig) {
    let platforms: Vec<&str> = config.platforms.keys().collect();

    info!("🏆 Ranked Ladder Service");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    info!("   AMQP: {}", config.amqp.url);
    info!(
        "   Queues: commands '{}', events '{}'",
        config.amqp.queue_name, config.amqp.exchange_name
    );
    info!("   Platforms: {}", platforms.join(", "));
    info!(
        "   Matchmaking: every {}s, widen by {} after {} intervals",
        config.matchmaking.interval_seconds,
        config.matchmaking.extend_amount,
        config.matchmaking.extend_intervals
    );
    info!(
        "   Pending matches: {}s lifetime, {}s confirmation window",
        config.pending.lifetime_seconds, config.pending.confirmation_window_seconds
    );
    info!(
        "   Rating period: {}s from {}, phi increase rate {}",
        config.rating_period.length_seconds,
        config.rating_period.start,
        config.rating_period.phi_increase_rate
    );
    info!("   Data file: {}", config.storage.data_file.display());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load configuration and apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(config_path) => AppConfig::from_file(config_path)?,
        None => AppConfig::from_env()?,
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }
    if args.debug {
        config.service.log_level = "debug".to_string();
    }
    if let Some(amqp_url) = &args.amqp_url {
        config.amqp.url = amqp_url.clone();
    }
    if let Some(health_port) = args.health_port {
        config.service.health_port = health_port;
    }
    if let Some(data_file) = &args.data_file {
        config.storage.data_file = data_file.clone();
    }

    ranked_ladder::config::validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    display_startup_banner(&config);

    if args.dry_run {
        info!("Configuration validation successful");
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    info!("Initializing service components...");
    let mut app_state = match AppState::new(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        if let Err(e) = app_state.shutdown().await {
            warn!("Cleanup after failed start also failed: {}", e);
        }
        std::process::exit(1);
    }

    info!("✅ Ranked Ladder Service is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    let stopped = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("🛑 Shutdown signal received, beginning graceful shutdown...");
            Ok(())
        }
        result = app_state.event_loop_stopped() => {
            match &result {
                Ok(()) => warn!("⚠️  Ladder event loop stopped unexpectedly"),
                Err(e) => error!("❌ Ladder event loop hit a fatal error: {:#}", e),
            }
            result
        }
    };

    if let Err(e) = app_state.shutdown().await {
        warn!("Shutdown completed with errors: {}", e);
    }
    info!("🛑 Ranked Ladder Service stopped");

    if stopped.is_err() {
        std::process::exit(1);
    }
    Ok(())
}
