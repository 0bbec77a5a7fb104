//! DriftMQ daemon
//!
//! Usage:
//!   driftmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help
//!
//! Loads configuration, restores persisted state and runs the expiry
//! sweeper until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use driftmq::broker::{Broker, BrokerConfig};
use driftmq::config::Config;
use driftmq::hooks::DefaultHooks;
use driftmq::persistence::{FjallBackend, PersistenceManager};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// DriftMQ - MQTT v5 session and delivery engine
#[derive(Parser, Debug)]
#[command(name = "driftmq")]
#[command(version)]
#[command(about = "MQTT v5 session and message-delivery engine")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config; RUST_LOG-style directives are accepted in either
    let level = args
        .log_level
        .map(LogLevel::as_directive)
        .unwrap_or(config.log.level.as_str());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    if let Some(path) = &args.config {
        info!(path = %path.display(), "loaded configuration");
    }

    let broker_config = BrokerConfig::from(&config);
    info!(
        max_qos = broker_config.max_qos as u8,
        receive_maximum = broker_config.receive_maximum,
        topic_alias_maximum = broker_config.topic_alias_maximum,
        max_queued_messages = broker_config.max_queued_messages,
        "starting DriftMQ"
    );

    let hooks = Arc::new(DefaultHooks);
    let persistence = if config.persistence.enabled {
        let backend = Arc::new(FjallBackend::open(&config.persistence.path)?);
        info!(path = %config.persistence.path.display(), "persistence enabled");
        Some(Arc::new(PersistenceManager::new(
            backend,
            config.persistence.flush_interval,
            config.persistence.max_batch_size,
        )))
    } else {
        info!("persistence disabled");
        None
    };

    let broker = match &persistence {
        Some(manager) => Broker::with_persistence(broker_config, hooks, manager.clone()),
        None => Broker::with_hooks(broker_config, hooks),
    };

    if let Err(e) = broker.restore().await {
        error!(error = %e, "failed to restore persisted state, starting empty");
    }

    broker
        .run_maintenance(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
        })
        .await;

    info!("shutting down");
    if let Some(manager) = persistence {
        manager.shutdown().await?;
    }
    Ok(())
}
