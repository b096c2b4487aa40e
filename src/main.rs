//! SyncMQ - MQTT topic synchronization bridge
//!
//! Usage:
//!   syncmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use syncmq::broker::MqttClient;
use syncmq::config::Config;
use syncmq::peer::{Acceptor, Initiator};
use syncmq::shutdown::ShutdownCoordinator;
use syncmq::sync::SyncOrchestrator;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// SyncMQ - MQTT topic synchronization bridge
#[derive(Parser, Debug)]
#[command(name = "syncmq")]
#[command(version = "0.1.0")]
#[command(about = "MQTT topic synchronization bridge over a TLS-capable peer stream")]
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

    // Load configuration file if specified, otherwise env vars + defaults
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            }
        },
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting SyncMQ bridge");
    info!("  MQTT broker: {}", config.mqtt.address());
    if config.acceptor.enabled {
        info!(
            "  Acceptor: {} (tls={})",
            config.acceptor.address(),
            config.acceptor.tls.is_some()
        );
    } else {
        info!("  Acceptor: disabled");
    }
    if config.initiator.enabled {
        info!(
            "  Initiator: {} (tls={})",
            config.initiator.address(),
            config.initiator.tls.is_some()
        );
    } else {
        info!("  Initiator: disabled");
    }
    info!("  Topics: {}", config.sync.topics.join(", "));
    info!("  Forward mode: {:?}", config.sync.forward);

    let shutdown = ShutdownCoordinator::new();

    let broker = match MqttClient::new(config.mqtt.clone(), shutdown.clone()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error creating MQTT client: {}", e);
            std::process::exit(1);
        }
    };

    let orchestrator = SyncOrchestrator::new(&config.sync, Arc::clone(&broker));

    // Acceptor first: it wins under acceptor-priority forwarding
    if config.acceptor.enabled {
        let acceptor = match Acceptor::new(
            config.acceptor.clone(),
            orchestrator.peer_callback(),
            shutdown.clone(),
        )
        .await
        {
            Ok(acceptor) => acceptor,
            Err(e) => {
                eprintln!("Error starting acceptor: {}", e);
                std::process::exit(1);
            }
        };
        acceptor.start();
        orchestrator.attach_link(acceptor);
    }

    if config.initiator.enabled {
        let initiator = match Initiator::new(
            config.initiator.clone(),
            orchestrator.peer_callback(),
            shutdown.clone(),
        ) {
            Ok(initiator) => initiator,
            Err(e) => {
                eprintln!("Error starting initiator: {}", e);
                std::process::exit(1);
            }
        };
        // A failed first dial schedules the reconnect loop
        let _ = initiator.start().await;
        orchestrator.attach_link(initiator);
    }

    broker.set_connect_handler(orchestrator.connect_callback());
    broker.connect().await;

    wait_for_signal().await?;

    info!("Shutting down");
    shutdown.trigger();
    shutdown.wait_idle().await;
    info!("SyncMQ stopped");

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
        _ = quit.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
