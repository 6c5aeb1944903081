use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use padlink::config::BridgeConfig;
use padlink::event::EventSink;
use padlink::peer::PeerServer;
use padlink::source::GamepadHandle;
use padlink::transport::SessionManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "padlink")]
#[command(about = "Stream gamepad input to a remote consumer", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file, defaults to ~/.config/padlink/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the local gamepad and stream it to the peer
    Send {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Accept senders and log the samples they deliver
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write the default config file if none exists
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(BridgeConfig::default_path);

    match cli.command {
        Commands::Send { host, port } => {
            let config = BridgeConfig::load(&config_path)
                .await?
                .with_peer_override(host, port);
            run_sender(config).await
        }
        Commands::Serve { bind, port } => {
            let config = BridgeConfig::load(&config_path).await?;
            let port = port.unwrap_or(config.peer.port);
            run_peer(config, bind, port).await
        }
        Commands::InitConfig => BridgeConfig::ensure_default_config(&config_path).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

async fn run_sender(config: BridgeConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| eyre!("Invalid configuration: {}", e))?;
    info!(
        "Starting network sender to {}:{}",
        config.peer.host, config.peer.port
    );

    let manager = Arc::new(
        SessionManager::spawn(config.peer.clone(), config.transport.clone())
            .map_err(|e| eyre!("Failed to start session manager: {}", e))?,
    );
    let sink: Arc<dyn EventSink> = manager.clone();
    let shutdown = CancellationToken::new();
    let mut gamepad = GamepadHandle::spawn(config.source.clone(), sink, shutdown.clone())
        .map_err(|e| eyre!("Failed to spawn gamepad source: {}", e))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Stopping sender");

    shutdown.cancel();
    tokio::task::spawn_blocking(move || gamepad.stop())
        .await
        .map_err(|e| eyre!("Gamepad thread join failed: {}", e))?;
    manager.shutdown().await;

    let stats = manager.stats();
    info!(
        "Submitted {} events: {} delivered, {} dropped",
        stats.submitted, stats.delivered, stats.dropped
    );
    Ok(())
}

async fn run_peer(config: BridgeConfig, bind: String, port: u16) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::channel(1000);
    let server = PeerServer::bind(&bind, port, events_tx, config.transport.max_frame_len).await?;
    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
                info!("Shutting down");
                break;
            }
            received = events_rx.recv() => match received {
                Some(received) => info!(
                    "seq {} from {}: {}",
                    received.seq, received.client, received.event
                ),
                None => break,
            },
        }
    }

    shutdown.cancel();
    server_task
        .await
        .map_err(|e| eyre!("Peer server task failed: {}", e))??;
    Ok(())
}
