mod console;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use peerboard::board::PeerAddr;
use peerboard::config::{self, ConfigError, PeerConfig};
use peerboard::discovery;
use peerboard::index::IndexServer;
use peerboard::replication::ReplicationController;
use peerboard::session::{SessionLimits, TcpDialer};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("console failed: {0}")]
    Console(#[source] std::io::Error),
    #[error("directory service failed: {0}")]
    Index(#[source] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "peerboard", about = "Peer-to-peer shared whiteboard boards")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a peer with an interactive console.
    Peer(PeerArgs),
    /// Run the directory service.
    Index(IndexArgs),
}

#[derive(Args, Debug)]
struct PeerArgs {
    /// Host other peers use to reach this one.
    #[arg(long, env = "PEERBOARD_HOST", default_value = config::DEFAULT_HOST)]
    host: String,

    #[arg(long, env = "PEERBOARD_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Local address to listen on.
    #[arg(long, env = "PEERBOARD_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Directory service `host:port`.
    #[arg(long, env = "PEERBOARD_INDEX")]
    index: Option<PeerAddr>,

    #[arg(long, env = "PEERBOARD_SNAPSHOT_TIMEOUT_MS", default_value_t = config::DEFAULT_SNAPSHOT_TIMEOUT_MS)]
    snapshot_timeout_ms: u64,

    #[arg(long, env = "PEERBOARD_CONNECT_TIMEOUT_MS", default_value_t = config::DEFAULT_CONNECT_TIMEOUT_MS)]
    connect_timeout_ms: u64,

    #[arg(long, env = "PEERBOARD_SEND_QUEUE", default_value_t = config::DEFAULT_SEND_QUEUE)]
    send_queue: usize,

    #[arg(long, env = "PEERBOARD_MAX_FRAME_BYTES", default_value_t = config::DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
}

impl PeerArgs {
    fn config(&self) -> PeerConfig {
        PeerConfig {
            host: self.host.clone(),
            port: self.port,
            index: self.index.clone(),
            snapshot_timeout_ms: self.snapshot_timeout_ms,
            connect_timeout_ms: self.connect_timeout_ms,
            send_queue: self.send_queue,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

#[derive(Args, Debug)]
struct IndexArgs {
    #[arg(long, env = "PEERBOARD_INDEX_BIND", default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, env = "PEERBOARD_INDEX_PORT", default_value_t = config::DEFAULT_INDEX_PORT)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Peer(args) => run_peer(args).await,
        Command::Index(args) => run_index(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "peerboard failed");
            ExitCode::FAILURE
        }
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, CliError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|source| CliError::Bind { addr: format!("{host}:{port}"), source })
}

async fn run_peer(args: PeerArgs) -> Result<(), CliError> {
    let config = args.config();
    config.validate()?;

    let dialer = Arc::new(TcpDialer { connect_timeout: config.connect_timeout() });
    let controller = ReplicationController::new(config.clone(), dialer.clone());
    let listener = bind(&args.bind, config.port).await?;
    info!(peer = %config.local_peer(), bind = %args.bind, "peerboard peer listening");

    let server = {
        let controller = controller.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.serve(listener).await {
                error!(error = %e, "peer listener stopped");
            }
        })
    };
    tokio::spawn(log_events(controller.events()));

    if let Some(index) = &config.index {
        if let Err(e) = discovery::attach(&controller, dialer.as_ref(), index).await {
            warn!(error = %e, "running without directory service");
        }
    }

    println!("{}", console::HELP);
    let stdin = BufReader::new(tokio::io::stdin());
    let outcome = tokio::select! {
        result = console::run(&controller, stdin) => result.map_err(CliError::Console),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "signal handler failed");
            }
            Ok(())
        }
    };

    controller.shutdown().await;
    server.abort();
    outcome
}

async fn run_index(args: IndexArgs) -> Result<(), CliError> {
    let listener = bind(&args.bind, args.port).await?;
    IndexServer::new()
        .serve(listener, SessionLimits::default())
        .await
        .map_err(CliError::Index)
}

async fn log_events(mut events: broadcast::Receiver<peerboard::BoardEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(board_id = %event.board_id(), event = %json, "board event"),
                Err(e) => warn!(error = %e, "board event not serializable"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "event log fell behind"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
