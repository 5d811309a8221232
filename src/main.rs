//! wsdispatch — connection-oriented message dispatch over WebSocket
//!
//! A demo server wiring the dispatch core to the WebSocket transport.
//! Clients connect to the upgrade endpoint; ordinary HTTP requests that
//! carry the same correlation cookie can push messages to that client.
//!
//! Usage:
//!   wsdispatch                                   # Default port 5000, socket at "/"
//!   wsdispatch --port 8080                       # Custom port
//!   wsdispatch --match-one                       # First matching handler wins
//!   wsdispatch --cookie-key ws.ident             # Correlate by one cookie's value

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::State,
    routing::{get, post},
};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wsd_protocol::{MatchMode, PatternFlags};
use wsd_server::{BroadcastReport, DispatchConfig, SocketHub};
use wsd_transport::{ApiError, TransportConfig, TransportServer};

#[derive(Parser, Debug)]
#[command(name = "wsdispatch", about = "wsdispatch — WebSocket message dispatch server")]
struct Cli {
    /// Port to listen on (0 for OS-assigned)
    #[arg(long, default_value = "5000")]
    port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    hostname: String,

    /// Path of the WebSocket upgrade endpoint
    #[arg(long, default_value = "/")]
    path: String,

    /// Cookie whose value correlates HTTP requests with connections
    /// (default: the whole Cookie header)
    #[arg(long)]
    cookie_key: Option<String>,

    /// Stop dispatching a message at the first matching handler
    #[arg(long)]
    match_one: bool,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Enable permissive CORS
    #[arg(long)]
    cors: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Write logs to a file (defaults to ./wsdispatch.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    if let Some(ref log_file_arg) = cli.log_file {
        let log_path = if log_file_arg == "DEFAULT" {
            PathBuf::from("wsdispatch.log")
        } else {
            PathBuf::from(log_file_arg)
        };

        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();

        eprintln!("Logging to {}", log_path.display());
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

/// Register the demo handlers.
fn build_hub(mode: MatchMode) -> anyhow::Result<SocketHub> {
    let mut hub = SocketHub::new(DispatchConfig { mode });

    // "Ping" → "Pong", sent through the current-connection context.
    hub.on_message(|_, message| {
        if message == "Ping" {
            wsd_server::send_to_current("Pong")?;
        }
        Ok(None)
    });

    // Acknowledge every message.
    hub.on_message(|conn, _| {
        conn.send("ACK")?;
        Ok(None)
    });

    // Echo everything after a leading "ECHO ".
    hub.on_pattern("^ECHO .*", PatternFlags::default(), |_, message| {
        Ok(message.split_once(' ').map(|(_, rest)| rest.to_string()))
    })?;

    hub.on_open(|conn| {
        info!("Client {} opened (token: {})", conn.id(), conn.token().is_some());
        Ok(())
    })
    .on_close(|conn| {
        info!("Client {} closed", conn.id());
        Ok(())
    });

    Ok(hub)
}

#[derive(Deserialize)]
struct BroadcastForm {
    broadcast_form_message: String,
}

#[derive(Deserialize)]
struct NotifyForm {
    message: String,
}

async fn index() -> &'static str {
    "wsdispatch demo: connect a WebSocket to the upgrade endpoint, \
     POST /broadcast (broadcast_form_message) or /notify (message)."
}

async fn broadcast(
    State(hub): State<Arc<SocketHub>>,
    Form(form): Form<BroadcastForm>,
) -> Json<BroadcastReport> {
    Json(hub.broadcast(&form.broadcast_form_message))
}

/// Send to the connection correlated with this request's cookie.
async fn notify(
    State(hub): State<Arc<SocketHub>>,
    Form(form): Form<NotifyForm>,
) -> Result<&'static str, ApiError> {
    hub.send_to_current(form.message)?;
    Ok("sent")
}

fn build_app(hub: Arc<SocketHub>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/broadcast", post(broadcast))
        .route("/notify", post(notify))
        .with_state(hub)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let mode = if cli.match_one { MatchMode::One } else { MatchMode::All };
    let hub = Arc::new(build_hub(mode)?);
    let app = build_app(hub.clone());

    let config = TransportConfig {
        port: cli.port,
        hostname: cli.hostname.clone(),
        socket_path: cli.path.clone(),
        correlation_cookie: cli.cookie_key.clone(),
        max_connections: cli.max_connections,
        enable_cors: cli.cors,
    };

    let mut transport = match TransportServer::start(config, hub, app).await {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to start transport: {e}");
            return Err(e.into());
        }
    };

    println!();
    println!("  wsdispatch running");
    println!("    WebSocket: ws://{}{}", transport.local_addr(), cli.path);
    println!("    Dispatch:  {:?}", mode);
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await?;

    println!("  Shutting down...");
    transport.stop().await;
    println!("  Server stopped.");
    Ok(())
}
