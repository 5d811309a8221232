//! WebSocket transport server using Axum.
//!
//! Exposes exactly one upgrade endpoint. Every other request falls through
//! to the application's router, wrapped in middleware that lets the handler
//! bridge the request to the live connection named by its correlation
//! cookie.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Router,
    body::Body,
    extract::{
        FromRequestParts, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{BoxStream, SplitStream},
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use wsd_protocol::{ConnectionId, CorrelationToken, Outbound};

use crate::connection::{Connection, Handshake};
use crate::cookie::correlation_token;
use crate::error::TransportError;

/// Inbound messages for one connection. `Ok(None)` is the no-data sentinel
/// the transport yields when the peer sends a close frame.
pub type InboundStream = BoxStream<'static, Result<Option<String>, TransportError>>;

/// Implemented by the dispatch core. The transport calls it for every
/// accepted connection and every bridged HTTP request.
pub trait SocketHandler: Send + Sync + 'static {
    /// Drive one connection from accept to close. Returns once the
    /// connection's lifecycle has finished.
    fn serve_connection(
        &self,
        conn: Connection,
        inbound: InboundStream,
    ) -> impl Future<Output = ()> + Send;

    /// Run an ordinary HTTP request, making the connection correlated with
    /// `token` (if any) current for its duration.
    fn bridge_request<F>(
        &self,
        token: Option<CorrelationToken>,
        request: F,
    ) -> impl Future<Output = F::Output> + Send
    where
        F: Future + Send,
        F::Output: Send;
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Path of the upgrade endpoint
    pub socket_path: String,
    /// Cookie whose value correlates requests with connections.
    /// `None` uses the whole `Cookie` header.
    pub correlation_cookie: Option<String>,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Enable permissive CORS
    pub enable_cors: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            hostname: "127.0.0.1".into(),
            socket_path: "/".into(),
            correlation_cookie: None,
            max_connections: None,
            enable_cors: false,
        }
    }
}

/// Shared state for the transport server.
struct AppState<H: SocketHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    /// Application router, already wrapped in the bridge middleware
    app: Router,
    /// Connected client count (for health check and connection limit)
    client_count: Arc<AtomicUsize>,
}

/// State for the bridge middleware.
struct BridgeState<H: SocketHandler> {
    handler: Arc<H>,
    correlation_cookie: Option<String>,
}

impl<H: SocketHandler> Clone for BridgeState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            correlation_cookie: self.correlation_cookie.clone(),
        }
    }
}

/// The transport server: accepts connections and hands them to the handler.
pub struct TransportServer {
    /// Shutdown signal
    shutdown_tx: Option<oneshot::Sender<()>>,
    /// Server task handle
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Actual bound address
    local_addr: SocketAddr,
}

impl TransportServer {
    /// Bind and start serving. `app` handles every non-upgrade request.
    pub async fn start<H: SocketHandler>(
        config: TransportConfig,
        handler: Arc<H>,
        app: Router,
    ) -> Result<Self, TransportError> {
        let router = build_router(config.clone(), handler, app);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "wsdispatch listening on ws://{}{}",
            local_addr, config.socket_path
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                warn!("Transport server exited with error: {e}");
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            local_addr,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gracefully stop the server.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("wsdispatch transport stopped");
    }
}

/// Build the full router: upgrade endpoint, health check, and the bridged
/// application router as fallback.
pub fn build_router<H: SocketHandler>(config: TransportConfig, handler: Arc<H>, app: Router) -> Router {
    let bridge = BridgeState {
        handler: handler.clone(),
        correlation_cookie: config.correlation_cookie.clone(),
    };
    let app = app.layer(middleware::from_fn_with_state(bridge, bridge_middleware::<H>));

    let enable_cors = config.enable_cors;
    let socket_path = config.socket_path.clone();
    let state = Arc::new(AppState {
        handler,
        config,
        app: app.clone(),
        client_count: Arc::new(AtomicUsize::new(0)),
    });

    let router = Router::new()
        .route(&socket_path, any(ws_upgrade_handler::<H>))
        .route("/health", get(health_handler::<H>))
        .fallback_service(app)
        .with_state(state);

    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: SocketHandler>(
    State(state): State<Arc<AppState<H>>>,
    request: Request,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(_) => {
            // Not an upgrade: the path belongs to the application too.
            let request = Request::from_parts(parts, body);
            return match state.app.clone().oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            };
        }
    };

    // Check connection limit. The slot is released when the connection ends
    // or the upgrade never completes.
    let Some(slot) = ConnectionSlot::acquire(&state.client_count, state.config.max_connections)
    else {
        warn!(
            "Connection rejected: max connections reached ({})",
            state.config.max_connections.unwrap_or_default()
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let mut handshake = Handshake::new(parts.uri.path());
    handshake.token = correlation_token(&parts.headers, state.config.correlation_cookie.as_deref());

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, handshake, slot))
        .into_response()
}

async fn health_handler<H: SocketHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    }))
}

async fn bridge_middleware<H: SocketHandler>(
    State(bridge): State<BridgeState<H>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let token = correlation_token(request.headers(), bridge.correlation_cookie.as_deref());
    bridge.handler.bridge_request(token, next.run(request)).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection limit
// ─────────────────────────────────────────────────────────────────────────────

/// One reserved place in the client count, released on drop.
struct ConnectionSlot {
    count: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    /// Reserve a slot, or `None` if `max` connections are already counted.
    fn acquire(count: &Arc<AtomicUsize>, max: Option<usize>) -> Option<Self> {
        let max = max.unwrap_or(usize::MAX);
        count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        Some(Self {
            count: count.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection<H: SocketHandler>(
    socket: WebSocket,
    state: Arc<AppState<H>>,
    handshake: Handshake,
    slot: ConnectionSlot,
) {
    let (conn, outbound_rx) = Connection::pair(handshake);
    let client_id = conn.id();
    let connected_at = conn.handshake().connected_at;
    info!("Client connected: {client_id} on {}", conn.handshake().path);

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_outbound(ws_tx, outbound_rx, client_id));

    state
        .handler
        .serve_connection(conn.clone(), inbound_stream(ws_rx, client_id))
        .await;

    // Flushes anything still queued, then the close frame.
    conn.close();
    drop(conn);
    let _ = writer.await;

    drop(slot);
    let duration = Utc::now().signed_duration_since(connected_at);
    info!(
        "Client disconnected: {client_id} after {}s (total: {})",
        duration.num_seconds(),
        state.client_count.load(Ordering::Relaxed)
    );
}

async fn write_outbound(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    client_id: ConnectionId,
) {
    while let Some(frame) = outbound_rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    debug!("Failed to send to {client_id}: {e}");
                    break;
                }
            }
            Outbound::Close => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

fn inbound_stream(ws_rx: SplitStream<WebSocket>, client_id: ConnectionId) -> InboundStream {
    futures_util::stream::unfold((ws_rx, false), move |(mut rx, done)| async move {
        if done {
            return None;
        }
        loop {
            match rx.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some((Ok(Some(text.as_str().to_owned())), (rx, false)));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some((Ok(Some(text)), (rx, false))),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame from {client_id}"),
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("Close frame from {client_id}");
                    return Some((Ok(None), (rx, true)));
                }
                // Pings are answered by the websocket layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error for {client_id}: {e}");
                    return Some((Err(TransportError::WebSocket(e)), (rx, true)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
