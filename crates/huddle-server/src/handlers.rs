//! HTTP and WebSocket handlers for the Huddle server.
//!
//! Each upgraded WebSocket gets its own task running a gateway
//! [`Session`]; everything else here is plumbing around that.

use crate::config::{Config, PersistenceConfig, SinkKind};
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use huddle_core::{
    JsonLinesSink, LogSink, MessageSink, PersistenceStats, Router as HuddleRouter, WriteBehind,
};
use huddle_gateway::{Session, WsSocket};
use huddle_protocol::WireFormat;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Interval between metric gauge refreshes.
const METRICS_REFRESH: Duration = Duration::from_secs(5);

/// How long shutdown waits for queued messages to reach the sink.
const PERSISTENCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// The message router.
    pub router: Arc<HuddleRouter>,
    /// Server configuration.
    pub config: Config,
    connection_slots: Arc<Semaphore>,
}

impl AppState {
    /// Create app state with the given persistence handle.
    #[must_use]
    pub fn new(config: Config, persistence: WriteBehind) -> Self {
        let router = HuddleRouter::with_config(config.router_config(), persistence);
        Self {
            router: Arc::new(router),
            connection_slots: Arc::new(Semaphore::new(config.limits.max_connections)),
            config,
        }
    }

    /// Reserve a connection slot, if any are left.
    fn admit(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.connection_slots).try_acquire_owned().ok()
    }
}

/// Start the configured persistence sink.
///
/// # Errors
///
/// Returns an error if the sink cannot be opened.
pub async fn start_persistence(
    config: &PersistenceConfig,
) -> Result<(WriteBehind, Option<JoinHandle<()>>)> {
    if !config.enabled {
        info!("Message persistence disabled");
        return Ok((WriteBehind::disabled(), None));
    }

    let sink: Arc<dyn MessageSink> = match config.sink {
        SinkKind::Log => Arc::new(LogSink),
        SinkKind::Jsonl => Arc::new(JsonLinesSink::open(&config.path).await.with_context(
            || format!("Failed to open message log: {}", config.path.display()),
        )?),
    };

    let (persistence, worker) = WriteBehind::spawn(sink, config.queue_capacity);
    Ok((persistence, Some(worker)))
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = app(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let (persistence, worker) = start_persistence(&config.persistence).await?;
    let state = Arc::new(AppState::new(config.clone(), persistence));

    // Start metrics server if enabled
    let mut refresher = None;
    if config.metrics.enabled {
        match metrics::start_metrics_server(config.metrics.port) {
            Ok(()) => refresher = Some(tokio::spawn(refresh_metrics(Arc::clone(&state)))),
            Err(e) => error!("Failed to start metrics server: {:#}", e),
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Huddle server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state, shutdown_signal()).await?;
    info!("Server stopped");

    // The refresher holds the router, and with it the persistence queue
    if let Some(refresher) = refresher {
        refresher.abort();
    }
    if let Some(worker) = worker {
        if tokio::time::timeout(PERSISTENCE_DRAIN_TIMEOUT, worker)
            .await
            .is_err()
        {
            warn!("Gave up waiting for message persistence to drain");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Periodically publish registry gauges and persistence counters.
async fn refresh_metrics(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(METRICS_REFRESH);
    let mut previous = PersistenceStats::default();
    loop {
        interval.tick().await;

        let stats = state.router.registry().stats();
        huddle_gateway::metrics::set_registry_gauges(stats.room_count, stats.online_users);

        let current = state.router.persistence().stats();
        metrics::record_persistence(previous, current);
        previous = current;
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Registry and persistence statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.router.registry().stats();
    let persistence = state.router.persistence().stats();
    Json(serde_json::json!({
        "rooms": registry.room_count,
        "online_users": registry.online_users,
        "connections": registry.connection_count,
        "memberships": registry.total_memberships,
        "persistence": {
            "enabled": state.router.persistence().is_enabled(),
            "submitted": persistence.submitted,
            "dropped": persistence.dropped,
            "appended": persistence.appended,
            "failed": persistence.failed,
        },
    }))
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    format: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let format = match params.format.as_deref() {
        None => WireFormat::default(),
        Some(name) => match WireFormat::from_name(name) {
            Some(format) => format,
            None => {
                return (StatusCode::BAD_REQUEST, format!("Unknown format: {}", name))
                    .into_response()
            }
        },
    };

    let Some(permit) = state.admit() else {
        warn!(remote = %addr, "Connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, format, addr, permit))
}

/// Handle an upgraded WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    format: WireFormat,
    addr: SocketAddr,
    _permit: OwnedSemaphorePermit,
) {
    debug!(remote = %addr, format = ?format, "WebSocket connected");

    let socket = WsSocket::new(socket, format)
        .with_max_message_size(state.config.limits.max_message_size)
        .with_remote_addr(addr.to_string());
    Session::new(Arc::clone(&state.router), socket).run().await;

    debug!(remote = %addr, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, Stream, StreamExt};
    use huddle_protocol::{codec, ClientEvent, ServerEvent};
    use tokio::sync::oneshot;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    async fn start(config: Config) -> (SocketAddr, Arc<AppState>, oneshot::Sender<()>) {
        let state = Arc::new(AppState::new(config, WriteBehind::disabled()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let server_state = Arc::clone(&state);
        tokio::spawn(async move {
            serve(listener, server_state, async move {
                let _ = stopped.await;
            })
            .await
            .unwrap();
        });

        (addr, state, stop)
    }

    async fn next_message<S>(ws: &mut S) -> Message
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .unwrap()
    }

    async fn next_json<S>(ws: &mut S) -> ServerEvent
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Message::Text(text) = next_message(ws).await {
                return codec::decode_json(&text).unwrap();
            }
        }
    }

    async fn next_binary<S>(ws: &mut S) -> ServerEvent
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            if let Message::Binary(data) = next_message(ws).await {
                return codec::decode(&data).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_json_chat() {
        let (addr, state, stop) = start(Config::default()).await;
        let url = format!("ws://{}/ws", addr);

        let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
        assert!(matches!(
            next_json(&mut alice).await,
            ServerEvent::Connected { .. }
        ));

        let join = codec::encode_json(&ClientEvent::join_room("alice", "general")).unwrap();
        alice.send(Message::Text(join)).await.unwrap();
        assert_eq!(
            next_json(&mut alice).await,
            ServerEvent::UserList {
                room: "general".to_string(),
                users: vec!["alice".to_string()],
            }
        );

        let hello =
            codec::encode_json(&ClientEvent::send_message("alice", "general", "hello")).unwrap();
        alice.send(Message::Text(hello)).await.unwrap();
        match next_json(&mut alice).await {
            ServerEvent::ReceiveMessage {
                username, message, ..
            } => {
                assert_eq!(username, "alice");
                assert_eq!(message, "hello");
            }
            other => panic!("Expected receive_message, got {:?}", other),
        }
        assert_eq!(state.router.registry().stats().online_users, 1);

        alice.close(None).await.unwrap();
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_websocket_msgpack_frames() {
        let (addr, _state, stop) = start(Config::default()).await;
        let url = format!("ws://{}/ws?format=msgpack", addr);

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        assert!(matches!(
            next_binary(&mut ws).await,
            ServerEvent::Connected { .. }
        ));

        let join = codec::encode(&ClientEvent::join_room("bob", "random")).unwrap();
        ws.send(Message::Binary(join.to_vec())).await.unwrap();
        assert!(matches!(
            next_binary(&mut ws).await,
            ServerEvent::UserList { room, .. } if room == "random"
        ));

        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_unknown_format_rejected() {
        let (addr, _state, stop) = start(Config::default()).await;
        let url = format!("ws://{}/ws?format=xml", addr);
        assert!(connect_async(url.as_str()).await.is_err());
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (addr, _state, stop) = start(config).await;
        let url = format!("ws://{}/ws", addr);

        let (_first, _) = connect_async(url.as_str()).await.unwrap();
        assert!(connect_async(url.as_str()).await.is_err());
        let _ = stop.send(());
    }

    #[tokio::test]
    async fn test_disabled_persistence() {
        let config = PersistenceConfig {
            enabled: false,
            ..Default::default()
        };
        let (persistence, worker) = start_persistence(&config).await.unwrap();
        assert!(!persistence.is_enabled());
        assert!(worker.is_none());
    }
}
