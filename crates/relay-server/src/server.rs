use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use relay_core::{CredentialGate, Identity, MessageLog, RelayError};
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::api::{self, ApiError};
use crate::auth::{self, SessionTokens};
use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::registry::{Connection, ConnectionRegistry};
use crate::session::{self, SessionPump, WriterConfig};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<dyn CredentialGate>,
    pub log: Arc<dyn MessageLog>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub tokens: Arc<SessionTokens>,
    /// One permit per allowed WebSocket session, taken before the upgrade
    /// and held until the session ends.
    pub connection_slots: Arc<Semaphore>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, log: Arc<dyn MessageLog>, gate: Arc<dyn CredentialGate>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&log), Arc::clone(&registry)));
        Self {
            gate,
            log,
            registry,
            broadcaster,
            tokens: Arc::new(SessionTokens::new()),
            connection_slots: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/register", post(api::register))
        .route("/login", post(api::login))
        .route("/logout", post(api::logout))
        .route("/messages", get(api::history).post(api::post_message))
        .route("/health", get(api::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    log: Arc<dyn MessageLog>,
    gate: Arc<dyn CredentialGate>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(config, log, gate);
    let listener = tokio::net::TcpListener::bind(state.config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let router = build_router(state.clone());
    let signal = shutdown.clone();
    let registry = Arc::clone(&state.registry);
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                signal.cancelled().await;
                let closed = registry.close_all();
                info!(connections = closed, "closing live connections");
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server exited with error");
        }
    });

    info!(%addr, "relay server listening");
    Ok(ServerHandle {
        addr,
        state,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting, close every live connection and wait for the server
    /// task to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            error!(error = %e, "server task failed");
        }
        info!("relay server stopped");
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// WebSocket upgrade: resolve the session token, enforce the connection
/// limit, then hand the socket to a session.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let identity = match params.token.as_deref().or_else(|| auth::bearer_token(&headers)) {
        Some(token) => state.tokens.resolve(token),
        None => Err(RelayError::AuthFailure("missing session token".into())),
    };
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "websocket handshake rejected");
            return ApiError::from(e).into_response();
        }
    };

    let Ok(slot) = Arc::clone(&state.connection_slots).try_acquire_owned() else {
        let limit = state.config.max_connections;
        warn!(author = %identity, limit, "connection limit reached, refusing handshake");
        return ApiError::over_capacity(limit).into_response();
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, identity, state, slot))
}

async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState, _slot: OwnedSemaphorePermit) {
    let (sink, stream) = socket.split();
    let (connection, outbox) = Connection::new(identity, state.config.outbox_capacity);

    let writer = tokio::spawn(session::write_outbound(
        sink,
        outbox,
        Arc::clone(&connection),
        WriterConfig::from(state.config.as_ref()),
    ));

    let _ = SessionPump::new(connection, Arc::clone(&state.broadcaster))
        .run(stream)
        .await;

    if let Err(e) = writer.await {
        error!(error = %e, "writer task failed");
    }
}
