//! Listening-role stream transport.
//!
//! Serves the HTTP side of the bridge: `GET /sse` opens the event
//! stream, `POST /messages/{session_id}` delivers caller messages. Each
//! accepted stream gets its own spawned tool process and its own
//! [`BridgeRunner`]; sessions share nothing but the listener.
//!
//! ```text
//!   GET /sse ──> endpoint event ──> message events ...
//!                    │
//!                    └─> POST /messages/{session_id} per request
//! ```
//!
//! The first event on every stream is `endpoint`, carrying the POST path
//! for that session. A caller that loses the stream must reconnect and
//! gets a fresh session with a fresh tool process; message delivery to a
//! torn-down session answers 404.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::{self, Stream};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::CrosswireError;
use crate::protocol::envelope::{Envelope, fast_correlation_id};
use crate::runner::BridgeRunner;
use crate::transport::TransportChannels;
use crate::transport::origin::{allowed_origins, validate_origin};
use crate::transport::stdio::{self, ProcessLaunch};

/// Shared state behind the HTTP handlers.
#[derive(Clone)]
struct ServerState {
    config: BridgeConfig,
    launch: ProcessLaunch,
    allowed_origins: Arc<Vec<String>>,
    /// Live sessions, keyed by the id embedded in the endpoint path.
    sessions: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Envelope>>>>,
    shutdown: broadcast::Sender<()>,
}

/// A bound listener ready to serve stream callers.
pub struct StreamServer {
    listener: TcpListener,
    app: Router,
    shutdown: broadcast::Sender<()>,
}

impl StreamServer {
    /// Bind the listener and assemble the routes.
    ///
    /// Nothing is spawned until a caller connects; `launch` is the
    /// template every session's tool process starts from.
    pub async fn bind(
        addr: SocketAddr,
        config: BridgeConfig,
        launch: ProcessLaunch,
        extra_origins: &[String],
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self, CrosswireError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| CrosswireError::ConfigError {
                details: format!("cannot bind {}: {}", addr, e),
            })?;
        let state = ServerState {
            config,
            launch,
            allowed_origins: Arc::new(allowed_origins(extra_origins)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: shutdown.clone(),
        };
        Ok(Self {
            listener,
            app: app(state),
            shutdown,
        })
    }

    /// The address actually bound, for port-zero binds.
    pub fn local_addr(&self) -> Result<SocketAddr, CrosswireError> {
        self.listener
            .local_addr()
            .map_err(|e| CrosswireError::ConfigError {
                details: format!("listener has no local address: {}", e),
            })
    }

    /// Serve until the shutdown signal fires.
    pub async fn serve(self) -> Result<(), CrosswireError> {
        let mut shutdown = self.shutdown.subscribe();
        info!(addr = %self.local_addr()?, "stream server listening");
        axum::serve(self.listener, self.app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .map_err(|e| {
                let correlation_id = fast_correlation_id();
                error!(error = %e, %correlation_id, "stream server failed");
                CrosswireError::InternalError {
                    correlation_id: correlation_id.to_string(),
                }
            })
    }
}

fn app(state: ServerState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/messages/{session_id}", post(post_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// `GET /sse`: open a stream, spawn its tool process, announce the
/// session's POST endpoint as the first event.
async fn sse_handler(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    validate_origin(&headers, &state.allowed_origins)?;

    let session_id = Uuid::new_v4();
    let (event_tx, event_rx) = mpsc::channel::<Envelope>(state.config.channel_capacity);
    let (post_tx, post_rx) = mpsc::channel::<Envelope>(state.config.channel_capacity);
    state.sessions.lock().await.insert(session_id, post_tx);

    let downstream = TransportChannels {
        outbound: event_tx,
        inbound: post_rx,
    };
    let server = state.clone();
    tokio::spawn(run_stream_session(server, session_id, downstream));

    info!(%session_id, "stream caller connected");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages/{}", session_id));
    let events = stream::once(async move { Ok(endpoint) }).chain(stream::unfold(
        event_rx,
        |mut event_rx| async move {
            let envelope = event_rx.recv().await?;
            let event = Event::default().event("message").data(envelope.to_line());
            Some((Ok(event), event_rx))
        },
    ));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.sse_keep_alive)))
}

/// One session from spawn to teardown.
///
/// The stream handler's receiver going away is the disconnect signal;
/// it races the runner so an idle session still tears down promptly
/// when its caller is gone. Teardown always kills this session's tool
/// process and unregisters the POST route.
async fn run_stream_session(
    state: ServerState,
    session_id: Uuid,
    downstream: TransportChannels,
) {
    let disconnected = downstream.outbound.clone();

    let spawned = stdio::spawn(&state.launch, state.config.channel_capacity);
    let (upstream, mut child) = match spawned {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%session_id, error = %e, "tool process failed to start");
            state.sessions.lock().await.remove(&session_id);
            return;
        }
    };

    let runner = BridgeRunner::new(state.config.clone());
    let outcome = tokio::select! {
        outcome = runner.run(downstream, upstream, state.shutdown.subscribe()) => Some(outcome),
        _ = disconnected.closed() => None,
    };

    match outcome {
        Some(Ok(reason)) => info!(%session_id, %reason, "stream session ended"),
        Some(Err(e)) => warn!(%session_id, error = %e, "stream session failed"),
        None => info!(%session_id, "stream caller disconnected"),
    }

    child.kill().await;
    state.sessions.lock().await.remove(&session_id);
}

/// `POST /messages/{session_id}`: decode one caller message and hand it
/// to the session it addresses.
async fn post_handler(
    State(state): State<ServerState>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    validate_origin(&headers, &state.allowed_origins)?;

    let envelope = match Envelope::decode(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(%session_id, error = %e, "rejecting undecodable message");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let sender = state.sessions.lock().await.get(&session_id).cloned();
    let Some(sender) = sender else {
        return Err(StatusCode::NOT_FOUND);
    };
    if sender.send(envelope).await.is_err() {
        // Session tore down between lookup and delivery
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(StatusCode::OK)
}
