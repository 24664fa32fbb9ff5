//! Connecting stream transport: SSE downlink plus HTTP POST uplink.
//!
//! The remote endpoint speaks the two-channel stream convention: a GET
//! to the stream URL opens a long-lived SSE response whose first event
//! (`event: endpoint`) names the session's message URL, and every
//! envelope we want to deliver is POSTed there as a JSON body. Envelopes
//! from the peer arrive as `event: message` records on the stream.
//!
//! A dropped or errored stream is session-fatal. The transport never
//! reconnects on its own; a fresh session must redo the handshake, so
//! retrying underneath the session layer would only hide the closure.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::CrosswireError;
use crate::protocol::envelope::Envelope;
use crate::transport::TransportChannels;

/// Where and how to attach to a remote stream endpoint.
#[derive(Debug, Clone)]
pub struct SseClientConfig {
    /// Stream URL, e.g. `http://127.0.0.1:8766/sse`
    pub url: String,
    /// Optional bearer token attached to the GET and every POST
    pub bearer_token: Option<String>,
    /// Bound for connection establishment plus endpoint discovery
    pub connect_timeout: Duration,
    /// Transport channel capacity
    pub capacity: usize,
}

/// Open the stream, wait for the endpoint event, and wire both
/// directions into envelope channels.
///
/// Fails if the connection cannot be established, the server closes
/// before announcing an endpoint, or discovery exceeds the configured
/// timeout.
pub async fn connect(cfg: &SseClientConfig) -> Result<TransportChannels, CrosswireError> {
    let base = reqwest::Url::parse(&cfg.url).map_err(|e| CrosswireError::ConfigError {
        details: format!("invalid stream url '{}': {}", cfg.url, e),
    })?;

    let client = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .build()
        .map_err(|e| CrosswireError::UpstreamConnectionFailed {
            reason: format!("http client: {}", e),
        })?;

    let mut request = client.get(base.clone());
    if let Some(token) = &cfg.bearer_token {
        request = request.bearer_auth(token);
    }

    let mut events =
        EventSource::new(request).map_err(|e| CrosswireError::UpstreamConnectionFailed {
            reason: format!("cannot build event source: {}", e),
        })?;

    let endpoint = tokio::time::timeout(cfg.connect_timeout, wait_for_endpoint(&mut events))
        .await
        .map_err(|_| CrosswireError::UpstreamTimeout {
            timeout_secs: cfg.connect_timeout.as_secs(),
        })??;

    // Joining resolves both absolute paths and full URLs
    let messages_url =
        base.join(&endpoint)
            .map_err(|e| CrosswireError::UpstreamConnectionFailed {
                reason: format!("bad endpoint '{}': {}", endpoint, e),
            })?;

    debug!(endpoint = %messages_url, "stream endpoint resolved");

    let (outbound_tx, outbound_rx) = mpsc::channel(cfg.capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.capacity);
    let (post_gone_tx, post_gone_rx) = oneshot::channel();

    tokio::spawn(read_events(events, inbound_tx, post_gone_rx));
    tokio::spawn(post_messages(
        client,
        messages_url,
        cfg.bearer_token.clone(),
        outbound_rx,
        post_gone_tx,
    ));

    Ok(TransportChannels {
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}

/// Consume stream events until the server names its message endpoint.
async fn wait_for_endpoint(events: &mut EventSource) -> Result<String, CrosswireError> {
    while let Some(event) = events.next().await {
        match event {
            Ok(Event::Open) => debug!("stream connection open"),
            Ok(Event::Message(message)) => match message.event.as_str() {
                "endpoint" => return Ok(message.data),
                other => debug!(event = other, "ignoring pre-endpoint event"),
            },
            Err(e) => {
                return Err(CrosswireError::UpstreamConnectionFailed {
                    reason: format!("stream failed before endpoint event: {}", e),
                });
            }
        }
    }
    Err(CrosswireError::UpstreamConnectionFailed {
        reason: "stream closed before endpoint event".to_string(),
    })
}

/// Decode `message` events into the inbound channel until the stream
/// dies or the POST side reports a delivery failure.
async fn read_events(
    mut events: EventSource,
    inbound: mpsc::Sender<Envelope>,
    mut post_gone: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            // Fires on both explicit failure and normal sender drop;
            // either way the session is done with this transport.
            _ = &mut post_gone => {
                debug!("stream reader stopping, uplink is gone");
                break;
            }
            next = events.next() => match next {
                Some(Ok(Event::Open)) => debug!("stream connection open"),
                Some(Ok(Event::Message(message))) => match message.event.as_str() {
                    "message" => match Envelope::decode(message.data.as_bytes()) {
                        Ok(envelope) => {
                            if inbound.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable stream event");
                        }
                    },
                    "endpoint" => debug!("duplicate endpoint event ignored"),
                    other => debug!(event = other, "ignoring unknown stream event"),
                },
                Some(Err(e)) => {
                    warn!(error = %e, "stream error, closing transport");
                    break;
                }
                None => {
                    debug!("stream ended");
                    break;
                }
            }
        }
    }
    events.close();
}

/// POST each outbound envelope to the message endpoint.
///
/// `reader_wake` is never sent on; it is held so that dropping it, on
/// failure or when the outbound channel closes, wakes the event reader.
async fn post_messages(
    client: reqwest::Client,
    url: reqwest::Url,
    bearer: Option<String>,
    mut outbound: mpsc::Receiver<Envelope>,
    reader_wake: oneshot::Sender<()>,
) {
    while let Some(envelope) = outbound.recv().await {
        let mut request = client
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(envelope.to_line());
        if let Some(token) = &bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "message delivery rejected");
                break;
            }
            Err(e) => {
                warn!(error = %e, "message delivery failed");
                break;
            }
        }
    }
    drop(reader_wake);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{JsonRpcId, JsonRpcRequest};
    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::response::sse::{Event as ServerEvent, KeepAlive, Sse};
    use axum::routing::{get, post};
    use futures_util::stream;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;

    #[derive(Clone, Default)]
    struct EchoState {
        // Session uplink: the POST handler feeds what it receives back
        // onto the stream, making the whole server an envelope mirror.
        uplink: Arc<Mutex<Option<mpsc::Sender<String>>>>,
        auth_headers: Arc<Mutex<Vec<String>>>,
    }

    async fn sse_handler(
        State(state): State<EchoState>,
    ) -> Sse<impl futures_util::Stream<Item = Result<ServerEvent, Infallible>>> {
        let (tx, rx) = mpsc::channel::<String>(8);
        *state.uplink.lock().unwrap() = Some(tx);

        let endpoint = stream::once(async {
            Ok(ServerEvent::default().event("endpoint").data("/messages/test"))
        });
        let messages = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|body| (Ok(ServerEvent::default().event("message").data(body)), rx))
        });

        Sse::new(endpoint.chain(messages)).keep_alive(KeepAlive::default())
    }

    async fn message_handler(
        State(state): State<EchoState>,
        headers: HeaderMap,
        body: String,
    ) -> &'static str {
        if let Some(auth) = headers.get(header::AUTHORIZATION) {
            state
                .auth_headers
                .lock()
                .unwrap()
                .push(auth.to_str().unwrap_or_default().to_string());
        }
        let uplink = state.uplink.lock().unwrap().clone();
        if let Some(tx) = uplink {
            let _ = tx.send(body).await;
        }
        ""
    }

    async fn start_echo_server() -> (SocketAddr, EchoState) {
        let state = EchoState::default();
        let app = Router::new()
            .route("/sse", get(sse_handler))
            .route("/messages/test", post(message_handler))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    fn client_config(addr: SocketAddr) -> SseClientConfig {
        SseClientConfig {
            url: format!("http://{}/sse", addr),
            bearer_token: None,
            connect_timeout: Duration::from_secs(5),
            capacity: 8,
        }
    }

    #[tokio::test]
    async fn test_connect_and_round_trip() {
        let (addr, _state) = start_echo_server().await;

        let mut channels = connect(&client_config(addr)).await.unwrap();

        let request = Envelope::Request(JsonRpcRequest::new(
            JsonRpcId::Number(5),
            "tools/list",
            None,
        ));
        channels.outbound.send(request.clone()).await.unwrap();

        let echoed = timeout(Duration::from_secs(5), channels.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, request);
    }

    #[tokio::test]
    async fn test_bearer_token_attached_to_posts() {
        let (addr, state) = start_echo_server().await;

        let mut cfg = client_config(addr);
        cfg.bearer_token = Some("sekrit".to_string());
        let channels = connect(&cfg).await.unwrap();

        channels
            .outbound
            .send(Envelope::Notification(JsonRpcRequest::notification(
                "notifications/initialized",
                None,
            )))
            .await
            .unwrap();

        // Wait for the POST to land
        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = state.auth_headers.lock().unwrap().clone();
        assert_eq!(seen, vec!["Bearer sekrit".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then immediately drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = client_config(addr);
        cfg.connect_timeout = Duration::from_secs(2);
        let err = connect(&cfg).await.unwrap_err();
        assert!(matches!(
            err,
            CrosswireError::UpstreamConnectionFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_endpoint_event_times_out() {
        // A stream that opens but never announces an endpoint
        async fn silent_sse()
        -> Sse<impl futures_util::Stream<Item = Result<ServerEvent, Infallible>>> {
            Sse::new(stream::pending())
        }

        let app = Router::new().route("/sse", get(silent_sse));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = client_config(addr);
        cfg.connect_timeout = Duration::from_millis(300);
        let err = connect(&cfg).await.unwrap_err();
        assert!(matches!(err, CrosswireError::UpstreamTimeout { .. }));
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let cfg = SseClientConfig {
            url: "not a url".to_string(),
            bearer_token: None,
            connect_timeout: Duration::from_secs(1),
            capacity: 8,
        };
        let err = connect(&cfg).await.unwrap_err();
        assert!(matches!(err, CrosswireError::ConfigError { .. }));
    }
}
