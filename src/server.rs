//! HTTP entry point, request validation, handshake, and session registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::ServerOptions;
use crate::error::{CloseReason, EngineError};
use crate::packet::PROTOCOL;
use crate::socket::{Socket, SocketEvent};
use crate::transport::polling::{
    is_legacy_user_agent, DataOutcome, PollOutcome, PollResponse, PollingTransport,
};
use crate::transport::{Transport, TransportKind, WsTransport};

/// How long `close()` waits for the registry to drain before clearing it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(5_000);

// ---------------------------------------------------------------------------
// Consumer surface
// ---------------------------------------------------------------------------

/// Server-level events delivered to the consumer.
pub enum ServerEvent {
    /// A new session completed its handshake.
    Connection(Connection),
    /// A request was rejected before reaching a session.
    ConnectionError(ConnectionError),
}

/// A freshly opened session and its event stream.
pub struct Connection {
    pub socket: Arc<Socket>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub error: EngineError,
    pub remote_addr: Option<SocketAddr>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    opts: Arc<ServerOptions>,
    sessions: Arc<DashMap<String, Arc<Socket>>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    closed: AtomicBool,
}

impl Server {
    pub fn new(opts: ServerOptions) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let server = Self {
            inner: Arc::new(ServerInner {
                opts: Arc::new(opts),
                sessions: Arc::new(DashMap::new()),
                events,
                closed: AtomicBool::new(false),
            }),
        };
        (server, events_rx)
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.opts
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn session(&self, sid: &str) -> Option<Arc<Socket>> {
        self.inner.sessions.get(sid).map(|s| s.value().clone())
    }

    /// Build the router serving the configured mount path.
    pub fn router(&self) -> Router {
        let path = self.inner.opts.normalized_path();
        let mut router = Router::new()
            .route(&path, any(handle_request))
            .route(&format!("{path}/"), any(handle_request))
            .fallback(handle_fallback)
            .with_state(self.inner.clone());
        if let Some(cors) = self.inner.opts.cors.clone() {
            router = router.layer(cors);
        }
        router
    }

    /// Close every session and stop admitting requests.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        let sessions: Vec<Arc<Socket>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::info!(count = sessions.len(), "closing server");
        for socket in sessions {
            socket.close_now(CloseReason::ServerShuttingDown);
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.inner.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.sessions.clear();
    }
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

async fn handle_request(
    State(inner): State<Arc<ServerInner>>,
    ws: Option<WebSocketUpgrade>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    method: Method,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    if inner.closed.load(Ordering::Relaxed) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let remote_addr = connect_info.map(|ConnectInfo(addr)| addr);
    tracing::debug!(
        %method,
        transport = query.get("transport").map(String::as_str).unwrap_or("-"),
        sid = query.get("sid").map(String::as_str).unwrap_or("-"),
        "handling request"
    );

    match ws {
        Some(upgrade) => handle_upgrade(inner, upgrade, query, headers, method, remote_addr),
        None => handle_polling(inner, query, headers, method, remote_addr, body).await,
    }
}

/// Stray upgrades outside the mount are held briefly, then dropped, so the
/// client does not hang on a half-open attempt.
async fn handle_fallback(
    State(inner): State<Arc<ServerInner>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if ws.is_some() && inner.opts.destroy_upgrade {
        tokio::time::sleep(inner.opts.destroy_upgrade_timeout).await;
    }
    StatusCode::NOT_FOUND.into_response()
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Admission checks, in fixed order. Returns the addressed session, if any.
fn verify(
    inner: &ServerInner,
    query: &HashMap<String, String>,
    headers: &HeaderMap,
    method: &Method,
    upgrade: bool,
) -> Result<Option<Arc<Socket>>, EngineError> {
    if query.get("EIO").and_then(|v| v.parse::<u8>().ok()) != Some(PROTOCOL) {
        return Err(EngineError::UnsupportedProtocolVersion);
    }

    let kind = query
        .get("transport")
        .and_then(|t| TransportKind::from_query(t))
        .ok_or(EngineError::UnknownTransport)?;
    if !inner.opts.transports.contains(&kind) {
        return Err(EngineError::UnknownTransport);
    }

    if let Some(sid) = query.get("sid") {
        let socket = inner
            .sessions
            .get(sid)
            .map(|s| s.value().clone())
            .ok_or(EngineError::UnknownSid)?;
        let current = socket.transport_kind();
        if upgrade && kind == current {
            return Err(EngineError::BadRequest);
        }
        if !upgrade && kind != current {
            return Err(EngineError::BadRequest);
        }
        return Ok(Some(socket));
    }

    if !upgrade && *method != Method::GET {
        return Err(EngineError::BadHandshakeMethod);
    }

    if let Some(allow) = &inner.opts.allow_request {
        allow(headers, query).map_err(|message| EngineError::Forbidden(Some(message)))?;
    }
    Ok(None)
}

fn reject(inner: &ServerInner, error: EngineError, remote_addr: Option<SocketAddr>) -> Response {
    tracing::debug!(code = error.code(), message = error.message(), "request rejected");
    let _ = inner.events.send(ServerEvent::ConnectionError(ConnectionError {
        error: error.clone(),
        remote_addr,
    }));
    error.into_response()
}

// ---------------------------------------------------------------------------
// Polling path
// ---------------------------------------------------------------------------

async fn handle_polling(
    inner: Arc<ServerInner>,
    query: HashMap<String, String>,
    headers: HeaderMap,
    method: Method,
    remote_addr: Option<SocketAddr>,
    body: Bytes,
) -> Response {
    let session = match verify(&inner, &query, &headers, &method, false) {
        Ok(session) => session,
        Err(error) => return reject(&inner, error, remote_addr),
    };

    let legacy_ua = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(is_legacy_user_agent)
        .unwrap_or(false);

    match session {
        Some(socket) => {
            let transport = socket.current_transport();
            let Some(polling) = transport.as_polling() else {
                // A websocket session is only addressable through its frames.
                return reject(&inner, EngineError::BadRequest, remote_addr);
            };
            if method == Method::GET {
                poll(polling, accept_encoding(&headers), legacy_ua).await
            } else if method == Method::POST {
                data(polling, &body, legacy_ua)
            } else {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
        None => {
            // Handshake. Plain HTTP can only carry the polling transport.
            if query.get("transport").map(String::as_str) != Some("polling") {
                return reject(&inner, EngineError::BadRequest, remote_addr);
            }
            let supports_binary = query.get("b64").map(String::as_str) != Some("1");
            let polling = PollingTransport::new(
                supports_binary,
                inner.opts.max_http_buffer_size,
                inner.opts.http_compression.clone(),
            );
            let socket = handshake(&inner, Transport::Polling(polling.clone()), remote_addr);

            // The handshake request doubles as the first poll, so the open
            // packet rides its response.
            let response = poll(&polling, accept_encoding(&headers), legacy_ua).await;
            with_session_cookie(response, &inner.opts, socket.id())
        }
    }
}

async fn poll(polling: &Arc<PollingTransport>, accept_encoding: String, legacy_ua: bool) -> Response {
    match polling.on_poll_request(accept_encoding, legacy_ua) {
        PollOutcome::Overlap => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        PollOutcome::Closed => StatusCode::BAD_REQUEST.into_response(),
        PollOutcome::Parked { rx, guard } => {
            // The guard reports a premature disconnect if this future is
            // dropped while the request is still parked.
            let _guard = guard;
            match rx.await {
                Ok(drained) => poll_response(drained),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
    }
}

fn poll_response(drained: PollResponse) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(drained.content_type));
    if let Some(encoding) = drained.content_encoding {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }
    if drained.xss_protection {
        headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    }
    (drained.status, headers, drained.body).into_response()
}

fn data(polling: &Arc<PollingTransport>, body: &[u8], legacy_ua: bool) -> Response {
    match polling.on_data_request(body) {
        DataOutcome::Ok => {
            let mut headers = HeaderMap::new();
            // text/html keeps ancient user agents from offering a download.
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            if legacy_ua {
                headers.insert("x-xss-protection", HeaderValue::from_static("0"));
            }
            (StatusCode::OK, headers, "ok").into_response()
        }
        DataOutcome::Overlap => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        DataOutcome::TooLarge => StatusCode::PAYLOAD_TOO_LARGE.into_response(),
        DataOutcome::Malformed => StatusCode::BAD_REQUEST.into_response(),
    }
}

// ---------------------------------------------------------------------------
// WebSocket path
// ---------------------------------------------------------------------------

fn handle_upgrade(
    inner: Arc<ServerInner>,
    upgrade: WebSocketUpgrade,
    query: HashMap<String, String>,
    headers: HeaderMap,
    method: Method,
    remote_addr: Option<SocketAddr>,
) -> Response {
    if let Err(error) = verify(&inner, &query, &headers, &method, true) {
        return reject(&inner, error, remote_addr);
    }
    // Only the framed transport accepts upgraded requests.
    if query.get("transport").map(String::as_str) != Some("websocket") {
        return reject(&inner, EngineError::BadRequest, remote_addr);
    }

    let supports_binary = query.get("b64").map(String::as_str) != Some("1");
    let sid = query.get("sid").cloned();

    upgrade
        .on_upgrade(move |ws| async move {
            let transport = WsTransport::spawn(ws, supports_binary);
            match sid {
                Some(sid) => attach_probe(&inner, &sid, transport),
                None => {
                    handshake(&inner, Transport::Websocket(transport), remote_addr);
                }
            }
        })
        .into_response()
}

/// Wire a probe transport into an existing session, re-validating now that
/// the connection is established.
fn attach_probe(inner: &ServerInner, sid: &str, transport: Arc<WsTransport>) {
    let Some(socket) = inner.sessions.get(sid).map(|s| s.value().clone()) else {
        tracing::debug!(sid, "upgrade attempt for closed session");
        transport.close();
        return;
    };
    if socket.upgrading() {
        tracing::debug!(sid, "session is already trying to upgrade");
        transport.close();
        return;
    }
    if socket.upgraded() {
        tracing::debug!(sid, "session was already upgraded");
        transport.close();
        return;
    }
    socket.maybe_upgrade(Transport::Websocket(transport));
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

fn handshake(
    inner: &Arc<ServerInner>,
    transport: Transport,
    remote_addr: Option<SocketAddr>,
) -> Arc<Socket> {
    let sid = generate_sid(inner);
    tracing::info!(sid = %sid, transport = %transport.kind(), "handshake");

    let (socket, events) = Socket::new(
        sid.clone(),
        transport,
        remote_addr,
        inner.opts.clone(),
        Arc::downgrade(&inner.sessions),
    );
    inner.sessions.insert(sid, socket.clone());

    // Open before announcing the session, so nothing a consumer sends can
    // get ahead of the open packet.
    socket.open();
    let _ = inner.events.send(ServerEvent::Connection(Connection {
        socket: socket.clone(),
        events,
    }));
    socket
}

fn generate_sid(inner: &ServerInner) -> String {
    loop {
        let sid = match &inner.opts.generate_id {
            Some(custom) => custom(),
            None => default_sid(),
        };
        if !inner.sessions.contains_key(&sid) {
            return sid;
        }
        tracing::debug!("session id collision, retrying");
    }
}

fn default_sid() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use rand::Rng;

    let mut buf = [0u8; 20];
    rand::thread_rng().fill(&mut buf[..]);
    URL_SAFE_NO_PAD.encode(buf)
}

fn accept_encoding(headers: &HeaderMap) -> String {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn with_session_cookie(mut response: Response, opts: &ServerOptions, sid: &str) -> Response {
    if let Some(cookie) = &opts.cookie {
        let mut value = format!("{}={}; Path={}", cookie.name, sid, cookie.path);
        if cookie.http_only {
            value.push_str("; HttpOnly");
        }
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}
