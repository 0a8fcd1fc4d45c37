//! Edge listener and request router
//!
//! Every configured entry point is bound up front by [`EdgeServer::bind`].
//! Plaintext entry points answer ACME HTTP-01 challenges and optionally
//! redirect to a TLS entry point. TLS entry points read the ClientHello first
//! so the certificate manager can finish a pending issuance before a
//! certificate is chosen.
//!
//! Per request: extract the host, take one routing table snapshot, match,
//! apply middlewares, pick a backend round-robin and forward through the
//! pooled client. WebSocket and other HTTP/1.1 upgrades are tunnelled.

use crate::access_log::{AccessLogger, AccessRecord};
use crate::acme::{ChallengeStore, ACME_TLS_ALPN_NAME};
use crate::certmanager::{is_acme_challenge, CertManager};
use crate::config::EntryPointConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::labels::MiddlewareSpec;
use crate::pool::ConnectionPool;
use crate::registry::{BackendHealth, DiscoveryEvent};
use crate::routing::{normalize_host, Route, SharedRoutes};
use anyhow::Context;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::http::uri::PathAndQuery;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::ServerConfig;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

/// Status recorded when the client goes away before a response
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// Largest upgrade response head accepted from a backend
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Everything request handling needs, shared by all entry points
pub struct EdgeState {
    pub routes: SharedRoutes,
    pub pool: Arc<ConnectionPool>,
    pub access_log: Arc<AccessLogger>,
    pub challenges: ChallengeStore,
    /// Health reports back to the registry
    pub registry_tx: mpsc::Sender<DiscoveryEvent>,
    pub certs: Option<Arc<CertManager>>,
    pub request_timeout: Duration,
}

/// Per-connection facts
struct ConnectionInfo {
    entrypoint: String,
    client_addr: SocketAddr,
    is_tls: bool,
    /// Plaintext entry point redirecting to a TLS port
    redirect_port: Option<u16>,
}

struct BoundEntryPoint {
    name: String,
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    redirect_port: Option<u16>,
}

/// Counts open client connections so shutdown can wait for them
#[derive(Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<usize>>,
}

struct ConnectionGuard {
    active: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl ConnectionTracker {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    fn track(&self) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait until no connection is open; false if `timeout` ran out first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        let idle = async {
            loop {
                if *rx.borrow_and_update() == 0 {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, idle).await.is_ok()
    }
}

/// All entry points, bound and ready to accept
pub struct EdgeServer {
    entrypoints: Vec<BoundEntryPoint>,
    state: Arc<EdgeState>,
    connections: ConnectionTracker,
}

impl EdgeServer {
    /// Bind every entry point. Any bind failure is an error.
    pub async fn bind(
        entrypoints: &BTreeMap<String, EntryPointConfig>,
        state: EdgeState,
    ) -> anyhow::Result<Self> {
        let tls_config = match &state.certs {
            Some(certs) if entrypoints.values().any(|ep| ep.tls) => Some(certs.server_config()?),
            _ => None,
        };

        let mut bound = Vec::with_capacity(entrypoints.len());
        for (name, ep) in entrypoints {
            let addr = ep.socket_addr()?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind entry point '{}' on {}", name, addr))?;

            let tls = if ep.tls {
                Some(tls_config.clone().with_context(|| {
                    format!("Entry point '{}' terminates TLS but no certificate manager is configured", name)
                })?)
            } else {
                None
            };
            let redirect_port = ep
                .redirect_to
                .as_ref()
                .and_then(|target| entrypoints.get(target))
                .and_then(|target| target.port());

            info!(
                entrypoint = %name,
                addr = %listener.local_addr()?,
                tls = ep.tls,
                redirect_port,
                "Entry point bound"
            );
            bound.push(BoundEntryPoint {
                name: name.clone(),
                listener,
                tls,
                redirect_port,
            });
        }

        Ok(Self {
            entrypoints: bound,
            state: Arc::new(state),
            connections: ConnectionTracker::new(),
        })
    }

    /// Address an entry point actually listens on
    pub fn local_addr(&self, entrypoint: &str) -> Option<SocketAddr> {
        self.entrypoints
            .iter()
            .find(|ep| ep.name == entrypoint)
            .and_then(|ep| ep.listener.local_addr().ok())
    }

    pub fn connections(&self) -> ConnectionTracker {
        self.connections.clone()
    }

    /// Start one accept loop per entry point
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let state = self.state;
        let connections = self.connections;
        self.entrypoints
            .into_iter()
            .map(|ep| {
                let state = Arc::clone(&state);
                let connections = connections.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(accept_loop(ep, state, connections, shutdown_rx))
            })
            .collect()
    }
}

async fn accept_loop(
    ep: BoundEntryPoint,
    state: Arc<EdgeState>,
    connections: ConnectionTracker,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = ep.listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let guard = connections.track();
                        let conn = Arc::new(ConnectionInfo {
                            entrypoint: ep.name.clone(),
                            client_addr: addr,
                            is_tls: ep.tls.is_some(),
                            redirect_port: ep.redirect_port,
                        });
                        let state = Arc::clone(&state);
                        let tls = ep.tls.clone();
                        let shutdown_rx = shutdown_rx.clone();

                        tokio::spawn(async move {
                            let _guard = guard;
                            let result = match tls {
                                Some(config) => accept_tls(stream, config, conn, state, shutdown_rx).await,
                                None => handle_connection(stream, conn, state, shutdown_rx).await,
                            };
                            if let Err(e) = result {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(entrypoint = %ep.name, error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(entrypoint = %ep.name, "Entry point shutting down");
                    break;
                }
            }
        }
    }
}

/// Read the ClientHello, give certificate issuance its chance, then handshake
async fn accept_tls(
    stream: TcpStream,
    config: Arc<ServerConfig>,
    conn: Arc<ConnectionInfo>,
    state: Arc<EdgeState>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .context("Reading ClientHello")?;

    let (sni, challenge) = {
        let hello = start.client_hello();
        (hello.server_name().map(String::from), is_acme_challenge(&hello))
    };

    if !challenge {
        if let Some(certs) = &state.certs {
            certs.prepare_handshake(sni.as_deref()).await;
        }
    }

    let tls_stream = start.into_stream(config).await.context("TLS handshake failed")?;

    if tls_stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_NAME) {
        debug!(sni = ?sni, "Answered TLS-ALPN-01 challenge handshake");
        return Ok(());
    }

    handle_connection(tls_stream, conn, state, shutdown_rx).await
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    conn: Arc<ConnectionInfo>,
    state: Arc<EdgeState>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        let conn = Arc::clone(&conn);
        async move { handle_request(req, state, conn).await }
    });

    // HTTP/1.1 (with upgrades) and HTTP/2, cleartext or negotiated over TLS
    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder.http1().preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let connection = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = shutdown_signal(shutdown_rx) => {
            connection.as_mut().graceful_shutdown();
            connection
                .await
                .map_err(|e| anyhow::anyhow!("Connection error during shutdown: {}", e))?;
        }
    }

    Ok(())
}

/// Emits the access record when the response is produced, or with status
/// 499 if the request future is dropped first
struct AccessGuard {
    logger: Arc<AccessLogger>,
    record: Option<AccessRecord>,
    started: Instant,
}

impl AccessGuard {
    fn new<B>(req: &Request<B>, conn: &ConnectionInfo, logger: Arc<AccessLogger>) -> Self {
        let record = AccessRecord {
            timestamp: chrono::Utc::now(),
            client: conn.client_addr.ip().to_string(),
            method: req.method().to_string(),
            host: extract_host(req).unwrap_or_else(|| "-".to_string()),
            path: req.uri().path().to_string(),
            status: CLIENT_CLOSED_REQUEST,
            latency_ms: 0,
            backend: None,
            router: None,
            entrypoint: conn.entrypoint.clone(),
        };
        Self {
            logger,
            record: Some(record),
            started: Instant::now(),
        }
    }

    fn route(&mut self, route: &Route) {
        if let Some(r) = self.record.as_mut() {
            r.router = Some(route.name.clone());
        }
    }

    fn backend(&mut self, address: SocketAddr) {
        if let Some(r) = self.record.as_mut() {
            r.backend = Some(address.to_string());
        }
    }

    fn finish(mut self, status: StatusCode) {
        if let Some(mut record) = self.record.take() {
            record.status = status.as_u16();
            record.latency_ms = self.started.elapsed().as_millis() as u64;
            self.logger.log(record);
        }
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.record.take() {
            record.latency_ms = self.started.elapsed().as_millis() as u64;
            debug!(host = %record.host, path = %record.path, "Client closed request");
            self.logger.log(record);
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<EdgeState>,
    conn: Arc<ConnectionInfo>,
) -> Result<ProxyResponse, hyper::Error> {
    let mut access = AccessGuard::new(&req, &conn, Arc::clone(&state.access_log));
    let response = route_request(req, &state, &conn, &mut access).await;
    access.finish(response.status());
    Ok(response)
}

async fn route_request(
    mut req: Request<Incoming>,
    state: &EdgeState,
    conn: &ConnectionInfo,
    access: &mut AccessGuard,
) -> ProxyResponse {
    // ACME HTTP-01 challenges come before any redirect
    if !conn.is_tls {
        if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
            if let Some(key_auth) = state.challenges.http01(token) {
                debug!(token, "Responding to ACME HTTP-01 challenge");
                return text_response(StatusCode::OK, key_auth);
            }
        }
    }

    let Some(host) = extract_host(&req) else {
        return json_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        );
    };

    if let Some(port) = conn.redirect_port {
        return redirect_response(&build_location("https", &host, Some(port), &req), true);
    }

    let table = state.routes.load();
    let path = req.uri().path().to_string();
    let Some(route) = table.find(&conn.entrypoint, conn.is_tls, &host, &path) else {
        debug!(host = %host, path = %path, entrypoint = %conn.entrypoint, "No route");
        return json_error_response(ProxyErrorCode::NoRoute, "No route matches this request");
    };
    access.route(route);

    for middleware in &route.middlewares {
        match &middleware.spec {
            MiddlewareSpec::RedirectScheme { scheme, permanent } => {
                let current = if conn.is_tls { "https" } else { "http" };
                if !scheme.eq_ignore_ascii_case(current) {
                    let location = build_location(&scheme.to_ascii_lowercase(), &host, None, &req);
                    return redirect_response(&location, *permanent);
                }
            }
            MiddlewareSpec::StripPrefix { prefixes } => {
                if let Some((stripped, prefix)) = strip_path_prefix(req.uri().path(), prefixes) {
                    if let Err(e) = replace_path(&mut req, &stripped) {
                        error!(route = %route.name, error = %e, "Failed to rewrite path");
                        return json_error_response(ProxyErrorCode::InternalError, "Internal proxy error");
                    }
                    if let Ok(value) = HeaderValue::from_str(&prefix) {
                        req.headers_mut().insert(X_FORWARDED_PREFIX, value);
                    }
                }
            }
        }
    }

    let Some(backend) = route.pool.next() else {
        warn!(route = %route.name, backends = route.pool.len(), "No healthy backend");
        return json_error_response(
            ProxyErrorCode::NoHealthyBackend,
            "No healthy backend available",
        );
    };
    access.backend(backend.address);

    let request_id = set_forwarding_headers(&mut req, conn, &host);

    debug!(
        host = %host,
        method = %req.method(),
        uri = %req.uri(),
        route = %route.name,
        backend = %backend.address,
        request_id,
        "Forwarding request"
    );

    if is_upgrade_request(&req) {
        return handle_upgrade(req, state, &backend.id, backend.address, request_id).await;
    }

    let result = tokio::time::timeout(
        state.request_timeout,
        state.pool.send_request(req, backend.address),
    )
    .await;

    match result {
        Ok(Ok(mut response)) => {
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }
            response
        }
        Ok(Err(e)) => {
            if e.is_connect() {
                report_unreachable(state, &backend.id, backend.address, &e.to_string());
            } else {
                error!(backend = %backend.address, error = %e, "Failed to forward request");
            }
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
        }
        Err(_) => {
            warn!(
                backend = %backend.address,
                route = %route.name,
                timeout_secs = state.request_timeout.as_secs(),
                "Request timed out"
            );
            json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    state.request_timeout.as_secs()
                ),
            )
        }
    }
}

/// Tell the registry a backend refused connections
fn report_unreachable(state: &EdgeState, id: &str, address: SocketAddr, reason: &str) {
    warn!(backend = %id, address = %address, error = %reason, "Backend unreachable");
    let event = DiscoveryEvent::Health {
        id: id.to_string(),
        health: BackendHealth::Unhealthy,
    };
    if state.registry_tx.try_send(event).is_err() {
        debug!(backend = %id, "Registry busy, health report dropped");
    }
}

/// Overwrite the forwarding headers; returns the request id
fn set_forwarding_headers<B>(req: &mut Request<B>, conn: &ConnectionInfo, host: &str) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let original_host = req
        .headers()
        .get(hyper::header::HOST)
        .cloned()
        .or_else(|| {
            req.uri()
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    // This proxy is the first trusted hop: client-provided values are replaced
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&conn.client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    let forwarded_host = original_host.or_else(|| HeaderValue::from_str(host).ok());
    if let Some(value) = forwarded_host {
        headers.insert(X_FORWARDED_HOST, value.clone());
        // HTTP/2 requests carry the host in the authority only
        headers.entry(hyper::header::HOST).or_insert(value);
    }
    let proto = if conn.is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    request_id
}

/// Host from the Host header, else from an absolute URI; normalized
fn extract_host<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))?;

    // alphanumeric, hyphen, dot, and port/IPv6 punctuation only
    if !raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'))
    {
        return None;
    }

    let host = normalize_host(&raw);
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    Some(host)
}

/// Remove the first matching prefix at a segment boundary
fn strip_path_prefix(path: &str, prefixes: &[String]) -> Option<(String, String)> {
    prefixes.iter().find_map(|prefix| {
        let trimmed = prefix.trim_end_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        let rest = path.strip_prefix(trimmed)?;
        if !(rest.is_empty() || rest.starts_with('/')) {
            return None;
        }
        let stripped = if rest.is_empty() { "/".to_string() } else { rest.to_string() };
        Some((stripped, trimmed.to_string()))
    })
}

fn replace_path<B>(req: &mut Request<B>, path: &str) -> anyhow::Result<()> {
    let path_and_query = match req.uri().query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    };
    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query)?);
    *req.uri_mut() = Uri::from_parts(parts)?;
    Ok(())
}

fn build_location<B>(scheme: &str, host: &str, port: Option<u16>, req: &Request<B>) -> String {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };
    match port {
        Some(443) | None if scheme == "https" => format!("https://{}{}", host, path),
        Some(80) | None if scheme == "http" => format!("http://{}{}", host, path),
        Some(port) => format!("{}://{}:{}{}", scheme, host, port, path),
        None => format!("{}://{}{}", scheme, host, path),
    }
}

fn redirect_response(location: &str, permanent: bool) -> ProxyResponse {
    let status = if permanent {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::FOUND
    };
    let mut response = text_response(status, "Redirecting".to_string());
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(hyper::header::LOCATION, value);
    }
    response
}

fn text_response(status: StatusCode, body: String) -> ProxyResponse {
    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

fn empty_response(status: StatusCode) -> ProxyResponse {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

/// Check if a request asks for a protocol upgrade
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 upgrade request for the backend
fn build_upgrade_request<B>(req: &Request<B>) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str("\r\n");
    request.into_bytes()
}

/// Status line and headers of the backend's answer to an upgrade
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

async fn handle_upgrade(
    req: Request<Incoming>,
    state: &EdgeState,
    backend_id: &str,
    address: SocketAddr,
    request_id: String,
) -> ProxyResponse {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(backend = %address, request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req);

    let connect = TcpStream::connect(address);
    let mut backend_stream = match tokio::time::timeout(state.request_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            report_unreachable(state, backend_id, address, &e.to_string());
            return json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            );
        }
        Err(_) => return upgrade_timeout(address, state.request_timeout),
    };

    let exchange = async {
        backend_stream.write_all(&raw_request).await?;
        read_response_head(&mut backend_stream).await
    };
    let (head, early) = match tokio::time::timeout(state.request_timeout, exchange).await {
        Ok(Ok(read)) => read,
        Ok(Err(e)) => {
            error!(backend = %address, error = %e, "Upgrade exchange with backend failed");
            return json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to read backend response");
        }
        Err(_) => return upgrade_timeout(address, state.request_timeout),
    };

    let Some((status, response_headers)) = parse_upgrade_response(&head) else {
        error!(backend = %address, "Failed to parse backend upgrade response");
        return json_error_response(ProxyErrorCode::ConnectionFailed, "Invalid upgrade response from backend");
    };

    let mut response = empty_response(status);
    for (name, value) in &response_headers {
        let name_lower = name.to_lowercase();
        if name_lower == "content-length" || name_lower == "transfer-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(backend = %address, status = %status, "Backend rejected upgrade request");
        return response;
    }

    info!(backend = %address, request_id, upgrade_type, "Upgrade established");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => tunnel(upgraded, backend_stream, early, address, &request_id).await,
            Err(e) => error!(backend = %address, error = %e, "Failed to upgrade client connection"),
        }
    });

    response
}

fn upgrade_timeout(address: SocketAddr, timeout: Duration) -> ProxyResponse {
    warn!(backend = %address, timeout_secs = timeout.as_secs(), "Upgrade request timed out");
    json_error_response(ProxyErrorCode::RequestTimeout, "Backend did not answer the upgrade in time")
}

/// End offset of the `\r\n\r\n` that closes a response head
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Read a response head, returning it and any bytes that followed it
async fn read_response_head<S>(stream: &mut S) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed connection before responding to upgrade",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Copy bytes both ways until either side closes. `early` is what the
/// backend sent right behind its 101 and goes to the client first.
async fn tunnel(
    client: Upgraded,
    mut backend: TcpStream,
    early: Vec<u8>,
    address: SocketAddr,
    request_id: &str,
) {
    let mut client_io = TokioIo::new(client);
    if !early.is_empty() {
        if let Err(e) = client_io.write_all(&early).await {
            debug!(backend = %address, request_id, error = %e, "Client went away during upgrade");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                backend = %address,
                request_id,
                client_to_backend,
                backend_to_client,
                "Upgraded connection closed"
            );
        }
        Err(e) => {
            debug!(backend = %address, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}
