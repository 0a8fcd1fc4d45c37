//! Integration tests for Tidegate

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Datelike;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tidegate::access_log::{AccessLogger, LogTarget};
use tidegate::acme::{
    AuthorityError, CertificateAuthority, ChallengeStore, IssuanceProgress, IssuedCertificate,
};
use tidegate::certmanager::{CertManager, CertManagerOptions, CertificateState};
use tidegate::certstore::CertStore;
use tidegate::config::{
    AccessLogConfig, AccessLogFormat, EntryPointConfig, HealthCheckConfig, RegistryConfig,
};
use tidegate::healthcheck::HealthChecker;
use tidegate::pool::{ConnectionPool, PoolConfig};
use tidegate::proxy::{EdgeServer, EdgeState};
use tidegate::registry::{Backend, BackendHealth, BackendRegistry, DiscoveryEvent};
use tidegate::routing::{CompileOptions, RouteCompiler, SharedRoutes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsConnector;

/// Wait for a port to become available (server listening)
async fn wait_for_port(addr: SocketAddr, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Write a GET with the given Host and read the whole response
async fn send_get<S>(mut stream: S, path: &str, host: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    // a TLS peer may close without close_notify; keep what arrived
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

/// Send HTTP request with custom Host header (for proxy testing)
async fn http_get_with_host(addr: SocketAddr, path: &str, host: &str) -> String {
    let stream = TcpStream::connect(addr).await.unwrap();
    send_get(stream, path, host).await
}

fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split("\r\n\r\n").next()?;
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim())
    })
}

fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Start a backend that answers `<name> <path> prefix=<X-Forwarded-Prefix>`
async fn start_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve_backend(listener, name)
}

fn serve_backend(listener: TcpListener, name: &'static str) -> SocketAddr {
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let prefix = req
                        .headers()
                        .get("x-forwarded-prefix")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let body = format!("{} {} prefix={}", name, req.uri().path(), prefix);
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// An address nothing listens on
async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A port that was free a moment ago, for entry points whose port must be known up front
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn backend(id: &str, addr: SocketAddr, labels: &[(&str, &str)]) -> Backend {
    Backend::new(id, id, "static", addr).with_labels(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .chain([("traefik.enable".to_string(), "true".to_string())]),
    )
}

struct EdgeSetup {
    entrypoints: BTreeMap<String, EntryPointConfig>,
    certs: Option<Arc<CertManager>>,
    challenges: ChallengeStore,
    access_log: Arc<AccessLogger>,
    debounce_ms: u64,
    request_timeout: Duration,
    health_check: Option<HealthCheckConfig>,
}

impl EdgeSetup {
    fn plain() -> Self {
        Self {
            entrypoints: BTreeMap::from([(
                "web".to_string(),
                EntryPointConfig::plain("127.0.0.1:0"),
            )]),
            certs: None,
            challenges: ChallengeStore::new(),
            access_log: AccessLogger::disabled(),
            debounce_ms: 20,
            request_timeout: Duration::from_secs(5),
            health_check: None,
        }
    }
}

struct TestEdge {
    addrs: HashMap<String, SocketAddr>,
    routes: SharedRoutes,
    registry: Arc<BackendRegistry>,
    shutdown_tx: watch::Sender<bool>,
}

impl TestEdge {
    fn addr(&self, entrypoint: &str) -> SocketAddr {
        self.addrs[entrypoint]
    }

    async fn publish(&self, backends: Vec<Backend>) {
        self.registry
            .sender()
            .send(DiscoveryEvent::Snapshot {
                provider: "static".to_string(),
                backends,
            })
            .await
            .unwrap();
    }

    async fn wait_for_generation(&self, generation: u64) {
        for _ in 0..200 {
            if self.routes.generation() >= generation {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "routing table stuck at generation {}, wanted {}",
            self.routes.generation(),
            generation
        );
    }
}

impl Drop for TestEdge {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn start_edge(setup: EdgeSetup) -> TestEdge {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry_config = RegistryConfig {
        debounce_ms: setup.debounce_ms,
        ..RegistryConfig::default()
    };
    let (registry, _) = BackendRegistry::spawn(&registry_config, shutdown_rx.clone());

    let options = CompileOptions {
        label_prefix: "traefik".to_string(),
        exposed_by_default: false,
        default_rule_domain: None,
        entrypoints: setup
            .entrypoints
            .iter()
            .map(|(name, ep)| (name.clone(), ep.tls))
            .collect(),
    };
    let routes = SharedRoutes::new();
    RouteCompiler::new(
        options,
        routes.clone(),
        registry.watch_backends(),
        setup.certs.clone(),
    )
    .spawn(shutdown_rx.clone());

    if let Some(health_check) = setup.health_check {
        let checker = HealthChecker::new(health_check, registry.watch_backends(), registry.sender());
        tokio::spawn(checker.run(shutdown_rx.clone()));
    }

    let state = EdgeState {
        routes: routes.clone(),
        pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
        access_log: setup.access_log,
        challenges: setup.challenges,
        registry_tx: registry.sender(),
        certs: setup.certs,
        request_timeout: setup.request_timeout,
    };
    let edge = EdgeServer::bind(&setup.entrypoints, state).await.unwrap();
    let addrs: HashMap<String, SocketAddr> = setup
        .entrypoints
        .keys()
        .map(|name| (name.clone(), edge.local_addr(name).unwrap()))
        .collect();
    edge.spawn(shutdown_rx);

    for addr in addrs.values() {
        assert!(wait_for_port(*addr, Duration::from_secs(5)).await);
    }

    TestEdge {
        addrs,
        routes,
        registry,
        shutdown_tx,
    }
}

#[tokio::test]
async fn test_routes_by_host_and_rejects_unknown_host() {
    let app = start_backend("app").await;
    let edge = start_edge(EdgeSetup::plain()).await;
    edge.publish(vec![backend(
        "app-1",
        app,
        &[("traefik.http.routers.app.rule", "Host(`app.example.com`)")],
    )])
    .await;
    edge.wait_for_generation(1).await;

    let response = http_get_with_host(edge.addr("web"), "/hello", "app.example.com").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(body_of(&response), "app /hello prefix=-");
    assert!(header_of(&response, "x-request-id").is_some());

    let response = http_get_with_host(edge.addr("web"), "/hello", "other.example.com").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("NO_ROUTE"));
}

#[tokio::test]
async fn test_unhealthy_backend_receives_no_traffic() {
    let alpha = start_backend("alpha").await;
    let beta = start_backend("beta").await;
    let labels = [("traefik.http.routers.app.rule", "Host(`app.example.com`)")];

    let edge = start_edge(EdgeSetup::plain()).await;
    edge.publish(vec![
        backend("alpha", alpha, &labels).with_health(BackendHealth::Healthy),
        backend("beta", beta, &labels).with_health(BackendHealth::Unhealthy),
    ])
    .await;
    edge.wait_for_generation(1).await;

    for _ in 0..100 {
        let response = http_get_with_host(edge.addr("web"), "/", "app.example.com").await;
        assert_eq!(status_of(&response), 200);
        assert!(body_of(&response).starts_with("alpha "), "{}", response);
    }
}

#[tokio::test]
async fn test_round_robin_across_healthy_backends() {
    let alpha = start_backend("alpha").await;
    let beta = start_backend("beta").await;
    let labels = [("traefik.http.routers.app.rule", "Host(`app.example.com`)")];

    let edge = start_edge(EdgeSetup::plain()).await;
    edge.publish(vec![backend("alpha", alpha, &labels), backend("beta", beta, &labels)])
        .await;
    edge.wait_for_generation(1).await;

    let mut seen = HashMap::new();
    for _ in 0..10 {
        let response = http_get_with_host(edge.addr("web"), "/", "app.example.com").await;
        let name = body_of(&response).split(' ').next().unwrap_or("").to_string();
        *seen.entry(name).or_insert(0) += 1;
    }
    assert_eq!(seen.get("alpha"), Some(&5));
    assert_eq!(seen.get("beta"), Some(&5));
}

#[tokio::test]
async fn test_unreachable_backend_is_marked_unhealthy() {
    let dead = dead_address().await;
    let edge = start_edge(EdgeSetup::plain()).await;
    edge.publish(vec![backend(
        "gone",
        dead,
        &[("traefik.http.routers.gone.rule", "Host(`gone.example.com`)")],
    )])
    .await;
    edge.wait_for_generation(1).await;

    let response = http_get_with_host(edge.addr("web"), "/", "gone.example.com").await;
    assert_eq!(status_of(&response), 502);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("CONNECTION_FAILED"));

    edge.wait_for_generation(2).await;
    assert_eq!(
        edge.registry.backends()["gone"].health,
        BackendHealth::Unhealthy
    );
    let response = http_get_with_host(edge.addr("web"), "/", "gone.example.com").await;
    assert_eq!(status_of(&response), 503);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("NO_HEALTHY_BACKEND"));
}

#[tokio::test]
async fn test_unreachable_backend_recovers_without_active_checks() {
    let port = free_port();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let edge = start_edge(EdgeSetup {
        health_check: Some(HealthCheckConfig {
            enabled: false,
            interval_secs: 1,
            timeout_ms: 200,
            success_threshold: 1,
            ..HealthCheckConfig::default()
        }),
        ..EdgeSetup::plain()
    })
    .await;
    edge.publish(vec![backend(
        "flaky",
        addr,
        &[("traefik.http.routers.flaky.rule", "Host(`flaky.example.com`)")],
    )])
    .await;
    edge.wait_for_generation(1).await;

    let response = http_get_with_host(edge.addr("web"), "/", "flaky.example.com").await;
    assert_eq!(status_of(&response), 502);
    edge.wait_for_generation(2).await;
    let response = http_get_with_host(edge.addr("web"), "/", "flaky.example.com").await;
    assert_eq!(status_of(&response), 503);

    // the backend comes back on the same address
    serve_backend(TcpListener::bind(addr).await.unwrap(), "flaky");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while edge.registry.backends()["flaky"].health != BackendHealth::Healthy {
        assert!(std::time::Instant::now() < deadline, "backend never recovered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    edge.wait_for_generation(3).await;

    let response = http_get_with_host(edge.addr("web"), "/", "flaky.example.com").await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "flaky / prefix=-");
}

#[tokio::test]
async fn test_add_then_remove_within_debounce_window_changes_nothing() {
    let app = start_backend("app").await;
    let edge = start_edge(EdgeSetup {
        debounce_ms: 200,
        ..EdgeSetup::plain()
    })
    .await;
    let flapping = backend(
        "flap",
        app,
        &[("traefik.http.routers.flap.rule", "Host(`flap.example.com`)")],
    );

    let tx = edge.registry.sender();
    tx.send(DiscoveryEvent::Upsert(flapping.clone())).await.unwrap();
    tx.send(DiscoveryEvent::Remove {
        provider: "static".to_string(),
        id: "flap".to_string(),
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(edge.routes.generation(), 0);
    assert!(edge.registry.backends().is_empty());

    tx.send(DiscoveryEvent::Upsert(flapping)).await.unwrap();
    edge.wait_for_generation(1).await;
    let response = http_get_with_host(edge.addr("web"), "/", "flap.example.com").await;
    assert_eq!(status_of(&response), 200);
}

#[tokio::test]
async fn test_strip_prefix_middleware() {
    let api = start_backend("api").await;
    let edge = start_edge(EdgeSetup::plain()).await;
    edge.publish(vec![backend(
        "api-1",
        api,
        &[
            ("traefik.http.routers.api.rule", "Host(`example.com`) && PathPrefix(`/api`)"),
            ("traefik.http.routers.api.middlewares", "api-strip"),
            ("traefik.http.middlewares.api-strip.stripprefix.prefixes", "/api"),
        ],
    )])
    .await;
    edge.wait_for_generation(1).await;

    let response = http_get_with_host(edge.addr("web"), "/api/users", "example.com").await;
    assert_eq!(body_of(&response), "api /users prefix=/api");

    let response = http_get_with_host(edge.addr("web"), "/apikeys", "example.com").await;
    assert_eq!(status_of(&response), 404);
}

#[tokio::test]
async fn test_entrypoint_redirect_and_http01_challenge() {
    let secure_port = free_port();
    let challenges = ChallengeStore::new();
    challenges.set_http01("token-123", "token-123.thumbprint");

    let dir = tempfile::tempdir().unwrap();
    let certs = manager(&dir, None, CertManagerOptions::default());

    let mut web = EntryPointConfig::plain("127.0.0.1:0");
    web.redirect_to = Some("websecure".to_string());
    let edge = start_edge(EdgeSetup {
        entrypoints: BTreeMap::from([
            ("web".to_string(), web),
            (
                "websecure".to_string(),
                EntryPointConfig::tls(&format!("127.0.0.1:{}", secure_port)),
            ),
        ]),
        certs: Some(certs),
        challenges,
        ..EdgeSetup::plain()
    })
    .await;

    let response = http_get_with_host(edge.addr("web"), "/login?next=/", "app.example.com").await;
    assert_eq!(status_of(&response), 301);
    assert_eq!(
        header_of(&response, "location"),
        Some(format!("https://app.example.com:{}/login?next=/", secure_port).as_str())
    );

    let response = http_get_with_host(
        edge.addr("web"),
        "/.well-known/acme-challenge/token-123",
        "app.example.com",
    )
    .await;
    assert_eq!(status_of(&response), 200);
    assert_eq!(body_of(&response), "token-123.thumbprint");
}

#[tokio::test]
async fn test_access_log_records_requests() {
    let app = start_backend("app").await;
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("access.log");
    let config = AccessLogConfig {
        path: Some(log_path.to_string_lossy().into_owned()),
        format: AccessLogFormat::Json,
        ..AccessLogConfig::default()
    };
    let access_log = AccessLogger::new(&config);

    let edge = start_edge(EdgeSetup {
        access_log: Arc::clone(&access_log),
        ..EdgeSetup::plain()
    })
    .await;
    access_log.spawn_writer(
        LogTarget::from_config(&config),
        config.format,
        Duration::from_millis(50),
        edge.shutdown_tx.subscribe(),
    );
    edge.publish(vec![backend(
        "app-1",
        app,
        &[("traefik.http.routers.app.rule", "Host(`app.example.com`)")],
    )])
    .await;
    edge.wait_for_generation(1).await;

    http_get_with_host(edge.addr("web"), "/logged", "app.example.com").await;
    http_get_with_host(edge.addr("web"), "/", "nobody.example.com").await;

    let mut lines = Vec::new();
    for _ in 0..100 {
        let content = std::fs::read_to_string(&log_path).unwrap_or_default();
        lines = content.lines().map(str::to_string).collect::<Vec<_>>();
        if lines.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(lines.len(), 2, "{:?}", lines);

    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(first["path"], "/logged");
    assert_eq!(first["status"], 200);
    assert_eq!(first["router"], "app");
    assert_eq!(first["backend"], app.to_string());
    assert_eq!(first["entrypoint"], "web");

    let second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    assert_eq!(second["status"], 404);
    assert!(second["router"].is_null());
}

/// Authority that signs locally after a delay and remembers what it issued
struct SlowAuthority {
    delay: Duration,
    calls: AtomicU32,
    issued: Mutex<Option<String>>,
}

impl SlowAuthority {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicU32::new(0),
            issued: Mutex::new(None),
        }
    }

    fn issued_leaf(&self) -> Vec<u8> {
        let pem = self.issued.lock().clone().unwrap();
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        der.as_ref().to_vec()
    }
}

#[async_trait]
impl CertificateAuthority for SlowAuthority {
    fn name(&self) -> &str {
        "slow"
    }

    async fn issue(
        &self,
        hostname: &str,
        progress: &IssuanceProgress,
    ) -> Result<IssuedCertificate, AuthorityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.validating();
        tokio::time::sleep(self.delay).await;

        let until = chrono::Utc::now() + chrono::Duration::days(90);
        let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()]).unwrap();
        params.not_after =
            rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();

        *self.issued.lock() = Some(cert.pem());
        Ok(IssuedCertificate {
            certificate: cert.pem(),
            private_key: key.serialize_pem(),
        })
    }
}

fn manager(
    dir: &tempfile::TempDir,
    authority: Option<Arc<SlowAuthority>>,
    options: CertManagerOptions,
) -> Arc<CertManager> {
    let store = CertStore::new(dir.path().join("certificates.json").to_str().unwrap()).unwrap();
    CertManager::new(
        options,
        store,
        authority.map(|a| a as Arc<dyn CertificateAuthority>),
        ChallengeStore::new(),
    )
    .unwrap()
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn tls_connector() -> TlsConnector {
    let mut config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(config))
}

/// Handshake with `sni`, fetch `/` and return the leaf certificate and the response
async fn https_get(addr: SocketAddr, sni: &str) -> (Vec<u8>, String) {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from(sni.to_string()).unwrap();
    let stream = tls_connector().connect(name, tcp).await.unwrap();
    let leaf = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|c| c.as_ref().to_vec())
        .unwrap();
    (leaf, send_get(stream, "/", sni).await)
}

#[tokio::test]
async fn test_tls_placeholder_then_issued_certificate() {
    let app = start_backend("secure").await;
    let dir = tempfile::tempdir().unwrap();
    let authority = Arc::new(SlowAuthority::new(Duration::from_millis(800)));
    let certs = manager(
        &dir,
        Some(Arc::clone(&authority)),
        CertManagerOptions {
            handshake_timeout: Duration::from_millis(100),
            ..CertManagerOptions::default()
        },
    );

    let edge = start_edge(EdgeSetup {
        entrypoints: BTreeMap::from([(
            "websecure".to_string(),
            EntryPointConfig::tls("127.0.0.1:0"),
        )]),
        certs: Some(Arc::clone(&certs)),
        ..EdgeSetup::plain()
    })
    .await;
    edge.publish(vec![backend(
        "secure-1",
        app,
        &[
            ("traefik.http.routers.secure.rule", "Host(`secure.example.com`)"),
            ("traefik.http.routers.secure.entrypoints", "websecure"),
            ("traefik.http.routers.secure.tls", "true"),
            ("traefik.http.routers.secure.tls.certresolver", "default"),
        ],
    )])
    .await;
    edge.wait_for_generation(1).await;

    // issuance is still running, so the handshake falls back to the placeholder
    let (first_leaf, response) = https_get(edge.addr("websecure"), "secure.example.com").await;
    assert_eq!(status_of(&response), 200, "{}", response);
    assert_eq!(body_of(&response), "secure / prefix=-");

    for _ in 0..300 {
        if certs.certificate_state("secure.example.com") == CertificateState::Issued {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        certs.certificate_state("secure.example.com"),
        CertificateState::Issued
    );

    let issued = authority.issued_leaf();
    assert_ne!(first_leaf, issued);

    let (second_leaf, response) = https_get(edge.addr("websecure"), "secure.example.com").await;
    assert_eq!(second_leaf, issued);
    assert_eq!(status_of(&response), 200);
    assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

    // persisted for the next start
    let stored = CertStore::new(dir.path().join("certificates.json").to_str().unwrap())
        .unwrap()
        .load()
        .unwrap();
    assert!(stored.contains_key("secure.example.com"));
}

/// Raw upgrade request through the edge
async fn send_upgrade(addr: SocketAddr, host: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /socket HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        host
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

/// Read until `needle` shows up or the connection ends
async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !String::from_utf8_lossy(&received).contains(needle) {
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => received.extend_from_slice(&chunk[..n]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&received).into_owned()
}

#[tokio::test]
async fn test_upgrade_forwards_bytes_sent_with_the_101() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let socket_backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut chunk = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            head.extend_from_slice(&chunk[..n]);
        }
        // the first frame goes out in the same write as the response head
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nHELLO")
            .await
            .unwrap();
        // then echo
        loop {
            match stream.read(&mut chunk).await {
                Ok(n) if n > 0 => {
                    if stream.write_all(&chunk[..n]).await.is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let edge = start_edge(EdgeSetup::plain()).await;
    edge.publish(vec![backend(
        "ws",
        socket_backend,
        &[("traefik.http.routers.ws.rule", "Host(`ws.example.com`)")],
    )])
    .await;
    edge.wait_for_generation(1).await;

    let mut client = send_upgrade(edge.addr("web"), "ws.example.com").await;
    let received = read_until(&mut client, "HELLO").await;
    assert!(received.starts_with("HTTP/1.1 101"), "{}", received);
    assert!(received.ends_with("\r\n\r\nHELLO"), "{:?}", received);

    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_until(&mut client, "ping").await, "ping");
}

#[tokio::test]
async fn test_upgrade_times_out_on_silent_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let edge = start_edge(EdgeSetup {
        request_timeout: Duration::from_millis(300),
        ..EdgeSetup::plain()
    })
    .await;
    edge.publish(vec![backend(
        "silent",
        silent,
        &[("traefik.http.routers.silent.rule", "Host(`silent.example.com`)")],
    )])
    .await;
    edge.wait_for_generation(1).await;

    let started = std::time::Instant::now();
    let mut client = send_upgrade(edge.addr("web"), "silent.example.com").await;
    let response = read_until(&mut client, "}").await;
    assert_eq!(status_of(&response), 504, "{}", response);
    assert_eq!(header_of(&response, "x-proxy-error"), Some("REQUEST_TIMEOUT"));
    assert!(started.elapsed() < Duration::from_secs(3));
}
