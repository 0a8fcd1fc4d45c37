//! Read-only status API
//!
//! `GET /ping`, `/api/routes`, `/api/backends`, `/api/certificates` and
//! `/api/status`, all JSON except `/ping`.

use crate::access_log::AccessLogger;
use crate::certmanager::CertManager;
use crate::pool::PoolStats;
use crate::registry::BackendSet;
use crate::routing::{Route, SharedRoutes};
use anyhow::Context;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response(value: serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = response(StatusCode::OK, value.to_string());
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

/// What the status API reports on
#[derive(Clone)]
pub struct StatusState {
    pub routes: SharedRoutes,
    pub backends_rx: watch::Receiver<Arc<BackendSet>>,
    pub degraded_rx: watch::Receiver<bool>,
    pub certs: Option<Arc<CertManager>>,
    pub access_log: Arc<AccessLogger>,
    pub pool_stats: Arc<PoolStats>,
}

/// Status API listener
pub struct StatusServer {
    listener: TcpListener,
    state: Arc<StatusState>,
}

impl StatusServer {
    pub async fn bind(addr: SocketAddr, state: StatusState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind status API on {}", addr))?;
        info!(addr = %listener.local_addr()?, "Status API listening");
        Ok(Self {
            listener,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let state = Arc::clone(&state);
                                    async move {
                                        Ok::<_, hyper::Error>(handle_status_request(req.method(), req.uri().path(), &state))
                                    }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Status API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept status API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Status API shutting down");
                        break;
                    }
                }
            }
        }
    }
}

fn route_json(route: &Route) -> serde_json::Value {
    serde_json::json!({
        "name": route.name,
        "rule": route.rule.to_string(),
        "entrypoints": route.entrypoints,
        "tls": route.tls,
        "cert_resolver": route.cert_resolver,
        "priority": route.priority,
        "middlewares": route.middlewares,
        "backends": route.pool.members(),
        "healthy": route.pool.healthy_count(),
    })
}

fn handle_status_request(method: &Method, path: &str, state: &StatusState) -> Response<Full<Bytes>> {
    debug!(%method, %path, "Status API request");

    if method != Method::GET {
        return response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    match path {
        "/ping" => response(StatusCode::OK, "OK"),

        "/api/routes" => {
            let table = state.routes.load();
            let routes: Vec<serde_json::Value> = table.routes.iter().map(route_json).collect();
            json_response(serde_json::json!({
                "generation": table.generation,
                "routes": routes,
                "conflicts": table.conflicts,
            }))
        }

        "/api/backends" => {
            let backends = Arc::clone(&state.backends_rx.borrow());
            let list: Vec<_> = backends.values().collect();
            json_response(serde_json::json!({
                "backends": list,
                "count": list.len(),
            }))
        }

        "/api/certificates" => {
            let certificates = state
                .certs
                .as_ref()
                .map(|c| c.statuses())
                .unwrap_or_default();
            json_response(serde_json::json!({ "certificates": certificates }))
        }

        "/api/status" => json_response(serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
            "generation": state.routes.generation(),
            "degraded": *state.degraded_rx.borrow(),
            "backends": state.backends_rx.borrow().len(),
            "access_log_dropped": state.access_log.dropped(),
            "requests_forwarded": state.pool_stats.get_total_requests(),
            "backend_connect_failures": state.pool_stats.get_connect_failures(),
        })),

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
