//! Error responses produced by the edge listener itself
//!
//! Every error the proxy answers on its own is a small JSON body plus an
//! `X-Proxy-Error` header carrying the machine-readable code, so clients and
//! the access log can tell proxy failures from backend ones.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;

pub const X_PROXY_ERROR: &str = "x-proxy-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route matches host and path
    NoRoute,
    /// The matched route has no routable backend
    NoHealthyBackend,
    /// Neither a Host header nor an absolute URI
    MissingHostHeader,
    /// Backend did not answer within the request timeout
    RequestTimeout,
    ConnectionFailed,
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(self) -> StatusCode {
        match self {
            ProxyErrorCode::NoRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `X-Proxy-Error` header; same spelling as the JSON `code`
    pub fn as_header_value(self) -> &'static str {
        match self {
            ProxyErrorCode::NoRoute => "NO_ROUTE",
            ProxyErrorCode::NoHealthyBackend => "NO_HEALTHY_BACKEND",
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: ProxyErrorCode,
    message: &'a str,
    status: u16,
}

fn error_body(code: ProxyErrorCode, message: &str) -> Bytes {
    let body = ErrorBody {
        code,
        message,
        status: code.status_code().as_u16(),
    };
    match serde_json::to_vec(&body) {
        Ok(json) => Bytes::from(json),
        Err(_) => Bytes::from_static(b"{}"),
    }
}

/// JSON error response with the `X-Proxy-Error` header set
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl AsRef<str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(error_body(code, message.as_ref()))
        .map_err(|never| match never {})
        .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_PROXY_ERROR, HeaderValue::from_static(code.as_header_value()));
    response
}
