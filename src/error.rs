//! Error taxonomy and plain-text error responses for the gateway

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors raised by the mapping store.
///
/// `StorageInit` and `StorageUnavailable` are fatal to the worker; the
/// supervisor respawns it. `HotReplaceFailed` leaves the worker serving
/// from the original database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open mapping store: {0}")]
    StorageInit(#[source] anyhow::Error),
    #[error("mapping store unavailable: {0}")]
    StorageUnavailable(#[source] anyhow::Error),
    #[error("hot replace failed, still serving original database: {0}")]
    HotReplaceFailed(#[source] anyhow::Error),
    #[error(transparent)]
    Query(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether the worker can keep serving after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::StorageInit(_) | StoreError::StorageUnavailable(_)
        )
    }
}

/// Errors raised by certificate loading and generation.
///
/// Never fatal: every path degrades to a self-signed certificate so TLS
/// handshakes still complete.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate load failure: {0}")]
    Load(#[source] anyhow::Error),
    #[error("ACME failure for {host}: {source}")]
    Acme {
        host: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Client-visible error codes for the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    /// Request carried no usable Host header
    BadHost,
    /// No mapping matched the host and path
    RouteNotFound,
    /// ACME challenge token unknown in memory and on disk
    ChallengeNotFound,
    /// Upstream refused the connection or died mid-exchange
    UpstreamUnavailable,
    /// Upstream connect or exchange exceeded the proxy timeout
    UpstreamTimeout,
    /// Handler-internal failure
    InternalError,
}

impl GatewayErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayErrorKind::BadHost => StatusCode::BAD_REQUEST,
            GatewayErrorKind::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorKind::ChallengeNotFound => StatusCode::NOT_FOUND,
            GatewayErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayErrorKind::UpstreamTimeout => StatusCode::BAD_GATEWAY,
            GatewayErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Fixed response body. These strings are part of the wire contract.
    pub fn body(&self) -> &'static str {
        match self {
            GatewayErrorKind::BadHost => "Missing Host header",
            GatewayErrorKind::RouteNotFound => "Not Found",
            GatewayErrorKind::ChallengeNotFound => "Challenge not found",
            GatewayErrorKind::UpstreamUnavailable => "Bad Gateway",
            GatewayErrorKind::UpstreamTimeout => "Bad Gateway",
            GatewayErrorKind::InternalError => "Internal Server Error",
        }
    }
}

/// Build a plain-text response with the given status and body.
pub fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

/// Build the canonical error response for a gateway error kind.
pub fn error_response(kind: GatewayErrorKind) -> Response<BoxBody<Bytes, hyper::Error>> {
    text_response(kind.status(), kind.body())
}
