//! HTTP/WS forwarding
//!
//! Both listeners share one request handler. Each request runs the same
//! short-circuit sequence: health probe, ACME challenge answer, Host
//! validation, route lookup, then either a streamed HTTP exchange or an
//! upgrade splice. Bodies are never buffered whole; the inbound body
//! streams to the upstream and the upstream body streams back.

use crate::acme::AcmeBroker;
use crate::db::{Mapping, MappingStore};
use crate::error::{error_response, text_response, GatewayErrorKind};
use crate::rewrite::{rewrite_path, target_url};
use crate::tls::TlsGate;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
const HEALTH_PATH: &str = "/health";

/// Upstream connect timeout and exchange timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// DNS caps hostnames at 253 octets.
const MAX_HOSTNAME_LEN: usize = 253;

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Shared state behind both listeners.
pub struct Gateway {
    store: Arc<MappingStore>,
    broker: Arc<AcmeBroker>,
}

/// Where a request came in: which listener port, TLS or not.
#[derive(Clone, Copy)]
struct Inbound {
    peer: SocketAddr,
    port: u16,
    is_tls: bool,
}

impl Gateway {
    pub fn new(store: Arc<MappingStore>, broker: Arc<AcmeBroker>) -> Arc<Self> {
        Arc::new(Self { store, broker })
    }

    /// Serve plain HTTP on an already-bound listener.
    pub async fn run_plain(
        self: Arc<Self>,
        listener: TcpListener,
        port: u16,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(port, "HTTP listener running");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&self);
                            let inbound = Inbound { peer, port, is_tls: false };
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, gateway, inbound).await {
                                    debug!(peer = %inbound.peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(port, "HTTP listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Serve TLS on an already-bound listener, selecting certificates
    /// per handshake through the SNI gate.
    pub async fn run_tls(
        self: Arc<Self>,
        listener: TcpListener,
        gate: Arc<TlsGate>,
        port: u16,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!(port, "HTTPS listener running");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let gateway = Arc::clone(&self);
                            let gate = Arc::clone(&gate);
                            let inbound = Inbound { peer, port, is_tls: true };
                            tokio::spawn(async move {
                                match gate.accept(stream).await {
                                    Ok(tls_stream) => {
                                        if let Err(e) = serve_connection(tls_stream, gateway, inbound).await {
                                            debug!(peer = %inbound.peer, error = %e, "TLS connection error");
                                        }
                                    }
                                    Err(e) => {
                                        error!(peer = %inbound.peer, error = %e, "TLS handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(port, "HTTPS listener shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    gateway: Arc<Gateway>,
    inbound: Inbound,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { handle_request(req, gateway, inbound).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}

/// Catch-all boundary: no error escapes to kill the connection task.
async fn handle_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    inbound: Inbound,
) -> Result<ProxyResponse, hyper::Error> {
    match process_request(req, gateway, inbound).await {
        Ok(response) => Ok(response),
        Err(kind) => Ok(error_response(kind)),
    }
}

async fn process_request(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
    inbound: Inbound,
) -> Result<ProxyResponse, GatewayErrorKind> {
    let path = req.uri().path().to_string();

    // Health probe: answers on any host, before routing.
    if path == HEALTH_PATH && req.method() == Method::GET {
        return Ok(text_response(StatusCode::OK, "OK"));
    }

    // ACME validation requests answer from the token map or the shared
    // challenge directory, whichever worker published them.
    if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        return match gateway.broker.challenges().lookup(token) {
            Some(key_auth) => {
                debug!(token, "Answering ACME HTTP-01 challenge");
                Ok(text_response(StatusCode::OK, key_auth))
            }
            None => Err(GatewayErrorKind::ChallengeNotFound),
        };
    }

    let host = extract_hostname(&req).ok_or(GatewayErrorKind::BadHost)?;

    let mapping = gateway
        .store
        .find(&host, &path)
        .map_err(|e| {
            error!(host, error = %e, "Mapping lookup failed");
            GatewayErrorKind::InternalError
        })?
        .ok_or(GatewayErrorKind::RouteNotFound)?;

    debug!(
        host,
        method = %req.method(),
        path,
        back_port = mapping.back_port,
        "Routing request"
    );

    // On TLS traffic the handshake already has a usable certificate;
    // this detached call warms or renews it for next time.
    if inbound.is_tls {
        let broker = Arc::clone(&gateway.broker);
        let renew_host = host.clone();
        tokio::spawn(async move {
            let _ = broker.ensure(&renew_host, true).await;
        });
    }

    if is_upgrade_request(&req) {
        return handle_upgrade(req, &mapping, inbound).await;
    }

    proxy_exchange(req, &mapping, inbound).await
}

fn extract_hostname<T>(req: &Request<T>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }
            // Alphanumerics, hyphen and dot only: anything else is not a
            // DNS name and could end up in logs or file paths.
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }
            Some(hostname.to_ascii_lowercase())
        })
}

/// Upstream socket address for a mapping: loopback unless an external
/// backend base is configured.
fn upstream_host(mapping: &Mapping) -> String {
    match mapping.backend.as_deref() {
        Some(base) => url::Url::parse(base)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| "localhost".to_string()),
        None => "localhost".to_string(),
    }
}

/// Rewritten origin-form URI for the upstream request line. When the
/// mapping rewrites nothing the raw path passes through untouched.
fn upstream_uri(mapping: &Mapping, path: &str, query: Option<&str>) -> String {
    let target_path = if mapping.front_uri.is_empty() && mapping.back_uri.is_empty() {
        path.to_string()
    } else {
        rewrite_path(path, &mapping.front_uri, &mapping.back_uri)
    };
    match query {
        Some(q) => format!("{target_path}?{q}"),
        None => target_path,
    }
}

fn is_upgrade_request<T>(req: &Request<T>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(UPGRADE)
}

/// X-Forwarded-Proto is https when the leg into us was TLS, or when an
/// upstream proxy already said so.
fn forwarded_proto<T>(req: &Request<T>, is_tls: bool) -> &'static str {
    if is_tls {
        return "https";
    }
    let already_https = req
        .headers()
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    if already_https {
        "https"
    } else {
        "http"
    }
}

/// Append a value to a comma-separated header, standard proxy style.
fn append_header_value(existing: Option<&HeaderValue>, value: &str) -> Option<HeaderValue> {
    let combined = match existing.and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {value}"),
        _ => value.to_string(),
    };
    HeaderValue::from_str(&combined).ok()
}

async fn connect_upstream(host: &str, port: u16) -> Result<TcpStream, GatewayErrorKind> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            error!(host, port, error = %e, "Upstream connection failed");
            Err(GatewayErrorKind::UpstreamUnavailable)
        }
        Err(_) => {
            error!(host, port, "Upstream connection timed out");
            Err(GatewayErrorKind::UpstreamTimeout)
        }
    }
}

/// Forward one HTTP exchange, streaming the body both ways.
async fn proxy_exchange(
    req: Request<Incoming>,
    mapping: &Mapping,
    inbound: Inbound,
) -> Result<ProxyResponse, GatewayErrorKind> {
    let proto = forwarded_proto(&req, inbound.is_tls);
    let uri_str = upstream_uri(mapping, req.uri().path(), req.uri().query());
    let host = upstream_host(mapping);

    debug!(
        target = %target_url(mapping, req.uri().path(), req.uri().query()),
        "Proxying request"
    );

    let stream = connect_upstream(&host, mapping.back_port).await?;

    let (parts, body) = req.into_parts();
    let raw_host = parts.headers.get(HOST).cloned();

    let mut builder = Request::builder()
        .method(parts.method)
        .uri(uri_str.as_str())
        .version(Version::HTTP_11);

    // Host rides along verbatim; only the forwarding headers get touched.
    for (name, value) in parts.headers.iter() {
        let lowered = name.as_str();
        if lowered == X_FORWARDED_FOR
            || lowered == X_FORWARDED_HOST
            || lowered == X_FORWARDED_PROTO
            || lowered == X_FORWARDED_PORT
        {
            continue;
        }
        builder = builder.header(name, value);
    }

    if let Some(host_value) = raw_host {
        builder = builder.header(X_FORWARDED_HOST, host_value);
    }
    builder = builder.header(X_FORWARDED_PROTO, proto);
    if let Some(xff) = append_header_value(
        parts.headers.get(X_FORWARDED_FOR),
        &inbound.peer.ip().to_string(),
    ) {
        builder = builder.header(X_FORWARDED_FOR, xff);
    }
    if let Some(xfp) = append_header_value(
        parts.headers.get(X_FORWARDED_PORT),
        &inbound.port.to_string(),
    ) {
        builder = builder.header(X_FORWARDED_PORT, xfp);
    }

    let upstream_req = builder.body(body).map_err(|e| {
        error!(error = %e, "Failed to build upstream request");
        GatewayErrorKind::InternalError
    })?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await.map_err(|e| {
        error!(error = %e, "Upstream handshake failed");
        GatewayErrorKind::UpstreamUnavailable
    })?;

    // The driver owns the connection; it ends when either side closes.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Upstream connection closed with error");
        }
    });

    let response = match tokio::time::timeout(EXCHANGE_TIMEOUT, sender.send_request(upstream_req))
        .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(error = %e, "Upstream exchange failed");
            return Err(GatewayErrorKind::UpstreamUnavailable);
        }
        Err(_) => {
            warn!(timeout_secs = EXCHANGE_TIMEOUT.as_secs(), "Upstream exchange timed out");
            return Err(GatewayErrorKind::UpstreamTimeout);
        }
    };

    Ok(response.map(|body| body.boxed()))
}

/// Serialize an upgrade request for the backend, preserving every header
/// (subprotocols included) and adding the forwarding set.
fn build_upgrade_request<T>(req: &Request<T>, uri_str: &str, inbound: Inbound) -> Vec<u8> {
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), uri_str);

    for (name, value) in req.headers() {
        let lowered = name.as_str();
        if lowered == X_FORWARDED_FOR
            || lowered == X_FORWARDED_HOST
            || lowered == X_FORWARDED_PROTO
            || lowered == X_FORWARDED_PORT
        {
            continue;
        }
        if let Ok(v) = value.to_str() {
            raw.push_str(&format!("{name}: {v}\r\n"));
        }
    }

    let raw_host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let proto = forwarded_proto(req, inbound.is_tls);

    raw.push_str(&format!("{X_FORWARDED_HOST}: {raw_host}\r\n"));
    raw.push_str(&format!("{X_FORWARDED_PROTO}: {proto}\r\n"));
    if let Some(xff) =
        append_header_value(req.headers().get(X_FORWARDED_FOR), &inbound.peer.ip().to_string())
    {
        if let Ok(v) = xff.to_str() {
            raw.push_str(&format!("{X_FORWARDED_FOR}: {v}\r\n"));
        }
    }
    raw.push_str(&format!("{X_FORWARDED_PORT}: {}\r\n", inbound.port));
    raw.push_str("\r\n");

    raw.into_bytes()
}

/// Parse the backend's upgrade response head: status plus headers.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head_end = data.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = std::str::from_utf8(&data[..head_end]).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let code: u16 = status_line.splitn(3, ' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Bytes of the backend's first read that arrived after the response
/// head; they belong to the spliced stream.
fn upgrade_remainder(data: &[u8]) -> &[u8] {
    match data.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(idx) => &data[idx + 4..],
        None => &[],
    }
}

async fn splice_upgraded(client: Upgraded, mut backend: TcpStream, remainder: Vec<u8>) {
    let mut client_io = TokioIo::new(client);

    if !remainder.is_empty() {
        if let Err(e) = client_io.write_all(&remainder).await {
            debug!(error = %e, "Failed to flush early upgrade bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(to_backend, to_client, "Upgrade stream closed");
        }
        Err(e) => {
            debug!(error = %e, "Upgrade stream closed with error");
        }
    }
}

/// Forward a WebSocket (or any other) upgrade: send the raw request to
/// the backend, relay its 101 and splice both directions.
async fn handle_upgrade(
    req: Request<Incoming>,
    mapping: &Mapping,
    inbound: Inbound,
) -> Result<ProxyResponse, GatewayErrorKind> {
    let uri_str = upstream_uri(mapping, req.uri().path(), req.uri().query());
    let host = upstream_host(mapping);

    debug!(uri = %uri_str, back_port = mapping.back_port, "Forwarding upgrade request");

    let mut backend = connect_upstream(&host, mapping.back_port).await?;

    let raw_request = build_upgrade_request(&req, &uri_str, inbound);
    backend.write_all(&raw_request).await.map_err(|e| {
        error!(error = %e, "Failed to send upgrade request");
        GatewayErrorKind::UpstreamUnavailable
    })?;

    let mut buf = vec![0u8; 8192];
    let n = match tokio::time::timeout(EXCHANGE_TIMEOUT, backend.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => n,
        Ok(Ok(_)) => {
            error!("Backend closed before answering upgrade");
            return Err(GatewayErrorKind::UpstreamUnavailable);
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to read upgrade response");
            return Err(GatewayErrorKind::UpstreamUnavailable);
        }
        Err(_) => {
            warn!("Upgrade response timed out");
            return Err(GatewayErrorKind::UpstreamTimeout);
        }
    };

    let (status, response_headers) =
        parse_upgrade_response(&buf[..n]).ok_or(GatewayErrorKind::UpstreamUnavailable)?;

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %status, "Backend rejected upgrade");
        let mut builder = Response::builder().status(status);
        for (name, value) in &response_headers {
            if let Ok(v) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), v);
            }
        }
        return builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .map_err(|_| GatewayErrorKind::InternalError);
    }

    let remainder = upgrade_remainder(&buf[..n]).to_vec();

    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        let lowered = name.to_ascii_lowercase();
        if lowered == "content-length" || lowered == "transfer-encoding" {
            continue;
        }
        if let Ok(v) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), v);
        }
    }
    let response = builder
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .map_err(|_| GatewayErrorKind::InternalError)?;

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => splice_upgraded(upgraded, backend, remainder).await,
            Err(e) => error!(error = %e, "Client upgrade failed"),
        }
    });

    Ok(response)
}
