//! Integration tests for the forwarding path
//!
//! Each test boots a gateway on an ephemeral port with its own temp
//! database and certs directory, plus one or more in-process backends.
//! Clients speak raw TCP so response bytes can be asserted exactly.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use routegate::acme::AcmeBroker;
use routegate::certs::CertStore;
use routegate::db::MappingStore;
use routegate::proxy::Gateway;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// A gateway plus its scratch state, serving plain HTTP on `port`.
struct TestGateway {
    port: u16,
    store: Arc<MappingStore>,
    broker: Arc<AcmeBroker>,
    dir: TempDir,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway() -> TestGateway {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MappingStore::open(dir.path().join("routes.db")).unwrap());
    let cert_store = Arc::new(CertStore::new(dir.path().join("certs")).unwrap());
    let broker = Arc::new(AcmeBroker::with_client(cert_store, None));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Gateway::new(Arc::clone(&store), Arc::clone(&broker));
    tokio::spawn(gateway.run_plain(listener, port, shutdown_rx));

    TestGateway {
        port,
        store,
        broker,
        dir,
        _shutdown_tx: shutdown_tx,
    }
}

/// Backend that echoes its request line, Host and forwarding headers.
async fn start_echo_backend(tag: &'static str) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let uri = req.uri().to_string();
                    let host = header(&req, "host");
                    let xff = header(&req, "x-forwarded-for");
                    let proto = header(&req, "x-forwarded-proto");
                    let fwd_host = header(&req, "x-forwarded-host");
                    let body = req.into_body().collect().await.unwrap().to_bytes();

                    let text = format!(
                        "{tag}|uri={uri}|host={host}|xff={xff}|proto={proto}|fwd_host={fwd_host}|len={}",
                        body.len()
                    );
                    Ok::<_, Infallible>(
                        Response::builder()
                            .status(200)
                            .body(Full::new(Bytes::from(text)))
                            .unwrap(),
                    )
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    port
}

fn header(req: &Request<Incoming>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

/// Raw HTTP/1.1 request; returns the full response (head + body).
async fn http_request(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).into_owned()
}

async fn http_get(port: u16, host: &str, path: &str) -> String {
    http_request(
        port,
        &format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"),
    )
    .await
}

#[tokio::test]
async fn test_health_endpoint_ignores_routing_state() {
    let gw = start_gateway().await;

    let response = http_get(gw.port, "anything.example", "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("content-type: text/plain") || response.contains("Content-Type: text/plain"));
    assert!(response.ends_with("OK"));
}

#[tokio::test]
async fn test_identity_mapping_forwards_raw_path() {
    let gw = start_gateway().await;
    let backend = start_echo_backend("S1").await;
    gw.store.add("example.com", "", backend, "", None).unwrap();

    let response = http_get(gw.port, "example.com", "/a/b").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("S1|uri=/a/b|"));
    assert!(response.contains("|host=example.com|"));
}

#[tokio::test]
async fn test_longest_match_routes_to_deeper_mapping() {
    let gw = start_gateway().await;
    let shallow = start_echo_backend("SHALLOW").await;
    let deep = start_echo_backend("DEEP").await;

    gw.store.add("app.example.com", "api/v1", shallow, "v1", None).unwrap();
    gw.store.add("app.example.com", "api/v1/users", deep, "v2", None).unwrap();

    let response = http_get(gw.port, "app.example.com", "/api/v1/users/123").await;
    assert!(response.contains("DEEP|uri=/v2/users/123|"));

    let response = http_get(gw.port, "app.example.com", "/api/v1/orders/7").await;
    assert!(response.contains("SHALLOW|uri=/v1/orders/7|"));
}

#[tokio::test]
async fn test_unknown_host_returns_404_not_found() {
    let gw = start_gateway().await;

    let response = http_get(gw.port, "unknown.example", "/").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.ends_with("Not Found"));
}

#[tokio::test]
async fn test_missing_host_returns_400() {
    let gw = start_gateway().await;

    let response =
        http_request(gw.port, "GET /x HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"));
    assert!(response.ends_with("Missing Host header"));
}

#[tokio::test]
async fn test_forwarding_headers() {
    let gw = start_gateway().await;
    let backend = start_echo_backend("HDR").await;
    gw.store.add("hdr.example", "", backend, "", None).unwrap();

    let response = http_get(gw.port, "hdr.example", "/check").await;
    assert!(response.contains("|host=hdr.example|"));
    assert!(response.contains("|xff=127.0.0.1|"));
    assert!(response.contains("|proto=http|"));
    assert!(response.contains("|fwd_host=hdr.example|"));
}

#[tokio::test]
async fn test_client_forwarded_for_is_appended_to() {
    let gw = start_gateway().await;
    let backend = start_echo_backend("XFF").await;
    gw.store.add("xff.example", "", backend, "", None).unwrap();

    let response = http_request(
        gw.port,
        "GET / HTTP/1.1\r\nHost: xff.example\r\nX-Forwarded-For: 10.1.2.3\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.contains("|xff=10.1.2.3, 127.0.0.1|"));
}

#[tokio::test]
async fn test_query_string_preserved() {
    let gw = start_gateway().await;
    let backend = start_echo_backend("QS").await;
    gw.store.add("qs.example", "api/v1", backend, "v1", None).unwrap();

    let response = http_get(gw.port, "qs.example", "/api/v1/users/42?q=1&r=%2F").await;
    assert!(response.contains("QS|uri=/v1/users/42?q=1&r=%2F|"));
}

#[tokio::test]
async fn test_post_body_reaches_backend() {
    let gw = start_gateway().await;
    let backend = start_echo_backend("POST").await;
    gw.store.add("post.example", "", backend, "", None).unwrap();

    let body = "payload-bytes";
    let response = http_request(
        gw.port,
        &format!(
            "POST /submit HTTP/1.1\r\nHost: post.example\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(&format!("|len={}", body.len())));
}

#[tokio::test]
async fn test_unreachable_backend_returns_502() {
    let gw = start_gateway().await;
    // Bind-then-drop to get a port with no listener behind it.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    gw.store.add("dead.example", "", dead_port, "", None).unwrap();

    let response = http_get(gw.port, "dead.example", "/").await;
    assert!(response.starts_with("HTTP/1.1 502"));
    assert!(response.ends_with("Bad Gateway"));
}

#[tokio::test]
async fn test_acme_challenge_served_and_missing() {
    let gw = start_gateway().await;

    gw.broker.challenges().publish("itest-token", "itest-token.keyauth");

    let response = http_get(gw.port, "any.example", "/.well-known/acme-challenge/itest-token").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("itest-token.keyauth"));

    let response = http_get(gw.port, "any.example", "/.well-known/acme-challenge/unknown").await;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert!(response.ends_with("Challenge not found"));
}

// ---------------------------------------------------------------------------
// WebSocket upgrade path
// ---------------------------------------------------------------------------

const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn compute_ws_accept(key: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, hasher.finalize())
}

/// Minimal WebSocket echo backend: completes the handshake, then echoes
/// every masked text frame back unmasked.
async fn start_ws_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).into_owned();

                let key = request
                    .lines()
                    .find_map(|line| line.strip_prefix("sec-websocket-key:"))
                    .or_else(|| {
                        request
                            .lines()
                            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key:"))
                    })
                    .map(str::trim)
                    .unwrap_or_default()
                    .to_string();
                let protocol = request
                    .lines()
                    .find_map(|line| line.strip_prefix("sec-websocket-protocol:"))
                    .or_else(|| {
                        request
                            .lines()
                            .find_map(|line| line.strip_prefix("Sec-WebSocket-Protocol:"))
                    })
                    .map(str::trim)
                    .map(String::from);

                let mut response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n",
                    compute_ws_accept(&key)
                );
                if let Some(proto) = protocol {
                    let first = proto.split(',').next().unwrap_or("").trim();
                    response.push_str(&format!("Sec-WebSocket-Protocol: {first}\r\n"));
                }
                response.push_str("\r\n");
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }

                // Echo loop: unmask the client frame, reply unmasked.
                loop {
                    let mut header = [0u8; 2];
                    if stream.read_exact(&mut header).await.is_err() {
                        return;
                    }
                    let opcode = header[0] & 0x0F;
                    if opcode == 0x8 {
                        return;
                    }
                    let masked = header[1] & 0x80 != 0;
                    let len = (header[1] & 0x7F) as usize;

                    let mut mask = [0u8; 4];
                    if masked && stream.read_exact(&mut mask).await.is_err() {
                        return;
                    }
                    let mut payload = vec![0u8; len];
                    if stream.read_exact(&mut payload).await.is_err() {
                        return;
                    }
                    if masked {
                        for (i, byte) in payload.iter_mut().enumerate() {
                            *byte ^= mask[i % 4];
                        }
                    }

                    let mut frame = vec![0x81, payload.len() as u8];
                    frame.extend_from_slice(&payload);
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    port
}

/// WebSocket handshake through the gateway; returns the spliced stream.
async fn ws_handshake(
    port: u16,
    host: &str,
    path: &str,
    subprotocol: Option<&str>,
) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    let mut request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n"
    );
    if let Some(proto) = subprotocol {
        request.push_str(&format!("Sec-WebSocket-Protocol: {proto}\r\n"));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut response))
        .await
        .unwrap()
        .unwrap();
    let head = String::from_utf8_lossy(&response[..n]).into_owned();

    assert!(
        head.contains("101 Switching Protocols"),
        "handshake failed: {head}"
    );
    assert!(head.contains(&compute_ws_accept(key)), "bad accept key: {head}");

    (stream, head)
}

async fn send_ws_text(stream: &mut TcpStream, text: &str) {
    let payload = text.as_bytes();
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    let mask = [0x12, 0x34, 0x56, 0x78u8];
    frame.extend_from_slice(&mask);
    for (i, byte) in payload.iter().enumerate() {
        frame.push(byte ^ mask[i % 4]);
    }
    stream.write_all(&frame).await.unwrap();
}

async fn recv_ws_text(stream: &mut TcpStream) -> String {
    let mut header = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut header))
        .await
        .unwrap()
        .unwrap();
    let len = (header[1] & 0x7F) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    String::from_utf8(payload).unwrap()
}

#[tokio::test]
async fn test_websocket_roundtrip_through_gateway() {
    let gw = start_gateway().await;
    let backend = start_ws_echo_backend().await;
    gw.store.add("ws.example", "", backend, "", None).unwrap();

    let (mut stream, head) = ws_handshake(gw.port, "ws.example", "/", Some("chat")).await;

    // Subprotocol negotiated by the backend survives the proxy.
    assert!(head.contains("chat"), "subprotocol lost: {head}");

    send_ws_text(&mut stream, "hello through proxy").await;
    assert_eq!(recv_ws_text(&mut stream).await, "hello through proxy");

    send_ws_text(&mut stream, "second message").await;
    assert_eq!(recv_ws_text(&mut stream).await, "second message");
}

#[tokio::test]
async fn test_two_websocket_clients_no_crosstalk() {
    let gw = start_gateway().await;
    let backend = start_ws_echo_backend().await;
    gw.store.add("ws2.example", "", backend, "", None).unwrap();

    let (mut first, _) = ws_handshake(gw.port, "ws2.example", "/", None).await;
    let (mut second, _) = ws_handshake(gw.port, "ws2.example", "/", None).await;

    send_ws_text(&mut first, "from-first").await;
    send_ws_text(&mut second, "from-second").await;

    assert_eq!(recv_ws_text(&mut first).await, "from-first");
    assert_eq!(recv_ws_text(&mut second).await, "from-second");
}

#[tokio::test]
async fn test_websocket_unmapped_host_rejected() {
    let gw = start_gateway().await;

    let response = http_request(
        gw.port,
        "GET / HTTP/1.1\r\nHost: nows.example\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_hot_replace_serves_new_mappings() {
    let gw = start_gateway().await;
    let old_backend = start_echo_backend("OLD").await;
    let new_backend = start_echo_backend("NEW").await;

    gw.store.add("swap.example", "", old_backend, "", None).unwrap();
    let response = http_get(gw.port, "swap.example", "/").await;
    assert!(response.contains("OLD|"));

    // Build the replacement database off to the side.
    let replacement_path = gw.dir.path().join("replacement.db");
    let replacement = MappingStore::open(&replacement_path).unwrap();
    replacement.add("fresh.example", "", new_backend, "", None).unwrap();
    replacement.close();

    gw.store.hot_replace(&replacement_path).unwrap();

    let response = http_get(gw.port, "swap.example", "/").await;
    assert!(response.starts_with("HTTP/1.1 404"));

    let response = http_get(gw.port, "fresh.example", "/").await;
    assert!(response.contains("NEW|"));
}
