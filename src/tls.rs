//! SNI-driven TLS acceptance
//!
//! Each handshake pauses after the ClientHello so certificate selection
//! can await disk reads and ACME issuance, then resumes with a server
//! config built for exactly that host. Unknown hosts still complete the
//! handshake with self-signed material; the request layer then returns
//! its usual 404.

use crate::acme::AcmeBroker;
use crate::certs::CertEntry;
use crate::db::MappingStore;
use anyhow::{anyhow, Context};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, warn};

pub struct TlsGate {
    store: Arc<MappingStore>,
    broker: Arc<AcmeBroker>,
}

impl TlsGate {
    pub fn new(store: Arc<MappingStore>, broker: Arc<AcmeBroker>) -> Self {
        Self { store, broker }
    }

    /// Complete a TLS handshake on an accepted connection, choosing the
    /// certificate from the client's server name. Handshake failures
    /// surface as errors; the caller logs and drops the connection.
    pub async fn accept(&self, stream: TcpStream) -> anyhow::Result<TlsStream<TcpStream>> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = acceptor.await.context("reading ClientHello")?;

        let host = start
            .client_hello()
            .server_name()
            .map(normalize_server_name);

        let entry = match host {
            Some(host) => {
                // A host is authorized for issuance only if routing knows it.
                let authorized = match self.store.find(&host, "/") {
                    Ok(mapping) => mapping.is_some(),
                    Err(e) => {
                        warn!(host, error = %e, "Mapping lookup failed during handshake");
                        false
                    }
                };
                debug!(host, authorized, "SNI certificate lookup");
                self.broker.ensure(&host, authorized).await?
            }
            None => {
                debug!("No SNI offered, using default identity");
                self.broker.store().default_identity()?
            }
        };

        let config = server_config_for(&entry)?;
        let stream = start
            .into_stream(Arc::new(config))
            .await
            .context("completing TLS handshake")?;
        Ok(stream)
    }
}

/// Lowercase and strip any port suffix from an SNI name.
fn normalize_server_name(name: &str) -> String {
    let name = name.split(':').next().unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Build a fresh single-certificate server config from PEM material.
pub fn server_config_for(entry: &CertEntry) -> anyhow::Result<ServerConfig> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(entry.cert_pem.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .context("parsing certificate chain")?;
    if certs.is_empty() {
        return Err(anyhow!("certificate chain is empty"));
    }

    let key = parse_private_key(entry.key_pem.as_bytes())
        .ok_or_else(|| anyhow!("no private key found in PEM"))?;

    // Name the provider explicitly: the dependency graph may compile
    // more than one, and the default-provider lookup then refuses to
    // guess.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("selecting TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building server config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn parse_private_key(pem: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}
