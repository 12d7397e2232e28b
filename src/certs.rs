//! Certificate storage, classification and self-signed generation
//!
//! Disk is the source of truth: `<host>.crt`/`<host>.key` pairs under the
//! certs directory, with an in-memory per-worker cache keyed by exact
//! host. Certificates renew lazily: a pair counts as valid only while it
//! is more than the renewal window away from expiry, so access close to
//! expiry triggers reissue.
//!
//! Private keys are written with 0600 permissions on Unix. The directory
//! also holds the ACME account state and HTTP-01 challenge files managed
//! by the broker.

use anyhow::{anyhow, Context};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Days before `notAfter` at which a certificate stops counting as valid.
pub const RENEW_WINDOW_DAYS: i64 = 30;

/// Organization name stamped into self-signed certificates. Classification
/// treats any certificate carrying it as not CA-issued.
pub const SELF_SIGNED_ORG: &str = "Test";

/// Validity period of generated self-signed certificates.
const SELF_SIGNED_DAYS: i64 = 365;

/// RSA modulus size for generated keys.
const RSA_BITS: usize = 2048;

/// A PEM certificate chain and its private key.
#[derive(Debug, Clone)]
pub struct CertEntry {
    pub cert_pem: String,
    pub key_pem: String,
}

/// On-disk and in-memory certificate store for one worker.
pub struct CertStore {
    certs_dir: PathBuf,
    cache: DashMap<String, Arc<CertEntry>>,
}

impl CertStore {
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> anyhow::Result<Self> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&certs_dir)
            .with_context(|| format!("creating {}", certs_dir.display()))?;
        Ok(Self {
            certs_dir,
            cache: DashMap::new(),
        })
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    fn cert_path(&self, host: &str) -> PathBuf {
        self.certs_dir.join(format!("{}.crt", sanitize_host(host)))
    }

    fn key_path(&self, host: &str) -> PathBuf {
        self.certs_dir.join(format!("{}.key", sanitize_host(host)))
    }

    /// Warm the cache from disk: every `<host>.crt` whose expiry is still
    /// ahead gets loaded alongside its key.
    pub fn warm_cache(&self) {
        let entries = match std::fs::read_dir(&self.certs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.certs_dir.display(), error = %e, "Cannot scan certs directory");
                return;
            }
        };

        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let Some(pair) = self.load_pair(stem) else {
                continue;
            };
            if !is_expired(&pair.cert_pem) {
                self.cache.insert(stem.to_string(), Arc::new(pair));
                loaded += 1;
            }
        }
        info!(count = loaded, dir = %self.certs_dir.display(), "Certificate cache warmed");
    }

    /// Read a `<host>.crt`/`<host>.key` pair if both files exist.
    pub fn load_pair(&self, host: &str) -> Option<CertEntry> {
        let cert_pem = std::fs::read_to_string(self.cert_path(host)).ok()?;
        let key_pem = std::fs::read_to_string(self.key_path(host)).ok()?;
        Some(CertEntry { cert_pem, key_pem })
    }

    /// Persist a pair to disk. The key gets 0600 permissions on Unix.
    pub fn persist(&self, host: &str, entry: &CertEntry) -> anyhow::Result<()> {
        std::fs::write(self.cert_path(host), &entry.cert_pem)?;

        let key_path = self.key_path(host);
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            file.write_all(entry.key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, &entry.key_pem)?;
        }

        debug!(host, "Certificate persisted");
        Ok(())
    }

    pub fn cached(&self, host: &str) -> Option<Arc<CertEntry>> {
        self.cache.get(host).map(|e| Arc::clone(&e))
    }

    pub fn cache_insert(&self, host: &str, entry: Arc<CertEntry>) {
        self.cache.insert(host.to_string(), entry);
    }

    pub fn cache_evict(&self, host: &str) {
        self.cache.remove(host);
    }

    /// The static listener identity: a self-signed `localhost` pair at
    /// `default.crt`/`default.key`, generated on first use.
    pub fn default_identity(&self) -> anyhow::Result<Arc<CertEntry>> {
        if let Some(cached) = self.cached("default") {
            return Ok(cached);
        }
        if let Some(pair) = self.load_pair("default") {
            let pair = Arc::new(pair);
            self.cache_insert("default", Arc::clone(&pair));
            return Ok(pair);
        }

        info!("Generating default self-signed certificate for localhost");
        let pair = generate_self_signed("localhost")?;
        self.persist("default", &pair)?;
        let pair = Arc::new(pair);
        self.cache_insert("default", Arc::clone(&pair));
        Ok(pair)
    }

    /// Wildcard material for an apex, if someone placed it on disk and it
    /// is still valid. Wildcards are served, never issued.
    pub fn wildcard_for(&self, apex: &str) -> Option<Arc<CertEntry>> {
        let name = format!("wildcard.{apex}");
        if let Some(cached) = self.cached(&name) {
            if is_valid(&cached.cert_pem) {
                return Some(cached);
            }
            self.cache_evict(&name);
        }
        let pair = self.load_pair(&name)?;
        if !is_valid(&pair.cert_pem) {
            return None;
        }
        let pair = Arc::new(pair);
        self.cache_insert(&name, Arc::clone(&pair));
        Some(pair)
    }
}

/// File-system-safe spelling of a host name.
fn sanitize_host(host: &str) -> String {
    host.replace('*', "wildcard")
}

fn parse_first_der(cert_pem: &str) -> Option<Vec<u8>> {
    let mut reader = std::io::BufReader::new(cert_pem.as_bytes());
    let mut iter = rustls_pemfile::certs(&mut reader);
    iter.next()?.ok().map(|der| der.as_ref().to_vec())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Valid means usable without renewal: inside the validity period and
/// more than the renewal window away from expiry.
pub fn is_valid(cert_pem: &str) -> bool {
    let Some(der) = parse_first_der(cert_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        return false;
    };

    let now = unix_now();
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();

    now >= not_before && now < not_after - RENEW_WINDOW_DAYS * 24 * 60 * 60
}

/// Expired outright (used for the startup cache scan, which keeps pairs
/// inside the renewal window so they can still serve while reissue runs).
fn is_expired(cert_pem: &str) -> bool {
    let Some(der) = parse_first_der(cert_pem) else {
        return true;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        return true;
    };
    unix_now() >= cert.validity().not_after.timestamp()
}

/// A real certificate came from a CA: issuer differs from subject and the
/// subject organization is not the self-signed sentinel.
pub fn is_real(cert_pem: &str) -> bool {
    let Some(der) = parse_first_der(cert_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        return false;
    };

    let self_issued = cert.subject().as_raw() == cert.issuer().as_raw();
    let test_org = cert
        .subject()
        .iter_organization()
        .any(|o| o.as_str().map(|s| s == SELF_SIGNED_ORG).unwrap_or(false));

    !self_issued && !test_org
}

/// Registrable domain for a host: compound public suffixes (`co.uk` and
/// friends) keep three labels, everything else keeps two.
pub fn apex(host: &str) -> String {
    const COMPOUND_SUFFIXES: &[&str] = &[
        "co.uk", "org.uk", "me.uk", "ac.uk", "gov.uk", "net.uk", "sch.uk", "com.au", "net.au",
        "org.au", "edu.au", "gov.au", "co.nz", "net.nz", "org.nz", "co.jp", "ne.jp", "or.jp",
        "com.br", "net.br", "org.br", "co.in", "net.in", "org.in", "co.za", "com.mx", "com.cn",
        "com.sg", "com.hk",
    ];

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host.to_string();
    }

    let keep = if COMPOUND_SUFFIXES
        .iter()
        .any(|suffix| host.ends_with(&format!(".{suffix}")))
    {
        3
    } else {
        2
    };

    if labels.len() <= keep {
        host.to_string()
    } else {
        labels[labels.len() - keep..].join(".")
    }
}

/// Generate a self-signed RSA certificate for a host.
///
/// Subject and issuer are identical (`CN=<host>`, `O=Test`), one SAN DNS
/// entry matches the CN, validity is one year. CPU-heavy: callers on the
/// request path run this through `spawn_blocking`.
pub fn generate_self_signed(host: &str) -> anyhow::Result<CertEntry> {
    let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BITS)
        .context("generating RSA key")?;
    let key_pem = rsa_key
        .to_pkcs8_pem(LineEnding::LF)
        .context("encoding private key")?
        .to_string();
    let key_der = rsa_key.to_pkcs8_der().context("encoding private key")?;
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
        &PrivatePkcs8KeyDer::from(key_der.as_bytes().to_vec()),
        &rcgen::PKCS_RSA_SHA256,
    )
    .map_err(|e| anyhow!("loading RSA key for signing: {e}"))?;

    let mut params = CertificateParams::new(vec![host.to_string()])
        .map_err(|e| anyhow!("invalid SAN {host}: {e}"))?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, host);
    params
        .distinguished_name
        .push(DnType::OrganizationName, SELF_SIGNED_ORG);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(SELF_SIGNED_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| anyhow!("signing certificate for {host}: {e}"))?;

    Ok(CertEntry {
        cert_pem: cert.pem(),
        key_pem,
    })
}
