//! ACME (Let's Encrypt) certificate broker
//!
//! Issues single-name certificates on demand via the HTTP-01 challenge
//! and degrades to self-signed material whenever ACME cannot help: host
//! not mapped, rate limits hit, account unavailable, order failed. A TLS
//! handshake never fails because issuance did.
//!
//! Workers coordinate through the filesystem. The account is registered
//! exactly once per certs directory (exclusive-create lock file plus a
//! sentinel), and challenge responses are mirrored to
//! `.well-known/acme-challenge/` so whichever worker receives the
//! validation request can answer it.
//!
//! # Security Considerations
//!
//! Account credentials and private keys live unencrypted in the certs
//! directory. Deployments should restrict that directory to the service
//! user and back it up with the same care as any key material.

use crate::certs::{self, CertEntry, CertStore};
use crate::error::CertError;
use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACCOUNT_CREDENTIALS_FILE: &str = "account.json";
const ACCOUNT_SENTINEL_FILE: &str = ".account-registered";
const ACCOUNT_LOCK_FILE: &str = ".account-create.lock";

/// How long a worker waits to win the account-creation lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a lockless worker polls for another worker's registration.
const SENTINEL_TIMEOUT: Duration = Duration::from_secs(2);
/// Spin granularity for both waits.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum spacing between ACME attempts for one host.
const RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Attempt ceiling per host for the lifetime of the process.
const MAX_ATTEMPTS: u32 = 5;

/// How long a caller waits on another task already issuing for the host.
const SINGLE_FLIGHT_TIMEOUT: Duration = Duration::from_secs(30);

/// In-memory HTTP-01 challenge tokens, mirrored to disk for peer workers.
#[derive(Clone)]
pub struct ChallengeMap {
    tokens: Arc<DashMap<String, String>>,
    dir: PathBuf,
}

impl ChallengeMap {
    pub fn new(certs_dir: &std::path::Path) -> Self {
        Self {
            tokens: Arc::new(DashMap::new()),
            dir: certs_dir.join(".well-known").join("acme-challenge"),
        }
    }

    /// Store a key authorization in memory and on disk.
    pub fn publish(&self, token: &str, key_auth: &str) {
        self.tokens.insert(token.to_string(), key_auth.to_string());
        if let Err(e) = std::fs::create_dir_all(&self.dir)
            .and_then(|_| std::fs::write(self.dir.join(token), key_auth))
        {
            warn!(token, error = %e, "Failed to write challenge file");
        }
    }

    /// Drop a token from memory and disk.
    pub fn withdraw(&self, token: &str) {
        self.tokens.remove(token);
        let _ = std::fs::remove_file(self.dir.join(token));
    }

    /// Look up a token: memory first, then the shared directory (it may
    /// belong to a peer worker).
    pub fn lookup(&self, token: &str) -> Option<String> {
        if !is_safe_token(token) {
            return None;
        }
        if let Some(key_auth) = self.tokens.get(token) {
            return Some(key_auth.clone());
        }
        std::fs::read_to_string(self.dir.join(token)).ok()
    }
}

/// Tokens come straight off the request path; only the base64url
/// alphabet ACME uses may reach the filesystem.
fn is_safe_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Capability for ordering one single-name certificate. The production
/// implementation speaks ACME via `instant-acme`; tests inject fakes.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    async fn order_certificate(
        &self,
        host: &str,
        challenges: &ChallengeMap,
    ) -> anyhow::Result<CertEntry>;
}

/// Per-host issuance throttle state.
struct RateLimit {
    last_attempt: Instant,
    attempts: u32,
}

/// The certificate broker: cache and disk checks, wildcard serving,
/// rate limiting, single-flight issuance, self-signed fallback.
pub struct AcmeBroker {
    store: Arc<CertStore>,
    client: Option<Arc<dyn AcmeClient>>,
    challenges: ChallengeMap,
    rate_limits: DashMap<String, RateLimit>,
    processing: Arc<DashMap<String, ()>>,
}

impl AcmeBroker {
    /// Bootstrap the broker: load or register the ACME account, then
    /// wire up the challenge directory. A failed bootstrap is not fatal;
    /// the broker simply serves self-signed certificates.
    pub async fn initialize(store: Arc<CertStore>, directory_url: &str) -> Self {
        let client = match bootstrap_account(store.certs_dir(), directory_url).await {
            Ok(Some(account)) => Some(Arc::new(InstantAcmeClient { account }) as Arc<dyn AcmeClient>),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "ACME account unavailable, serving self-signed only");
                None
            }
        };
        Self::with_client(store, client)
    }

    /// Construct with an explicit (possibly absent) client. Used by
    /// `initialize` and by tests.
    pub fn with_client(store: Arc<CertStore>, client: Option<Arc<dyn AcmeClient>>) -> Self {
        let challenges = ChallengeMap::new(store.certs_dir());
        Self {
            store,
            client,
            challenges,
            rate_limits: DashMap::new(),
            processing: Arc::new(DashMap::new()),
        }
    }

    pub fn challenges(&self) -> ChallengeMap {
        self.challenges.clone()
    }

    pub fn store(&self) -> &Arc<CertStore> {
        &self.store
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Produce usable certificate material for a host.
    ///
    /// Order of preference: valid pair on disk, valid cached entry,
    /// wildcard material for the apex (strict subdomains only), ACME
    /// issuance (authorized hosts, within rate limits), self-signed.
    /// Concurrent calls for one host collapse into a single issuance.
    pub async fn ensure(&self, host: &str, authorized: bool) -> anyhow::Result<Arc<CertEntry>> {
        // Disk first: another worker may have issued since we last looked.
        if let Some(disk) = self.store.load_pair(host) {
            if certs::is_valid(&disk.cert_pem) {
                if certs::is_real(&disk.cert_pem) {
                    let entry = Arc::new(disk);
                    self.store.cache_insert(host, Arc::clone(&entry));
                    return Ok(entry);
                }
                // Self-signed on disk never displaces a cached real cert.
                if let Some(cached) = self.store.cached(host) {
                    if certs::is_real(&cached.cert_pem) && certs::is_valid(&cached.cert_pem) {
                        return Ok(cached);
                    }
                }
                let entry = Arc::new(disk);
                self.store.cache_insert(host, Arc::clone(&entry));
                return Ok(entry);
            }
        }

        if let Some(cached) = self.store.cached(host) {
            if certs::is_valid(&cached.cert_pem) {
                return Ok(cached);
            }
            self.store.cache_evict(host);
        }

        // Strict subdomains may ride on wildcard material for the apex.
        let apex = certs::apex(host);
        if host != apex && host != format!("www.{apex}") {
            if let Some(wildcard) = self.store.wildcard_for(&apex) {
                self.store.cache_insert(host, Arc::clone(&wildcard));
                return Ok(wildcard);
            }
        }

        // Unmapped hosts never reach ACME: anyone can put any name in SNI.
        if !authorized {
            return self.self_signed(host).await;
        }
        let Some(client) = self.client.clone() else {
            return self.self_signed(host).await;
        };

        if self.rate_limited(host) {
            return self.self_signed(host).await;
        }

        // Single flight: only one task per host runs the order; the rest
        // wait for its cache entry.
        if self.processing.insert(host.to_string(), ()).is_some() {
            return self.await_inflight(host).await;
        }
        let _guard = ProcessingGuard {
            processing: Arc::clone(&self.processing),
            host: host.to_string(),
        };

        self.record_attempt(host);

        match client.order_certificate(host, &self.challenges).await {
            Ok(entry) => {
                info!(host, "Certificate issued");
                if let Err(e) = self.store.persist(host, &entry) {
                    warn!(host, error = %e, "Failed to persist issued certificate");
                }
                let entry = Arc::new(entry);
                self.store.cache_insert(host, Arc::clone(&entry));
                Ok(entry)
            }
            Err(e) => {
                let err = CertError::Acme {
                    host: host.to_string(),
                    source: e,
                };
                warn!(error = %err, "Falling back to self-signed");
                self.self_signed(host).await
            }
        }
    }

    /// Wait for a concurrent issuance of the same host to land in the
    /// cache; give up after the single-flight timeout and self-sign.
    async fn await_inflight(&self, host: &str) -> anyhow::Result<Arc<CertEntry>> {
        let deadline = Instant::now() + SINGLE_FLIGHT_TIMEOUT;
        while Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if !self.processing.contains_key(host) {
                if let Some(cached) = self.store.cached(host) {
                    return Ok(cached);
                }
                break;
            }
        }
        debug!(host, "Timed out waiting for concurrent issuance");
        self.self_signed(host).await
    }

    fn rate_limited(&self, host: &str) -> bool {
        let Some(limit) = self.rate_limits.get(host) else {
            return false;
        };
        if limit.last_attempt.elapsed() < RETRY_INTERVAL {
            debug!(host, "ACME attempt within retry interval, skipping");
            return true;
        }
        if limit.attempts >= MAX_ATTEMPTS {
            debug!(host, attempts = limit.attempts, "ACME attempt ceiling reached");
            return true;
        }
        false
    }

    fn record_attempt(&self, host: &str) {
        self.rate_limits
            .entry(host.to_string())
            .and_modify(|limit| {
                limit.last_attempt = Instant::now();
                limit.attempts += 1;
            })
            .or_insert(RateLimit {
                last_attempt: Instant::now(),
                attempts: 1,
            });
    }

    /// Generate, cache and return a self-signed pair for the host. The
    /// default localhost identity is the last resort if generation fails.
    async fn self_signed(&self, host: &str) -> anyhow::Result<Arc<CertEntry>> {
        if let Some(cached) = self.store.cached(host) {
            if certs::is_valid(&cached.cert_pem) {
                return Ok(cached);
            }
        }

        let name = host.to_string();
        let generated = tokio::task::spawn_blocking(move || certs::generate_self_signed(&name))
            .await
            .map_err(|e| anyhow::anyhow!("self-signed generation task failed: {e}"))?;

        match generated {
            Ok(entry) => {
                let entry = Arc::new(entry);
                self.store.cache_insert(host, Arc::clone(&entry));
                Ok(entry)
            }
            Err(e) => {
                let err = CertError::Load(e);
                warn!(host, error = %err, "Self-signed generation failed, using default identity");
                self.store.default_identity()
            }
        }
    }
}

/// Removes the host from the processing set when issuance ends, however
/// it ends.
struct ProcessingGuard {
    processing: Arc<DashMap<String, ()>>,
    host: String,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.processing.remove(&self.host);
    }
}

/// Outcome of the cross-worker registration protocol.
pub enum Registration<T> {
    /// A worker (possibly this one, in an earlier life) already
    /// registered; the sentinel file exists.
    Existing,
    /// This worker won the lock and ran the registration.
    Fresh(T),
    /// Registration is happening elsewhere and did not finish in time,
    /// or it failed outright.
    Unavailable,
}

/// Run a registration exactly once per certs directory.
///
/// The sentinel file marks a completed registration. Absent one, workers
/// race for an exclusive-create lock file; the winner runs `register`
/// and writes the sentinel, losers poll briefly for the sentinel and
/// otherwise report the account unavailable.
pub async fn coordinate_registration<T, F, Fut>(
    certs_dir: &std::path::Path,
    register: F,
) -> Registration<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let sentinel_path = certs_dir.join(ACCOUNT_SENTINEL_FILE);
    let lock_path = certs_dir.join(ACCOUNT_LOCK_FILE);

    if sentinel_path.exists() {
        return Registration::Existing;
    }

    if acquire_lock(&lock_path).await {
        let _lock = LockGuard { path: lock_path };

        // Another worker may have finished while we waited for the lock.
        if sentinel_path.exists() {
            return Registration::Existing;
        }

        return match register().await {
            Ok(value) => {
                if let Err(e) = std::fs::write(&sentinel_path, chrono::Utc::now().to_rfc3339()) {
                    warn!(error = %e, "Failed to write registration sentinel");
                }
                Registration::Fresh(value)
            }
            Err(e) => {
                warn!(error = %e, "ACME registration failed");
                Registration::Unavailable
            }
        };
    }

    // Lost the race: wait briefly for the winner to finish.
    let deadline = Instant::now() + SENTINEL_TIMEOUT;
    while Instant::now() < deadline {
        if sentinel_path.exists() {
            return Registration::Existing;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    warn!("Account registration lock held elsewhere and no sentinel appeared");
    Registration::Unavailable
}

/// Load or register the ACME account for this certs directory.
async fn bootstrap_account(
    certs_dir: &std::path::Path,
    directory_url: &str,
) -> anyhow::Result<Option<Account>> {
    let credentials_path = certs_dir.join(ACCOUNT_CREDENTIALS_FILE);

    if certs_dir.join(ACCOUNT_SENTINEL_FILE).exists() {
        return load_account(&credentials_path).await.map(Some);
    }

    let creds_path = credentials_path.clone();
    let url = directory_url.to_string();
    let outcome = coordinate_registration(certs_dir, || async move {
        info!(directory = %url, "Registering ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &url,
            None,
        )
        .await?;

        std::fs::write(&creds_path, serde_json::to_string_pretty(&credentials)?)?;
        info!("ACME account registered");
        Ok(account)
    })
    .await;

    match outcome {
        Registration::Fresh(account) => Ok(Some(account)),
        Registration::Existing => load_account(&credentials_path).await.map(Some),
        Registration::Unavailable => Ok(None),
    }
}

async fn load_account(credentials_path: &std::path::Path) -> anyhow::Result<Account> {
    let data = std::fs::read_to_string(credentials_path)?;
    let credentials: AccountCredentials = serde_json::from_str(&data)?;
    let account = Account::from_credentials(credentials).await?;
    debug!(path = %credentials_path.display(), "Loaded ACME account");
    Ok(account)
}

/// Exclusive-create lock acquisition with a bounded spin.
async fn acquire_lock(lock_path: &std::path::Path) -> bool {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(_) => return true,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => {
                warn!(path = %lock_path.display(), error = %e, "Cannot create lock file");
                return false;
            }
        }
    }
}

/// Deletes the lock file on every exit path.
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Production ACME client on top of `instant-acme`.
struct InstantAcmeClient {
    account: Account,
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn order_certificate(
        &self,
        host: &str,
        challenges: &ChallengeMap,
    ) -> anyhow::Result<CertEntry> {
        let identifier = Identifier::Dns(host.to_string());
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("no http-01 challenge offered for {host}"))?;

            let key_auth = order.key_authorization(challenge);
            challenges.publish(&challenge.token, key_auth.as_str());
            debug!(host, token = %challenge.token, "HTTP-01 challenge published");

            order.set_challenge_ready(&challenge.url).await?;

            let result = wait_for_authorization(&mut order, host).await;
            challenges.withdraw(&challenge.token);
            result?;
        }

        // Wait for the order to accept a CSR.
        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("order invalid for {host}"),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("order timeout for {host}");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        // CSR with a fresh RSA key: CN and single SAN are both the host.
        let host_owned = host.to_string();
        let (key_pem, csr_der) = tokio::task::spawn_blocking(move || build_csr(&host_owned))
            .await
            .map_err(|e| anyhow::anyhow!("CSR generation task failed: {e}"))??;

        order.finalize(&csr_der).await?;

        let mut attempts = 0;
        let cert_pem = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("order valid but no certificate returned for {host}");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("certificate timeout for {host}");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                status => anyhow::bail!("unexpected order status {status:?} for {host}"),
            }
        };

        Ok(CertEntry { cert_pem, key_pem })
    }
}

async fn wait_for_authorization(
    order: &mut instant_acme::Order,
    host: &str,
) -> anyhow::Result<()> {
    let mut attempts = 0;
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        order.refresh().await?;

        let authorizations = order.authorizations().await?;
        let status = authorizations
            .iter()
            .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d.as_str() == host))
            .map(|a| a.status);

        match status {
            Some(AuthorizationStatus::Valid) => {
                info!(host, "Authorization valid");
                return Ok(());
            }
            Some(AuthorizationStatus::Invalid) => {
                anyhow::bail!("authorization failed for {host}");
            }
            Some(_) | None => {
                attempts += 1;
                if attempts > 30 {
                    anyhow::bail!("authorization timeout for {host}");
                }
                debug!(host, attempt = attempts, "Waiting for authorization");
            }
        }
    }
}

/// Build a PKCS#10 request for one host with a fresh 2048-bit RSA key.
fn build_csr(host: &str) -> anyhow::Result<(String, Vec<u8>)> {
    let rsa_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)?;
    let key_pem = rsa_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let key_der = rsa_key.to_pkcs8_der()?;
    let key_pair = KeyPair::from_pkcs8_der_and_sign_algo(
        &PrivatePkcs8KeyDer::from(key_der.as_bytes().to_vec()),
        &rcgen::PKCS_RSA_SHA256,
    )
    .map_err(|e| anyhow::anyhow!("loading CSR key: {e}"))?;

    let mut params = CertificateParams::new(vec![host.to_string()])?;
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, host);

    let csr = params.serialize_request(&key_pair)?;
    Ok((key_pem, csr.der().as_ref().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Fake client that counts orders and returns a self-issued pair
    /// pretending to be CA-issued material.
    struct CountingClient {
        orders: AtomicUsize,
        delay: Duration,
    }

    impl CountingClient {
        fn new() -> Self {
            Self {
                orders: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(delay: Duration) -> Self {
            Self {
                orders: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl AcmeClient for CountingClient {
        async fn order_certificate(
            &self,
            host: &str,
            _challenges: &ChallengeMap,
        ) -> anyhow::Result<CertEntry> {
            self.orders.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            certs::generate_self_signed(host)
        }
    }

    fn broker_with(
        dir: &std::path::Path,
        client: Option<Arc<dyn AcmeClient>>,
    ) -> AcmeBroker {
        let store = Arc::new(CertStore::new(dir).unwrap());
        AcmeBroker::with_client(store, client)
    }

    #[tokio::test]
    async fn test_unauthorized_host_never_contacts_acme() {
        let dir = tempdir().unwrap();
        let client = Arc::new(CountingClient::new());
        let broker = broker_with(dir.path(), Some(client.clone()));

        let entry = broker.ensure("stranger.example", false).await.unwrap();
        assert!(!certs::is_real(&entry.cert_pem));
        assert_eq!(client.orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_client_falls_back_to_self_signed() {
        let dir = tempdir().unwrap();
        let broker = broker_with(dir.path(), None);

        let entry = broker.ensure("mapped.example", true).await.unwrap();
        assert!(certs::is_valid(&entry.cert_pem));
        assert!(!certs::is_real(&entry.cert_pem));
    }

    #[tokio::test]
    async fn test_rate_limit_interval_blocks_second_attempt() {
        let dir = tempdir().unwrap();
        let client = Arc::new(CountingClient::new());
        let broker = broker_with(dir.path(), Some(client.clone()));

        broker.ensure("limited.example", true).await.unwrap();
        // The issued (fake) cert is self-signed so it fails the disk
        // "real" check on re-ensure, but the cache serves it while valid;
        // evict both to force the rate-limit path.
        broker.store.cache_evict("limited.example");
        std::fs::remove_file(dir.path().join("limited.example.crt")).unwrap();
        std::fs::remove_file(dir.path().join("limited.example.key")).unwrap();

        broker.ensure("limited.example", true).await.unwrap();
        assert_eq!(client.orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_flight_collapses_concurrent_ensures() {
        let dir = tempdir().unwrap();
        let client = Arc::new(CountingClient::with_delay(Duration::from_millis(300)));
        let broker = Arc::new(broker_with(dir.path(), Some(client.clone())));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let broker = Arc::clone(&broker);
            handles.push(tokio::spawn(async move {
                broker.ensure("flight.example", true).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(client.orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_entry_served_without_reorder() {
        let dir = tempdir().unwrap();
        let client = Arc::new(CountingClient::new());
        let broker = broker_with(dir.path(), Some(client.clone()));

        let first = broker.ensure("cached.example", true).await.unwrap();
        let second = broker.ensure("cached.example", true).await.unwrap();

        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(client.orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wildcard_covers_strict_subdomain() {
        let dir = tempdir().unwrap();
        let client = Arc::new(CountingClient::new());
        let broker = broker_with(dir.path(), Some(client.clone()));

        let wildcard = certs::generate_self_signed("*.example.com").unwrap();
        broker.store.persist("wildcard.example.com", &wildcard).unwrap();

        let entry = broker.ensure("app.example.com", true).await.unwrap();
        assert_eq!(entry.cert_pem, wildcard.cert_pem);
        assert_eq!(client.orders.load(Ordering::SeqCst), 0);

        // www does not count as a strict subdomain; it issues normally.
        broker.ensure("www.example.com", true).await.unwrap();
        assert_eq!(client.orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_challenge_roundtrip_memory_and_disk() {
        let dir = tempdir().unwrap();
        let challenges = ChallengeMap::new(dir.path());

        challenges.publish("tok-123", "tok-123.keyauth");
        assert_eq!(
            challenges.lookup("tok-123"),
            Some("tok-123.keyauth".to_string())
        );
        assert!(dir
            .path()
            .join(".well-known")
            .join("acme-challenge")
            .join("tok-123")
            .exists());

        challenges.withdraw("tok-123");
        assert_eq!(challenges.lookup("tok-123"), None);
    }

    #[tokio::test]
    async fn test_challenge_visible_across_instances() {
        let dir = tempdir().unwrap();
        let writer = ChallengeMap::new(dir.path());
        let reader = ChallengeMap::new(dir.path());

        writer.publish("shared-token", "shared.keyauth");
        assert_eq!(
            reader.lookup("shared-token"),
            Some("shared.keyauth".to_string())
        );
    }

    #[test]
    fn test_token_safety() {
        assert!(is_safe_token("AbC123-_x"));
        assert!(!is_safe_token(""));
        assert!(!is_safe_token("../../etc/passwd"));
        assert!(!is_safe_token("a/b"));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_released() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join(ACCOUNT_LOCK_FILE);

        assert!(acquire_lock(&lock_path).await);
        {
            let _guard = LockGuard {
                path: lock_path.clone(),
            };
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_disk_pair_preferred_over_issuance() {
        let dir = tempdir().unwrap();
        let client = Arc::new(CountingClient::new());
        let broker = broker_with(dir.path(), Some(client.clone()));

        let pair = certs::generate_self_signed("ondisk.example").unwrap();
        broker.store.persist("ondisk.example", &pair).unwrap();

        let entry = broker.ensure("ondisk.example", true).await.unwrap();
        assert_eq!(entry.cert_pem, pair.cert_pem);
        assert_eq!(client.orders.load(Ordering::SeqCst), 0);
    }
}
