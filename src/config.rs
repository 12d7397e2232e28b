//! Runtime configuration from CLI flags and environment variables

use clap::Parser;
use std::path::PathBuf;

/// Default ACME directory. Staging is never used implicitly: staging
/// certificates are not browser-trusted, so pointing here by accident
/// would break every real client.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Upper bound on the worker fleet regardless of CPU count.
pub const MAX_WORKERS: usize = 4;

/// Resilient HTTP/HTTPS reverse proxy with hot-swappable routing
#[derive(Parser, Debug, Clone)]
#[command(name = "routegate")]
#[command(version)]
#[command(about = "Routes HTTP/HTTPS and WebSocket traffic by domain and path prefix")]
pub struct Config {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value_t = 8443)]
    pub https_port: u16,

    /// Enable the TLS listener
    #[arg(long, env = "ENABLE_HTTPS", default_value_t = false)]
    pub enable_https: bool,

    /// Path of the SQLite mapping database
    #[arg(long, env = "DB_PATH", default_value = "./data/current.db")]
    pub db_path: PathBuf,

    /// Directory holding certificates, ACME account state and challenges
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    pub certs_dir: PathBuf,

    /// ACME directory URL
    #[arg(long, env = "ACME_DIRECTORY_URL")]
    pub acme_directory_url: Option<String>,

    /// Log filter (e.g. "info", "routegate=debug")
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Production mode: listen on 80/443 with HTTPS enabled
    #[arg(long, env = "PRODUCTION", default_value_t = false)]
    pub production: bool,

    /// Number of worker processes (capped at min(cpu count, 4))
    #[arg(long, env = "WORKERS")]
    pub workers: Option<usize>,
}

impl Config {
    /// Apply production-mode overrides: well-known ports and TLS on.
    pub fn with_production_defaults(mut self) -> Self {
        if self.production {
            self.http_port = 80;
            self.https_port = 443;
            self.enable_https = true;
        }
        self
    }

    pub fn acme_directory(&self) -> &str {
        self.acme_directory_url
            .as_deref()
            .unwrap_or(LETS_ENCRYPT_PRODUCTION)
    }

    /// Worker count: requested value if any, else one per CPU, always
    /// clamped to [1, MAX_WORKERS].
    pub fn worker_count(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.workers.unwrap_or(cpus).clamp(1, MAX_WORKERS.min(cpus.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["routegate"])
    }

    #[test]
    fn test_defaults() {
        let config = base_config();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.https_port, 8443);
        assert!(!config.enable_https);
        assert_eq!(config.acme_directory(), LETS_ENCRYPT_PRODUCTION);
    }

    #[test]
    fn test_production_defaults() {
        let config = Config::parse_from(["routegate", "--production"]).with_production_defaults();
        assert_eq!(config.http_port, 80);
        assert_eq!(config.https_port, 443);
        assert!(config.enable_https);
    }

    #[test]
    fn test_worker_count_capped() {
        let mut config = base_config();
        config.workers = Some(64);
        assert!(config.worker_count() <= MAX_WORKERS);

        config.workers = Some(1);
        assert_eq!(config.worker_count(), 1);
    }
}
