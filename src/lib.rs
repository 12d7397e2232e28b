//! Routegate - a resilient HTTP/HTTPS reverse proxy
//!
//! This library provides a domain-routing reverse proxy that:
//! - Routes HTTP traffic by Host header and longest path prefix, backed
//!   by a hot-swappable SQLite mapping table
//! - Rewrites matched path prefixes before forwarding upstream
//! - Streams request and response bodies without buffering
//! - Proxies WebSocket and other connection upgrades byte-for-byte
//! - Acquires TLS certificates on demand per SNI via ACME HTTP-01,
//!   falling back to self-signed material when issuance is unavailable
//! - Runs as a small fleet of peer worker processes sharing the
//!   listening sockets, respawned by a supervisor on crash

pub mod acme;
pub mod certs;
pub mod config;
pub mod db;
pub mod error;
pub mod proxy;
pub mod rewrite;
pub mod tls;
pub mod worker;

pub use config::Config;
pub use db::{Mapping, MappingStore};
pub use proxy::Gateway;
