//! Worker supervision and the per-worker serving loop
//!
//! The process plays one of two roles, decided by the `WORKER_ID`
//! environment variable. Without it, it is the supervisor: it spawns
//! `min(cpu count, 4)` copies of itself, each pinned to a stable worker
//! id, and respawns any that exit. With it, it is a peer worker: it
//! opens its own view of the mapping database, binds both listeners
//! with `SO_REUSEPORT` so the kernel balances accepts across workers,
//! and serves until told to stop.
//!
//! Workers coordinate nothing among themselves except through the ACME
//! broker's filesystem protocol; there is no leader.

use crate::acme::AcmeBroker;
use crate::certs::CertStore;
use crate::config::Config;
use crate::db::MappingStore;
use crate::proxy::Gateway;
use crate::tls::TlsGate;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Environment variable carrying the stable worker id into children.
pub const WORKER_ID_ENV: &str = "WORKER_ID";

/// Bind a listener that shares its port with sibling workers.
fn shared_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Run one worker to completion. Returns an error on fatal
/// initialization or storage failures; the caller exits with code 1.
pub async fn run_worker(config: Config, worker_id: usize) -> anyhow::Result<()> {
    info!(worker_id, "Worker starting");

    let store = Arc::new(MappingStore::open(&config.db_path)?);

    let cert_store = Arc::new(CertStore::new(&config.certs_dir)?);
    let broker = Arc::new(AcmeBroker::initialize(Arc::clone(&cert_store), config.acme_directory()).await);
    cert_store.warm_cache();

    if !broker.has_client() {
        warn!(worker_id, "No ACME account available, TLS will use self-signed certificates");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = Gateway::new(Arc::clone(&store), Arc::clone(&broker));

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_listener = shared_listener(http_addr)?;
    let http_handle = tokio::spawn(Arc::clone(&gateway).run_plain(
        http_listener,
        config.http_port,
        shutdown_rx.clone(),
    ));

    let https_handle = if config.enable_https {
        let https_addr: SocketAddr = format!("0.0.0.0:{}", config.https_port).parse()?;
        let https_listener = shared_listener(https_addr)?;
        let gate = Arc::new(TlsGate::new(Arc::clone(&store), Arc::clone(&broker)));
        Some(tokio::spawn(Arc::clone(&gateway).run_tls(
            https_listener,
            gate,
            config.https_port,
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    info!(
        worker_id,
        http_port = config.http_port,
        https_port = config.enable_https.then_some(config.https_port),
        "Worker serving"
    );

    wait_for_shutdown_signal().await;
    info!(worker_id, "Worker shutting down");
    let _ = shutdown_tx.send(true);

    let _ = http_handle.await;
    if let Some(handle) = https_handle {
        let _ = handle.await;
    }

    store.close();
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Stable id assignment for a fleet of `count` workers: the lowest id
/// not currently in use. A respawned worker reclaims the id its
/// predecessor held.
fn next_worker_id(active: &HashMap<usize, u32>, count: usize) -> Option<usize> {
    (0..count).find(|id| !active.contains_key(id))
}

/// Supervise the worker fleet. Returns the process exit code.
pub async fn run_supervisor(config: &Config) -> i32 {
    let count = config.worker_count();
    let exe = match std::env::current_exe() {
        Ok(path) => path,
        Err(e) => {
            error!(error = %e, "Cannot resolve own executable path");
            return 1;
        }
    };
    let args: Vec<String> = std::env::args().skip(1).collect();

    info!(workers = count, "Supervisor starting");

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(usize, Option<i32>)>();

    // worker id -> child pid
    let mut active: HashMap<usize, u32> = HashMap::new();

    for id in 0..count {
        match spawn_worker(&exe, &args, id, &exit_tx) {
            Ok(pid) => {
                active.insert(id, pid);
            }
            Err(e) => error!(worker_id = id, error = %e, "Failed to spawn worker"),
        }
    }

    let mut shutting_down = false;
    let mut last_exit_code = 0;

    loop {
        tokio::select! {
            Some((id, code)) = exit_rx.recv() => {
                active.remove(&id);
                if let Some(code) = code {
                    last_exit_code = code;
                }

                if shutting_down {
                    if active.is_empty() {
                        break;
                    }
                    continue;
                }

                warn!(worker_id = id, exit_code = ?code, "Worker exited, respawning");
                if let Some(respawn_id) = next_worker_id(&active, count) {
                    match spawn_worker(&exe, &args, respawn_id, &exit_tx) {
                        Ok(pid) => {
                            active.insert(respawn_id, pid);
                        }
                        Err(e) => {
                            // Supervisor failures are logged, never fatal.
                            error!(worker_id = respawn_id, error = %e, "Respawn failed");
                        }
                    }
                }
            }
            _ = wait_for_shutdown_signal() => {
                if !shutting_down {
                    info!("Supervisor shutting down, stopping workers");
                    shutting_down = true;
                    for (&id, &pid) in &active {
                        terminate(pid);
                        info!(worker_id = id, pid, "Sent termination signal");
                    }
                    if active.is_empty() {
                        break;
                    }
                }
            }
        }
    }

    info!(exit_code = last_exit_code, "Supervisor exiting");
    last_exit_code
}

fn spawn_worker(
    exe: &std::path::Path,
    args: &[String],
    id: usize,
    exit_tx: &mpsc::UnboundedSender<(usize, Option<i32>)>,
) -> anyhow::Result<u32> {
    let mut child = Command::new(exe)
        .args(args)
        .env(WORKER_ID_ENV, id.to_string())
        .spawn()?;

    let pid = child.id().unwrap_or(0);
    info!(worker_id = id, pid, "Worker spawned");

    let exit_tx = exit_tx.clone();
    tokio::spawn(async move {
        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                error!(worker_id = id, error = %e, "Failed to wait on worker");
                None
            }
        };
        let _ = exit_tx.send((id, code));
    });

    Ok(pid)
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}
