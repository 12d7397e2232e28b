use clap::Parser;
use routegate::config::Config;
use routegate::worker;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = Config::parse().with_production_defaults();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Children carry WORKER_ID; its absence makes this the supervisor.
    let worker_id = std::env::var(worker::WORKER_ID_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok());

    let exit_code = match worker_id {
        Some(id) => match worker::run_worker(config, id).await {
            Ok(()) => 0,
            Err(e) => {
                error!(worker_id = id, error = %e, "Worker failed");
                1
            }
        },
        None => {
            info!(
                http_port = config.http_port,
                https_port = config.enable_https.then_some(config.https_port),
                db_path = %config.db_path.display(),
                certs_dir = %config.certs_dir.display(),
                "Starting routegate"
            );
            worker::run_supervisor(&config).await
        }
    };

    std::process::exit(exit_code);
}
