use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stockhold::engine::{Engine, EngineConfig};
use stockhold::notify::NotifyHub;
use stockhold::tls::TlsFiles;
use stockhold::{observability, reaper, wire};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let metrics_port: Option<u16> = std::env::var("STOCKHOLD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    observability::init(metrics_port)?;

    let port = std::env::var("STOCKHOLD_PORT").unwrap_or_else(|_| "5434".into());
    let bind = std::env::var("STOCKHOLD_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("STOCKHOLD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("STOCKHOLD_PASSWORD").unwrap_or_else(|_| "stockhold".into());
    let max_connections: usize = env_or("STOCKHOLD_MAX_CONNECTIONS", 256);
    let compact_threshold: u64 = env_or("STOCKHOLD_COMPACT_THRESHOLD", 1000);
    let sweep_interval_ms: u64 = env_or("STOCKHOLD_SWEEP_INTERVAL_MS", 5000);
    let worker_id = std::env::var("STOCKHOLD_WORKER_ID")
        .unwrap_or_else(|_| format!("sweeper-{}", std::process::id()));

    let defaults = EngineConfig::default();
    let config = EngineConfig {
        default_reservation_minutes: env_or(
            "STOCKHOLD_DEFAULT_RESERVATION_MINUTES",
            defaults.default_reservation_minutes,
        ),
        lock_timeout: Duration::from_millis(env_or(
            "STOCKHOLD_LOCK_TIMEOUT_MS",
            defaults.lock_timeout.as_millis() as u64,
        )),
        claim_ttl_ms: env_or("STOCKHOLD_CLAIM_TTL_MS", defaults.claim_ttl_ms),
        retention_ms: env_or("STOCKHOLD_RETENTION_MS", defaults.retention_ms),
    };

    let tls_acceptor = TlsFiles::from_env()?
        .map(|files| files.acceptor())
        .transpose()?;

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("stockhold.wal");
    let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), config)?);

    tokio::spawn(reaper::run_reaper(
        engine.clone(),
        worker_id.clone(),
        Duration::from_millis(sweep_interval_ms),
    ));
    tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));
    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("stockhold listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!("  sweeper: {worker_id} every {sweep_interval_ms}ms");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                tracing::debug!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = wire::process_connection(socket, engine, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    tracing::warn!("signal handler failed: {e}");
                }
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("stockhold stopped");
    Ok(())
}
