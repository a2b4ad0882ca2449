use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use slotd::engine::Engine;
use slotd::reaper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("SLOTD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotd::observability::init(metrics_port);

    let data_dir = std::env::var("SLOTD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let reap_interval_secs: u64 = std::env::var("SLOTD_REAP_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300);
    let compact_threshold: u64 = std::env::var("SLOTD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("slots.wal");

    let engine = Arc::new(Engine::open(wal_path)?);
    info!("slotd store opened");
    info!("  data_dir: {data_dir}");
    info!("  slots: {}", engine.slot_count());
    info!("  configs: {}", engine.config_count());
    info!("  reap_interval: {reap_interval_secs}s");
    info!(
        "  metrics: {}",
        metrics_port.map_or("disabled".to_string(), |p| format!(
            "http://0.0.0.0:{p}/metrics"
        ))
    );

    let reaper_engine = engine.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper::run_reaper(reaper_engine, reap_interval_secs).await;
    });
    let compactor_engine = engine.clone();
    let compactor_handle = tokio::spawn(async move {
        reaper::run_compactor(compactor_engine, compact_threshold).await;
    });

    // Run until SIGTERM/ctrl-c, then stop the background tasks.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received");
    reaper_handle.abort();
    compactor_handle.abort();

    // Final compaction so the next open replays a minimal log.
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final WAL compaction failed: {e}");
    }

    info!("slotd stopped");
    Ok(())
}
