use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: capacity claims granted.
pub const CLAIMS_TOTAL: &str = "slotd_claims_total";

/// Counter: capacity claims rejected (full slot or lost race).
pub const CLAIM_CONFLICTS_TOTAL: &str = "slotd_claim_conflicts_total";

/// Counter: capacity releases applied (no-op releases excluded).
pub const RELEASES_TOTAL: &str = "slotd_releases_total";

/// Counter: slots created, ad-hoc and generated alike.
pub const SLOTS_CREATED_TOTAL: &str = "slotd_slots_created_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: slots currently held in memory.
pub const SLOTS_ACTIVE: &str = "slotd_slots_active";

/// Gauge: availability configs currently held in memory.
pub const CONFIGS_ACTIVE: &str = "slotd_configs_active";

/// Counter: past-dated slots retired by the reaper.
pub const SLOTS_REAPED_TOTAL: &str = "slotd_slots_reaped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
