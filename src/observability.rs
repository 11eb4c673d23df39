use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: claim attempts that reached a terminal outcome. Labels: strategy, outcome.
pub const CLAIMS_TOTAL: &str = "seatclaim_claims_total";

/// Histogram: end-to-end claim latency in seconds, retries included. Labels: strategy.
pub const CLAIM_DURATION_SECONDS: &str = "seatclaim_claim_duration_seconds";

/// Counter: optimistic retries after a version conflict.
pub const CLAIM_RETRIES_TOTAL: &str = "seatclaim_claim_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting for a row lock, in seconds.
pub const LOCK_WAIT_SECONDS: &str = "seatclaim_lock_wait_seconds";

/// Gauge: open transactions.
pub const TRANSACTIONS_ACTIVE: &str = "seatclaim_transactions_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatclaim_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatclaim_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
