use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "workbay_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "workbay_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: booking attempts. Labels: outcome (`booked`, `rejected`).
pub const BOOKINGS_TOTAL: &str = "workbay_bookings_total";

/// Counter: lifecycle steps applied. Labels: status (the target).
pub const VISIT_TRANSITIONS_TOTAL: &str = "workbay_visit_transitions_total";

/// Histogram: candidate slots returned per availability query.
pub const SLOTS_OFFERED: &str = "workbay_slots_offered";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "workbay_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "workbay_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "workbay_connections_rejected_total";

/// Gauge: number of loaded shops.
pub const SHOPS_ACTIVE: &str = "workbay_shops_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "workbay_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "workbay_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "workbay_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertMechanic { .. } => "insert_mechanic",
        Command::DeleteMechanic { .. } => "delete_mechanic",
        Command::SelectMechanics => "select_mechanics",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertVisit { .. } => "insert_visit",
        Command::DeleteVisit { .. } => "delete_visit",
        Command::SelectVisits { .. } => "select_visits",
        Command::AdvanceVisit { .. } => "advance_visit",
    }
}
