use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "stockhold_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "stockhold_query_duration_seconds";

// ── Connections ─────────────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "stockhold_connections_active";
pub const CONNECTIONS_TOTAL: &str = "stockhold_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stockhold_connections_rejected_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "stockhold_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "stockhold_wal_flush_batch_size";

// ── Inventory ───────────────────────────────────────────────────

/// Counter: reserve calls. Label: outcome (`placed`, `duplicate`, or an error kind code).
pub const RESERVATIONS_TOTAL: &str = "stockhold_reservations_total";

/// Counter: reservations released by the sweeper.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "stockhold_reservations_expired_total";

/// Counter: bulk adjustment lines. Label: outcome (`ok`, `error`).
pub const BULK_LINES_TOTAL: &str = "stockhold_bulk_lines_total";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertWarehouse { .. } => "insert_warehouse",
        Command::UpdateWarehouse { .. } => "update_warehouse",
        Command::SelectWarehouses { .. } => "select_warehouses",
        Command::InsertItem { .. } => "insert_item",
        Command::UpdateItem { .. } => "update_item",
        Command::SelectItem { .. } => "select_item",
        Command::ListItems { .. } => "list_items",
        Command::SelectLocations { .. } => "select_locations",
        Command::Reserve { .. } => "reserve",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservationsByReference { .. } => "select_reservations",
        Command::CheckAvailability { .. } => "check_availability",
        Command::BulkUpdate { .. } => "bulk_update",
        Command::SelectTransactions { .. } => "select_transactions",
    }
}
