use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status (ok, conflict, error).
pub const QUERIES_TOTAL: &str = "tutorslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "tutorslot_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: appointments committed (booked or rescheduled into).
pub const BOOKINGS_TOTAL: &str = "tutorslot_bookings_total";

/// Counter: bookings that passed the pre-check but lost the slot at commit.
pub const BOOKING_RACES_LOST_TOTAL: &str = "tutorslot_booking_races_lost_total";

/// Counter: cancellations. Labels: credited ("true"/"false").
pub const CANCELLATIONS_TOTAL: &str = "tutorslot_cancellations_total";

/// Counter: minutes returned to balances by credit-back.
pub const CREDITED_MINUTES_TOTAL: &str = "tutorslot_credited_minutes_total";

/// Counter: reservations that could not be released after a failed booking.
pub const RECONCILIATION_FAILURES_TOTAL: &str = "tutorslot_reconciliation_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "tutorslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "tutorslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "tutorslot_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "tutorslot_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "tutorslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorslot_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "tutorslot_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short, stable label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectAvailableSlots { .. } => "select_available_slots",
        Command::InsertAppointment { .. } => "book",
        Command::DeleteAppointment { .. } => "cancel",
        Command::InsertOutcome { .. } => "mark_outcome",
        Command::InsertReschedule { .. } => "reschedule",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::InsertWindow { .. } => "insert_window",
        Command::UpdateWindow { .. } => "update_window",
        Command::DeleteWindow { .. } => "delete_window",
        Command::SelectWindows { .. } => "select_windows",
        Command::InsertPurchase { .. } => "purchase",
        Command::SelectBalances { .. } => "select_balances",
        Command::InsertCreditBack { .. } => "credit_back",
    }
}
