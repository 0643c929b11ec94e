use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "carhire_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "carhire_query_duration_seconds";

/// Counter: booking operations. Labels: kind (rental/reservation), op, outcome.
pub const BOOKING_OPS_TOTAL: &str = "carhire_booking_ops_total";

/// Counter: conflict-query answers. Labels: result.
pub const AVAILABILITY_CHECKS_TOTAL: &str = "carhire_availability_checks_total";

/// Counter: events made durable. Labels: event.
pub const EVENTS_COMMITTED_TOTAL: &str = "carhire_events_committed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "carhire_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "carhire_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "carhire_connections_rejected_total";

/// Counter: logins refused (unknown or inactive principal).
pub const AUTH_FAILURES_TOTAL: &str = "carhire_auth_failures_total";

/// Gauge: cars whose occupancy flag disagreed at the last reconciliation.
pub const FLAG_DRIFT_CARS: &str = "carhire_flag_drift_cars";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "carhire_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "carhire_wal_flush_batch_size";

/// Counter: WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "carhire_wal_compactions_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertCar { .. } => "insert_car",
        Command::DeleteCar { .. } => "delete_car",
        Command::SetCarService { .. } => "set_car_service",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertInsurance { .. } => "insert_insurance",
        Command::RenewInsurance { .. } => "renew_insurance",
        Command::DeleteInsurance { .. } => "delete_insurance",
        Command::InsertRental { .. } => "insert_rental",
        Command::ReviseRental { .. } => "revise_rental",
        Command::SetRentalStatus { .. } => "set_rental_status",
        Command::ExtendRental { .. } => "extend_rental",
        Command::DeleteRental { .. } => "delete_rental",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::ReviseReservation { .. } => "revise_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::ConfirmReservation { .. } => "confirm_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeWindows { .. } => "select_free_windows",
        Command::SelectAvailableCars { .. } => "select_available_cars",
        Command::SelectCars { .. } => "select_cars",
        Command::SelectUsers { .. } => "select_users",
        Command::SelectInsurances { .. } => "select_insurances",
        Command::SelectExpiringInsurances { .. } => "select_expiring_insurances",
        Command::SelectRentals { .. } => "select_rentals",
        Command::SelectOverdueRentals => "select_overdue_rentals",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUpcomingReservations { .. } => "select_upcoming_reservations",
        Command::SelectAvailabilityDrift => "select_availability_drift",
    }
}
