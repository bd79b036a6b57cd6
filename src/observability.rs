use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Booking flow ────────────────────────────────────────────────

/// Counter: reservations committed with their restriction.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "bookings_reservations_committed_total";

/// Counter: commits refused because the room was taken in the meantime.
pub const BOOKING_CONFLICTS_TOTAL: &str = "bookings_booking_conflicts_total";

/// Counter: availability searches (single room and all rooms).
pub const AVAILABILITY_QUERIES_TOTAL: &str = "bookings_availability_queries_total";

/// Counter: guest-detail submissions rejected by validation.
pub const VALIDATION_FAILURES_TOTAL: &str = "bookings_validation_failures_total";

/// Counter: requests whose session slot was missing or malformed.
pub const SESSION_VIOLATIONS_TOTAL: &str = "bookings_session_violations_total";

/// Gauge: live sessions after the last reaper pass.
pub const SESSIONS_ACTIVE: &str = "bookings_sessions_active";

/// Counter: calendar edits. Labels: outcome.
pub const CALENDAR_EDITS_TOTAL: &str = "bookings_calendar_edits_total";

// ── Notifications ───────────────────────────────────────────────

pub const NOTIFICATIONS_ENQUEUED_TOTAL: &str = "bookings_notifications_enqueued_total";
pub const NOTIFICATIONS_SENT_TOTAL: &str = "bookings_notifications_sent_total";
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "bookings_notifications_failed_total";

/// Counter: messages still queued when the dispatcher was told to discard.
pub const NOTIFICATIONS_DROPPED_TOTAL: &str = "bookings_notifications_dropped_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookings_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookings_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "bookings_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
