use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "seatline_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "seatline_http_request_duration_seconds";

// ── Domain counters ─────────────────────────────────────────────

pub const RESERVATIONS_CREATED_TOTAL: &str = "seatline_reservations_created_total";
pub const RESERVATIONS_CONFIRMED_TOTAL: &str = "seatline_reservations_confirmed_total";
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "seatline_reservations_expired_total";
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "seatline_reservations_cancelled_total";

/// Counter: bookings or edits rejected because a table was already taken.
pub const CONFLICTS_TOTAL: &str = "seatline_conflicts_total";

/// Counter: holder messages delivered.
pub const MESSAGES_SENT_TOTAL: &str = "seatline_messages_sent_total";

/// Counter: holder messages that failed or timed out.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "seatline_notifications_failed_total";

/// Counter: admin requests refused.
pub const AUTH_FAILURES_TOTAL: &str = "seatline_auth_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open live-update streams.
pub const SUBSCRIBERS_ACTIVE: &str = "seatline_subscribers_active";

/// Counter: requests turned away at the in-flight limit.
pub const REQUESTS_REJECTED_TOTAL: &str = "seatline_requests_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatline_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a matched route template to a short label for metrics.
pub fn route_label(path: &str) -> &'static str {
    match path {
        "/api/reserve" => "reserve",
        "/api/confirm" | "/api/confirm/{token}" => "confirm",
        "/api/tables" => "tables",
        "/api/events" | "/api/events/tables/{id}" => "events",
        "/api/dashboard/reservations" => "dashboard_reservations",
        "/api/dashboard/tables" => "dashboard_tables",
        "/api/dashboard/reservations/cancel" | "/api/dashboard/reservations/{id}/cancel" => "cancel",
        "/api/dashboard/reservations/{id}" | "/api/dashboard/reservations/{id}/update" => "reservation",
        "/api/dashboard/tables/{id}/reservations" => "delete_by_table",
        "/health" => "health",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_labels_group_aliases() {
        assert_eq!(route_label("/api/confirm"), route_label("/api/confirm/{token}"));
        assert_eq!(route_label("/api/dashboard/reservations/{id}/cancel"), "cancel");
        assert_eq!(route_label("/nope"), "other");
    }
}
