use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "repset_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "repset_command_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings confirmed.
pub const BOOKINGS_TOTAL: &str = "repset_bookings_total";

/// Counter: users placed on a waitlist.
pub const WAITLIST_JOINS_TOTAL: &str = "repset_waitlist_joins_total";

/// Counter: waitlist entries promoted to confirmed bookings.
pub const PROMOTIONS_TOTAL: &str = "repset_waitlist_promotions_total";

/// Counter: individual booking cancellations.
pub const BOOKING_CANCELLATIONS_TOTAL: &str = "repset_booking_cancellations_total";

/// Counter: whole-class cancellations.
pub const CLASS_CANCELLATIONS_TOTAL: &str = "repset_class_cancellations_total";

/// Counter: optimistic commits rejected on a stale version.
pub const VERSION_CONFLICTS_TOTAL: &str = "repset_version_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "repset_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "repset_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "repset_connections_rejected_total";

/// Counter: failed auth handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "repset_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "repset_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "repset_wal_flush_batch_size";

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

/// Map a Request variant to a short label for metrics.
pub fn command_label(req: &Request) -> &'static str {
    match req {
        Request::Auth { .. } => "auth",
        Request::UpsertCoach { .. } => "upsert_coach",
        Request::UpsertLocation { .. } => "upsert_location",
        Request::CreateClass { .. } => "create_class",
        Request::UpdateClass { .. } => "update_class",
        Request::CancelClass { .. } => "cancel_class",
        Request::Book { .. } => "book",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::LeaveWaitlist { .. } => "leave_waitlist",
        Request::GetClass { .. } => "get_class",
        Request::UpcomingClasses { .. } => "upcoming_classes",
        Request::CoachSchedule { .. } => "coach_schedule",
        Request::SearchClasses { .. } => "search_classes",
        Request::Utilization { .. } => "utilization",
        Request::CancellationCount { .. } => "cancellation_count",
        Request::UserWaitlist { .. } => "user_waitlist",
        Request::SetRule { .. } => "set_rule",
        Request::GetRules => "get_rules",
        Request::Listen { .. } => "listen",
        Request::ListenAll => "listen_all",
        Request::Unlisten { .. } => "unlisten",
        Request::UnlistenAll => "unlisten_all",
    }
}
