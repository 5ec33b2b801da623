//! Fire-and-forget statistics counters.
//!
//! Everything here goes through the `metrics` facade: whatever recorder
//! the embedding process installs receives the samples, and recording
//! failure is never an error for the pipeline. A background poller
//! snapshots the connector pools and refreshes the gauges.

use cinder_core::pool::GroupStats;
use cinder_core::RelayError;
use metrics::{counter, gauge, histogram};

pub fn connection_accepted(pool: &str) {
    counter!("cinder_connections_accepted_total", "pool" => pool.to_owned()).increment(1);
}

/// A socket accepted and immediately closed at a client ceiling.
pub fn connection_rejected(pool: &str) {
    counter!("cinder_connections_rejected_total", "pool" => pool.to_owned()).increment(1);
}

pub fn request_received(pool: &str, bytes: usize) {
    counter!("cinder_requests_total", "pool" => pool.to_owned()).increment(1);
    counter!("cinder_request_bytes_total", "pool" => pool.to_owned()).increment(bytes as u64);
}

pub fn request_forwarded(pool: &str, bytes: usize) {
    counter!("cinder_forwarded_total", "pool" => pool.to_owned()).increment(1);
    counter!("cinder_forwarded_bytes_total", "pool" => pool.to_owned()).increment(bytes as u64);
}

pub fn fragment_error(pool: &str) {
    counter!("cinder_fragment_errors_total", "pool" => pool.to_owned()).increment(1);
}

pub fn no_key_request(pool: &str) {
    counter!("cinder_without_key_requests_total", "pool" => pool.to_owned()).increment(1);
}

/// A forwarded request that came back failed.
pub fn job_failed(pool: &str, err: RelayError) {
    let kind = match err {
        RelayError::Protocol => "protocol",
        RelayError::NoKey => "no_key",
        RelayError::Fragment => "fragment",
        RelayError::ResourceExhausted => "resource_exhausted",
        RelayError::UpstreamUnavailable => "upstream_unavailable",
        RelayError::Timeout => "timeout",
        RelayError::ServerBusy => "server_busy",
    };
    counter!("cinder_job_failures_total", "pool" => pool.to_owned(), "kind" => kind).increment(1);
}

/// One helper job completed: a busy-to-free transition, with latency.
pub fn helper_job_done(group: &str, latency_us: u64) {
    counter!("cinder_helper_jobs_total", "group" => group.to_owned()).increment(1);
    histogram!("cinder_helper_latency_seconds", "group" => group.to_owned())
        .record(latency_us as f64 / 1e6);
}

/// Helper connection up/down transitions, reported by helper tasks.
pub fn helper_transition(group: &str, up: bool) {
    let state = if up { "up" } else { "down" };
    counter!("cinder_helper_transitions_total", "group" => group.to_owned(), "state" => state)
        .increment(1);
}

/// Refreshes per-group gauges from a pool snapshot.
pub fn record_group_gauges(stats: &[GroupStats]) {
    for g in stats {
        gauge!("cinder_helpers_busy", "group" => g.name.clone()).set(g.busy as f64);
        gauge!("cinder_helpers_ready", "group" => g.name.clone()).set(g.ready as f64);
        gauge!("cinder_queue_depth", "group" => g.name.clone()).set(g.queued as f64);
        gauge!("cinder_average_delay_us", "group" => g.name.clone())
            .set(g.average_delay_us as f64);
        counter!("cinder_jobs_expired_total", "group" => g.name.clone()).absolute(g.expired);
        counter!("cinder_jobs_shed_total", "group" => g.name.clone()).absolute(g.shed);
    }
}
