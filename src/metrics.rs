//! Lightweight instrumentation helpers for the dashboard client.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. It avoids embedding a concrete
//! exporter (the application can install any compatible recorder) while still
//! describing the client‑specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `axon_dash_channel_state` (gauge, 0 disconnected .. 3 error)
//! * `axon_dash_channel_reconnect_attempts_total` (counter)
//! * `axon_dash_channel_messages_total` (counter, label `type`)
//! * `axon_dash_decode_errors_total` (counter, label `source`)
//! * `axon_dash_deltas_applied_total` (counter)
//! * `axon_dash_deltas_buffered` (gauge)
//! * `axon_dash_resyncs_total` (counter)
//! * `axon_dash_snapshot_fetches_total` (counter, label `result`)
//! * `axon_dash_snapshot_fetch_duration_seconds` (histogram)
use std::{sync::Once, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};

use crate::core::model::{ConnectionState, Period};

pub const AXON_DASH_CHANNEL_STATE: &str = "axon_dash_channel_state";
pub const AXON_DASH_CHANNEL_RECONNECT_ATTEMPTS_TOTAL: &str =
    "axon_dash_channel_reconnect_attempts_total";
pub const AXON_DASH_CHANNEL_MESSAGES_TOTAL: &str = "axon_dash_channel_messages_total"; // labels: type
pub const AXON_DASH_DECODE_ERRORS_TOTAL: &str = "axon_dash_decode_errors_total"; // labels: source
pub const AXON_DASH_DELTAS_APPLIED_TOTAL: &str = "axon_dash_deltas_applied_total";
pub const AXON_DASH_DELTAS_BUFFERED: &str = "axon_dash_deltas_buffered";
pub const AXON_DASH_RESYNCS_TOTAL: &str = "axon_dash_resyncs_total";
pub const AXON_DASH_SNAPSHOT_FETCHES_TOTAL: &str = "axon_dash_snapshot_fetches_total"; // labels: period, result
pub const AXON_DASH_SNAPSHOT_FETCH_DURATION_SECONDS: &str =
    "axon_dash_snapshot_fetch_duration_seconds";

static DESCRIBE: Once = Once::new();

fn describe_all() {
    describe_gauge!(
        AXON_DASH_CHANNEL_STATE,
        "Push channel state (0 disconnected, 1 connecting, 2 connected, 3 error)."
    );
    describe_counter!(
        AXON_DASH_CHANNEL_RECONNECT_ATTEMPTS_TOTAL,
        Unit::Count,
        "Automatic reconnection attempts made by the connection manager."
    );
    describe_counter!(
        AXON_DASH_CHANNEL_MESSAGES_TOTAL,
        Unit::Count,
        "Delta events received on the push channel (by type)."
    );
    describe_counter!(
        AXON_DASH_DECODE_ERRORS_TOTAL,
        Unit::Count,
        "Frames or payloads dropped because they could not be decoded (by source)."
    );
    describe_counter!(
        AXON_DASH_DELTAS_APPLIED_TOTAL,
        Unit::Count,
        "Global deltas merged into a reconciled view."
    );
    describe_gauge!(
        AXON_DASH_DELTAS_BUFFERED,
        "Deltas held back while a snapshot fetch is in flight."
    );
    describe_counter!(
        AXON_DASH_RESYNCS_TOTAL,
        Unit::Count,
        "Snapshot resyncs triggered by connection transitions or refreshes."
    );
    describe_counter!(
        AXON_DASH_SNAPSHOT_FETCHES_TOTAL,
        Unit::Count,
        "Snapshot pulls (by period and result)."
    );
    describe_histogram!(
        AXON_DASH_SNAPSHOT_FETCH_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of snapshot pulls."
    );
}

/// Record the connection manager's current state.
pub fn set_channel_state(state: ConnectionState) {
    gauge!(AXON_DASH_CHANNEL_STATE).set(state.as_gauge_value());
}

pub fn increment_reconnect_attempts() {
    counter!(AXON_DASH_CHANNEL_RECONNECT_ATTEMPTS_TOTAL).increment(1);
}

/// Count one delivered delta event.
pub fn increment_channel_messages(event_type: &str) {
    counter!(AXON_DASH_CHANNEL_MESSAGES_TOTAL, "type" => event_type.to_string()).increment(1);
}

/// Count one dropped frame or payload; `source` is `frame`, `global` or `entity`.
pub fn increment_decode_errors(source: &'static str) {
    counter!(AXON_DASH_DECODE_ERRORS_TOTAL, "source" => source).increment(1);
}

pub fn increment_deltas_applied() {
    counter!(AXON_DASH_DELTAS_APPLIED_TOTAL).increment(1);
}

pub fn set_deltas_buffered(count: usize) {
    gauge!(AXON_DASH_DELTAS_BUFFERED).set(count as f64);
}

pub fn increment_resyncs() {
    counter!(AXON_DASH_RESYNCS_TOTAL).increment(1);
}

fn record_snapshot_fetch(period: Period, result: &'static str, duration: std::time::Duration) {
    counter!(
        AXON_DASH_SNAPSHOT_FETCHES_TOTAL,
        "period" => period.as_str(),
        "result" => result
    )
    .increment(1);
    histogram!(
        AXON_DASH_SNAPSHOT_FETCH_DURATION_SECONDS,
        "period" => period.as_str()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper measuring a snapshot pull.
///
/// Records `result="error"` unless [`FetchTimer::succeeded`] was called, so
/// early returns are counted as failures.
pub struct FetchTimer {
    start: Instant,
    period: Period,
    ok: bool,
}

impl FetchTimer {
    pub fn new(period: Period) -> Self {
        Self {
            start: Instant::now(),
            period,
            ok: false,
        }
    }

    pub fn succeeded(&mut self) {
        self.ok = true;
    }
}

impl Drop for FetchTimer {
    fn drop(&mut self) {
        let result = if self.ok { "ok" } else { "error" };
        record_snapshot_fetch(self.period, result, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing dashboard client metrics");

    DESCRIBE.call_once(describe_all);

    tracing::info!("Dashboard client metrics initialized successfully");
    Ok(())
}
