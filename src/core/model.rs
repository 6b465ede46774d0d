//! Data model shared by the channel, the reconciliation engine and the
//! per-entity watcher.
//!
//! Wire payloads are deliberately lenient: counts are accepted as integers or
//! non-negative floats because the backend serialises them from a dynamically
//! typed runtime.
use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;

use crate::ports::push_channel::{ChannelError, ChannelResult};

/// Global usage delta event type
pub const METRICS_UPDATE: &str = "metrics.update";
/// Per-API usage delta event type
pub const API_METRICS_UPDATE: &str = "api.metrics.update";

const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Convert a byte count to GiB the way the dashboard reports it.
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Combine two means by weighting each with its observation count.
///
/// Returns `current_mean` unchanged when there are no observations at all.
pub fn weighted_mean(current_mean: f64, current_count: u64, added_mean: f64, added_count: u64) -> f64 {
    let total = current_count as f64 + added_count as f64;
    if total == 0.0 {
        return current_mean;
    }
    (current_mean * current_count as f64 + added_mean * added_count as f64) / total
}

/// Lifecycle state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Numeric encoding used for the channel state gauge.
    pub fn as_gauge_value(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Error => 3.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Reporting window of an aggregate snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "24h")]
    Last24Hours,
    #[serde(rename = "7d")]
    Last7Days,
    #[default]
    #[serde(rename = "30d")]
    Last30Days,
    #[serde(rename = "90d")]
    Last90Days,
}

impl Period {
    /// Wire form used in the `period` query parameter
    pub fn as_str(self) -> &'static str {
        match self {
            Period::Last24Hours => "24h",
            Period::Last7Days => "7d",
            Period::Last30Days => "30d",
            Period::Last90Days => "90d",
        }
    }

    pub fn all() -> [Period; 4] {
        [
            Period::Last24Hours,
            Period::Last7Days,
            Period::Last30Days,
            Period::Last90Days,
        ]
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported period '{0}' (expected one of 24h, 7d, 30d, 90d)")]
pub struct ParsePeriodError(pub String);

impl FromStr for Period {
    type Err = ParsePeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::all()
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| ParsePeriodError(s.to_string()))
    }
}

/// One message received on the push channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeltaEvent {
    /// Discriminator, e.g. `metrics.update`
    pub event_type: String,
    /// Payload, shape depends on `event_type`
    pub data: Value,
    /// Receipt order within one connection manager
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: Value,
}

impl DeltaEvent {
    /// Parse a raw text frame. Frames without a string `type` are rejected.
    pub fn parse(frame: &str, sequence: u64) -> ChannelResult<Self> {
        let raw: RawFrame =
            serde_json::from_str(frame).map_err(|e| ChannelError::Decode(e.to_string()))?;
        Ok(Self {
            event_type: raw.event_type,
            data: raw.data,
            sequence,
            received_at: Utc::now(),
        })
    }

    /// Build an event locally (used by in-memory transports and tests).
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            sequence: 0,
            received_at: Utc::now(),
        }
    }

    /// Decode the payload into a typed shape.
    pub fn decode<T: DeserializeOwned>(&self) -> ChannelResult<T> {
        T::deserialize(&self.data).map_err(|e| {
            ChannelError::Decode(format!("{} payload: {e}", self.event_type))
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireCount {
    Int(u64),
    Float(f64),
}

fn count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match WireCount::deserialize(deserializer)? {
        WireCount::Int(n) => Ok(n),
        WireCount::Float(f) if f.is_finite() && f >= 0.0 => Ok(f.round() as u64),
        WireCount::Float(f) => Err(serde::de::Error::custom(format!(
            "count must be a non-negative number, got {f}"
        ))),
    }
}

fn finite_non_negative<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(serde::de::Error::custom(format!(
            "expected a non-negative number, got {value}"
        )))
    }
}

/// Payload of a `metrics.update` event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlobalDelta {
    /// Requests observed since the previous delta
    #[serde(deserialize_with = "count")]
    pub requests: u64,
    #[serde(deserialize_with = "count")]
    pub bytes: u64,
    /// Mean latency over `requests` observations, in milliseconds
    #[serde(deserialize_with = "finite_non_negative")]
    pub avg_latency: f64,
}

/// Live metrics block of an `api.metrics.update` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMetrics {
    #[serde(default, deserialize_with = "count")]
    pub requests_today: u64,
    #[serde(default, deserialize_with = "count")]
    pub requests_hour: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub avg_latency_ms: f64,
    #[serde(default)]
    pub p95_latency_ms: f64,
    #[serde(default, deserialize_with = "count")]
    pub error_count: u64,
    #[serde(default)]
    pub last_request_at: Option<String>,
}

/// Payload of an `api.metrics.update` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMetricsUpdate {
    pub api_id: String,
    #[serde(default)]
    pub api_name: String,
    pub metrics: ApiMetrics,
}

/// Body of `GET /dashboard/stats/streaming`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPayload {
    #[serde(deserialize_with = "count")]
    pub total_streams: u64,
    #[serde(deserialize_with = "count")]
    pub total_bytes: u64,
    #[serde(default)]
    pub total_bytes_gb: Option<f64>,
    #[serde(default)]
    pub avg_duration_ms: Option<f64>,
    #[serde(default)]
    pub max_duration_ms: Option<f64>,
}

impl SnapshotPayload {
    pub fn into_snapshot(self, period: Period) -> Snapshot {
        Snapshot {
            period,
            total_streams: self.total_streams,
            total_bytes: self.total_bytes,
            total_bytes_gb: self
                .total_bytes_gb
                .unwrap_or_else(|| bytes_to_gb(self.total_bytes)),
            avg_duration_ms: self.avg_duration_ms.unwrap_or(0.0),
            max_duration_ms: self.max_duration_ms.unwrap_or(0.0),
        }
    }
}

/// Aggregate metrics for one reporting period.
///
/// `avg_duration_ms` is the mean over exactly `total_streams` observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub period: Period,
    pub total_streams: u64,
    pub total_bytes: u64,
    pub total_bytes_gb: f64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl Snapshot {
    /// Snapshot with `total_bytes_gb` derived from `total_bytes`.
    pub fn new(
        period: Period,
        total_streams: u64,
        total_bytes: u64,
        avg_duration_ms: f64,
        max_duration_ms: f64,
    ) -> Self {
        Self {
            period,
            total_streams,
            total_bytes,
            total_bytes_gb: bytes_to_gb(total_bytes),
            avg_duration_ms,
            max_duration_ms,
        }
    }
}

/// The engine's current view: the latest snapshot plus every delta merged
/// since it landed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciledView {
    pub period: Period,
    pub total_streams: u64,
    pub total_bytes: u64,
    pub total_bytes_gb: f64,
    pub avg_duration_ms: f64,
    /// Only refreshed by snapshots; deltas carry no maximum.
    pub max_duration_ms: f64,
    pub deltas_applied: u64,
    pub seeded_at: DateTime<Utc>,
    pub last_delta_at: Option<DateTime<Utc>>,
}

impl ReconciledView {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            period: snapshot.period,
            total_streams: snapshot.total_streams,
            total_bytes: snapshot.total_bytes,
            total_bytes_gb: snapshot.total_bytes_gb,
            avg_duration_ms: snapshot.avg_duration_ms,
            max_duration_ms: snapshot.max_duration_ms,
            deltas_applied: 0,
            seeded_at: Utc::now(),
            last_delta_at: None,
        }
    }

    /// Merge one global delta in place.
    pub fn apply(&mut self, delta: &GlobalDelta, at: DateTime<Utc>) {
        self.avg_duration_ms = weighted_mean(
            self.avg_duration_ms,
            self.total_streams,
            delta.avg_latency,
            delta.requests,
        );
        self.total_streams = self.total_streams.saturating_add(delta.requests);
        self.total_bytes = self.total_bytes.saturating_add(delta.bytes);
        self.total_bytes_gb = bytes_to_gb(self.total_bytes);
        self.deltas_applied += 1;
        self.last_delta_at = Some(at);
    }

    /// Whether the aggregate figures equal `snapshot` exactly.
    pub fn matches_snapshot(&self, snapshot: &Snapshot) -> bool {
        self.period == snapshot.period
            && self.total_streams == snapshot.total_streams
            && self.total_bytes == snapshot.total_bytes
            && self.total_bytes_gb == snapshot.total_bytes_gb
            && self.avg_duration_ms == snapshot.avg_duration_ms
            && self.max_duration_ms == snapshot.max_duration_ms
    }
}

/// What a consumer of the engine sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "view", rename_all = "snake_case")]
pub enum ViewStatus {
    /// No snapshot has ever been fetched for this period
    Loading,
    /// Seeded and merging deltas
    Live(ReconciledView),
    /// Last good view, served while a resync or retry is pending
    Stale(ReconciledView),
}

impl ViewStatus {
    pub fn view(&self) -> Option<&ReconciledView> {
        match self {
            ViewStatus::Loading => None,
            ViewStatus::Live(view) | ViewStatus::Stale(view) => Some(view),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ViewStatus::Loading)
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ViewStatus::Live(_))
    }
}
