use async_trait::async_trait;

use crate::{
    adapters::http_client::{ApiError, ApiHttpClient},
    core::model::{Period, Snapshot, SnapshotPayload},
    ports::snapshot_source::{FetchError, FetchResult, SnapshotSource},
};

/// Path of the aggregate streaming stats endpoint, relative to the API base
pub const STREAMING_STATS_PATH: &str = "dashboard/stats/streaming";

/// Snapshot fetcher over the dashboard REST API. Never caches.
#[derive(Debug, Clone)]
pub struct HttpSnapshotFetcher {
    client: ApiHttpClient,
}

impl HttpSnapshotFetcher {
    pub fn new(client: ApiHttpClient) -> Self {
        Self { client }
    }
}

impl From<ApiError> for FetchError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Decode(msg) => FetchError::Decode(msg),
            other => FetchError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotFetcher {
    async fn fetch(&self, period: Period) -> FetchResult<Snapshot> {
        let payload: SnapshotPayload = self
            .client
            .get_json(STREAMING_STATS_PATH, &[("period", period.as_str())])
            .await?;
        tracing::debug!(
            %period,
            total_streams = payload.total_streams,
            total_bytes = payload.total_bytes,
            "Snapshot received"
        );
        Ok(payload.into_snapshot(period))
    }
}
