use async_trait::async_trait;
use thiserror::Error;

use crate::core::model::{Period, Snapshot};

/// Errors returned when pulling an aggregate snapshot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FetchError {
    /// Network failure or non-success HTTP status
    #[error("Snapshot transport error: {0}")]
    Transport(String),

    /// The response body does not have the snapshot shape
    #[error("Snapshot decode error: {0}")]
    Decode(String),
}

/// Result type alias for snapshot fetches
pub type FetchResult<T> = Result<T, FetchError>;

/// SnapshotSource defines the port for pulling aggregate metrics.
///
/// Implementations must not cache: freshness policy belongs to the caller.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    /// Fetch the aggregate snapshot for `period`.
    async fn fetch(&self, period: Period) -> FetchResult<Snapshot>;
}
