use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors returned by the queue introspection endpoints
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueApiError {
    /// Connection failure or non-success status
    #[error("Queue API request failed: {0}")]
    Transport(String),

    /// The backend has no queued request with this id
    #[error("Queued request not found: {0}")]
    NotFound(String),

    /// Response body was not valid JSON
    #[error("Queue API decode error: {0}")]
    Decode(String),
}

/// Result type alias for queue API calls
pub type QueueApiResult<T> = Result<T, QueueApiError>;

/// Read/manage the gateway's request queues.
///
/// Payload shapes are owned by the backend, so they travel as raw JSON.
#[async_trait]
pub trait QueueApi: Send + Sync + 'static {
    /// `GET /dashboard/queues`
    async fn list_queues(&self) -> QueueApiResult<Value>;

    /// `GET /dashboard/queues/active`
    async fn active_requests(&self) -> QueueApiResult<Value>;

    /// `GET /dashboard/queues/config`
    async fn queue_config(&self) -> QueueApiResult<Value>;

    /// `PUT /dashboard/queues/config`
    async fn update_queue_config(&self, config: &Value) -> QueueApiResult<Value>;

    /// `DELETE /dashboard/queues/{request_id}`
    async fn cancel_request(&self, request_id: &str) -> QueueApiResult<()>;
}
