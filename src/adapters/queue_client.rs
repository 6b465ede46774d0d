use async_trait::async_trait;
use serde_json::Value;

use crate::{
    adapters::http_client::{ApiError, ApiHttpClient},
    ports::queue_api::{QueueApi, QueueApiError, QueueApiResult},
};

/// Queue introspection over the dashboard REST API
#[derive(Debug, Clone)]
pub struct HttpQueueClient {
    client: ApiHttpClient,
}

impl HttpQueueClient {
    pub fn new(client: ApiHttpClient) -> Self {
        Self { client }
    }
}

fn map_error(err: ApiError, subject: &str) -> QueueApiError {
    match err {
        ApiError::Status { status: 404, .. } => QueueApiError::NotFound(subject.to_string()),
        ApiError::Decode(msg) => QueueApiError::Decode(msg),
        other => QueueApiError::Transport(other.to_string()),
    }
}

#[async_trait]
impl QueueApi for HttpQueueClient {
    async fn list_queues(&self) -> QueueApiResult<Value> {
        self.client
            .get_json("dashboard/queues", &[])
            .await
            .map_err(|e| map_error(e, "queues"))
    }

    async fn active_requests(&self) -> QueueApiResult<Value> {
        self.client
            .get_json("dashboard/queues/active", &[])
            .await
            .map_err(|e| map_error(e, "active requests"))
    }

    async fn queue_config(&self) -> QueueApiResult<Value> {
        self.client
            .get_json("dashboard/queues/config", &[])
            .await
            .map_err(|e| map_error(e, "queue config"))
    }

    async fn update_queue_config(&self, config: &Value) -> QueueApiResult<Value> {
        self.client
            .put_json("dashboard/queues/config", config)
            .await
            .map_err(|e| map_error(e, "queue config"))
    }

    async fn cancel_request(&self, request_id: &str) -> QueueApiResult<()> {
        if request_id.is_empty() || request_id.contains('/') {
            return Err(QueueApiError::NotFound(request_id.to_string()));
        }
        tracing::info!(request_id, "Cancelling queued request");
        self.client
            .delete(&format!("dashboard/queues/{request_id}"))
            .await
            .map_err(|e| map_error(e, request_id))
    }
}
