use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, header};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::config::models::ClientConfig;

const USER_AGENT: &str = concat!("Axon-Dash/", env!("CARGO_PKG_VERSION"));

/// Errors returned by [`ApiHttpClient`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiError {
    /// Connection, TLS or timeout failure
    #[error("Request failed: {0}")]
    Transport(String),

    /// Non-success status code
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    /// Body is not the expected JSON
    #[error("Invalid response body: {0}")]
    Decode(String),
}

/// Authenticated JSON client for the dashboard REST API.
///
/// Responsibilities:
/// * Resolves paths against the configured base URL
/// * Injects `Authorization: Bearer` and a client `User-Agent`
/// * Separates transport, status and decode failures
///
/// Retries are the caller's business.
#[derive(Debug, Clone)]
pub struct ApiHttpClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ApiHttpClient {
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ApiError> {
        Self::new(
            &config.api_base_url,
            config.auth_token.clone(),
            config.snapshot.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read error response body");
            String::new()
        });
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `GET path?query` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError> {
        tracing::debug!(path, "GET");
        let resp = self.send(self.request(Method::GET, path).query(query)).await?;
        Self::decode(resp).await
    }

    /// `PUT path` with a JSON body and decode the JSON response.
    pub async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        tracing::debug!(path, "PUT");
        let resp = self.send(self.request(Method::PUT, path).json(body)).await?;
        Self::decode(resp).await
    }

    /// `DELETE path`, ignoring any response body.
    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        tracing::debug!(path, "DELETE");
        self.send(self.request(Method::DELETE, path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        Json, Router,
        http::{HeaderMap, StatusCode},
        routing::get,
    };
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/v1")
    }

    #[tokio::test]
    async fn test_sends_bearer_token() {
        let app = Router::new().route(
            "/api/v1/echo",
            get(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({ "auth": auth }))
            }),
        );
        let base = serve(app).await;

        let client = ApiHttpClient::new(&base, Some("s3cret".to_string()), Duration::from_secs(2))
            .unwrap();
        let body: Value = client.get_json("/echo", &[]).await.unwrap();
        assert_eq!(body["auth"], "Bearer s3cret");
    }

    #[tokio::test]
    async fn test_maps_status_and_decode_errors() {
        let app = Router::new()
            .route("/api/v1/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route("/api/v1/text", get(|| async { "plain text" }));
        let base = serve(app).await;
        let client = ApiHttpClient::new(&base, None, Duration::from_secs(2)).unwrap();

        let missing = client.get_json::<Value>("missing", &[]).await;
        assert!(matches!(missing, Err(ApiError::Status { status: 404, .. })));

        let text = client.get_json::<Value>("text", &[]).await;
        assert!(matches!(text, Err(ApiError::Decode(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client =
            ApiHttpClient::new(&format!("http://{addr}"), None, Duration::from_secs(2)).unwrap();
        let result = client.get_json::<Value>("anything", &[]).await;
        assert!(matches!(result, Err(ApiError::Transport(_))));
    }
}
