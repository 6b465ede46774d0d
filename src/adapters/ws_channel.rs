//! WebSocket push transport.
//!
//! `tokio-tungstenite` based; inbound text frames only.
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Error as WsError, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::{debug, info};

use crate::{
    config::models::ClientConfig,
    ports::push_channel::{ChannelError, ChannelResult, FrameStream, PushTransport},
};

/// Push channel over WebSocket with bearer authentication at upgrade time
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Use `channel_url`, or derive it from `api_base_url`.
    pub fn from_config(config: &ClientConfig) -> eyre::Result<Self> {
        let url = config.resolved_channel_url().map_err(|e| eyre::eyre!(e))?;
        Ok(Self::new(url))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn map_connect_error(err: WsError) -> ChannelError {
    match err {
        WsError::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            ChannelError::Auth(format!("upgrade rejected with {}", resp.status()))
        }
        WsError::Http(resp) => {
            ChannelError::Transport(format!("upgrade failed with {}", resp.status()))
        }
        other => ChannelError::Transport(other.to_string()),
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn open(&self, auth_token: &str) -> ChannelResult<FrameStream> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Transport(format!("invalid channel url: {e}")))?;
        if !auth_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {auth_token}"))
                .map_err(|_| ChannelError::Auth("token is not a valid header value".to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, response) = connect_async(request).await.map_err(map_connect_error)?;
        info!(url = %self.url, status = %response.status(), "WebSocket connected");

        let frames = stream::unfold(Some(socket), |state| async move {
            let mut socket = state?;
            loop {
                match socket.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some((Ok(text.to_string()), Some(socket)));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let frame = String::from_utf8(data.to_vec())
                            .map_err(|e| ChannelError::Decode(format!("binary frame: {e}")));
                        return Some((frame, Some(socket)));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "WebSocket closed by peer");
                        return None;
                    }
                    // Ping/Pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Some((Err(ChannelError::Transport(e.to_string())), None));
                    }
                    None => return None,
                }
            }
        });

        Ok(Box::pin(frames))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
