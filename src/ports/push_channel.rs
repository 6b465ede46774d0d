use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

/// Errors raised by the push channel and its transports.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelError {
    /// Network or channel level failure. Always retryable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The backend rejected the session token. Terminal for the session.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// An inbound frame could not be parsed. The frame is dropped.
    #[error("Malformed frame: {0}")]
    Decode(String),
}

impl ChannelError {
    /// Whether the connection manager may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Transport(_))
    }
}

/// Result type alias for push channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Ordered stream of raw text frames from one physical connection.
///
/// The stream ending (`None`) means the backend closed the connection.
/// `Err(Decode)` reports one unusable frame and the stream continues; any
/// other `Err` item means the connection broke and nothing follows it.
pub type FrameStream = Pin<Box<dyn Stream<Item = ChannelResult<String>> + Send>>;

/// PushTransport defines the port for opening the backend's push channel
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Open one physical connection authenticated with `auth_token`.
    ///
    /// # Returns
    /// The inbound frame stream, or `ChannelError::Auth` when the token is
    /// rejected and `ChannelError::Transport` for everything else.
    async fn open(&self, auth_token: &str) -> ChannelResult<FrameStream>;

    /// Human readable endpoint description used in logs.
    fn endpoint(&self) -> String;
}
