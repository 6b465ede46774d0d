use std::{future::Future, sync::OnceLock, time::Duration};

use eyre::{Result, WrapErr};
use tokio::{signal, time::timeout};
use tokio_util::sync::CancellationToken;

/// Why the process is stopping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Triggered from code
    Requested,
}

/// Signal-driven shutdown for long-running commands.
///
/// Fans a single cancellation out to every task holding a [`token`](Self::token)
/// and bounds how long cleanup may take afterwards.
#[derive(Debug)]
pub struct GracefulShutdown {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with a 10-second drain timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(10))
    }

    pub fn with_timeout(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
            drain_timeout,
        }
    }

    /// Child token cancelled when shutdown starts
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason of the first trigger, if any
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Start shutdown. Later triggers keep the first reason.
    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            tracing::info!(?reason, "Shutdown initiated");
        } else {
            tracing::warn!(?reason, "Shutdown already initiated, ignoring");
        }
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM (or a manual trigger) and return the reason.
    pub async fn wait_for_signal(&self) -> Result<ShutdownReason> {
        let sigterm = sigterm()?;
        tracing::info!("Listening for SIGINT and SIGTERM");

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                self.trigger(ShutdownReason::Interrupt);
            }
            _ = sigterm => {
                self.trigger(ShutdownReason::Terminate);
            }
            _ = self.token.cancelled() => {}
        }

        Ok(self.reason().unwrap_or(ShutdownReason::Requested))
    }

    /// Run `cleanup` bounded by the drain timeout. Returns false if it timed out.
    pub async fn drain<F>(&self, cleanup: F) -> bool
    where
        F: Future<Output = ()>,
    {
        match timeout(self.drain_timeout, cleanup).await {
            Ok(()) => {
                tracing::info!("Graceful shutdown completed");
                true
            }
            Err(_) => {
                tracing::error!(
                    timeout = ?self.drain_timeout,
                    "Shutdown drain timed out, forcing exit"
                );
                false
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn sigterm() -> Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("Failed to register SIGTERM handler")?;
    Ok(async move {
        sigterm.recv().await;
    })
}

#[cfg(not(unix))]
fn sigterm() -> Result<impl Future<Output = ()>> {
    Ok(std::future::pending::<()>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_graceful_shutdown_creation() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        assert_eq!(shutdown.reason(), None);
    }

    #[tokio::test]
    async fn test_trigger_cancels_tokens() {
        let shutdown = GracefulShutdown::new();
        let token = shutdown.token();

        shutdown.trigger(ShutdownReason::Requested);
        assert!(shutdown.is_shutdown_initiated());
        assert!(token.is_cancelled());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Requested));
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger(ShutdownReason::Terminate);
        shutdown.trigger(ShutdownReason::Interrupt);
        assert_eq!(shutdown.reason(), Some(ShutdownReason::Terminate));
    }

    #[tokio::test]
    async fn test_wait_returns_on_manual_trigger() {
        let shutdown = std::sync::Arc::new(GracefulShutdown::new());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_signal().await })
        };

        shutdown.trigger(ShutdownReason::Requested);
        let reason = waiter.await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let shutdown = GracefulShutdown::with_timeout(Duration::from_millis(20));
        assert!(shutdown.drain(async {}).await);
        assert!(
            !shutdown
                .drain(tokio::time::sleep(Duration::from_secs(5)))
                .await
        );
    }
}
