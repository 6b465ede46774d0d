//! Configuration data structures for the dashboard client.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and include defaults so that a minimal config is a single
//! `api_base_url` line.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::model::Period;

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000/api/v1".to_string()
}

/// Reconnection policy of the push channel
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, humantime format (e.g. "500ms")
    pub base_delay: String,
    /// Upper bound for any single delay
    pub max_delay: String,
    /// Growth factor applied per consecutive failure
    pub multiplier: f64,
    /// Relative jitter, 0.3 means ±30%
    pub jitter: f64,
    /// Consecutive failures after which the manager stops retrying
    pub max_consecutive_failures: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: "500ms".to_string(),
            max_delay: "30s".to_string(),
            multiplier: 2.0,
            jitter: 0.3,
            max_consecutive_failures: 8,
        }
    }
}

/// Snapshot fetching and reconciliation settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// A cached snapshot younger than this seeds a new engine without a pull
    pub freshness_window_secs: u64,
    /// Delay between attempts after a failed fetch
    pub retry_interval_secs: u64,
    /// Periodic forced refresh, 0 disables
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Deltas buffered while a fetch is in flight
    pub max_pending_deltas: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 60,
            retry_interval_secs: 5,
            refresh_interval_secs: 0,
            request_timeout_secs: 10,
            max_pending_deltas: 10_000,
        }
    }
}

impl SnapshotConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// `None` when periodic refresh is disabled
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Log output settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// Include span enter/exit events
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            include_spans: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClientConfig {
    /// Base URL of the gateway's dashboard API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Explicit push channel URL, derived from `api_base_url` when absent
    #[serde(default)]
    pub channel_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Create a new client configuration builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// The push channel URL to dial.
    pub fn resolved_channel_url(&self) -> Result<String, String> {
        match &self.channel_url {
            Some(url) => Ok(url.clone()),
            None => derive_channel_url(&self.api_base_url),
        }
    }

    /// Token sent with every request, empty when none is configured
    pub fn token(&self) -> &str {
        self.auth_token.as_deref().unwrap_or_default()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            channel_url: None,
            auth_token: None,
            period: Period::default(),
            reconnect: ReconnectConfig::default(),
            snapshot: SnapshotConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Map `http(s)://host/base` to `ws(s)://host/base/ws`.
pub fn derive_channel_url(api_base_url: &str) -> Result<String, String> {
    let mut url = Url::parse(api_base_url)
        .map_err(|e| format!("Invalid api_base_url '{api_base_url}': {e}"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(format!("Unsupported api_base_url scheme '{other}'")),
    };
    url.set_scheme(scheme)
        .map_err(|_| format!("Cannot switch '{api_base_url}' to {scheme}"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

/// Builder for ClientConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct ClientConfigBuilder {
    api_base_url: Option<String>,
    channel_url: Option<String>,
    auth_token: Option<String>,
    period: Option<Period>,
    reconnect: Option<ReconnectConfig>,
    snapshot: Option<SnapshotConfig>,
    logging: Option<LoggingConfig>,
}

impl ClientConfigBuilder {
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn channel_url(mut self, url: impl Into<String>) -> Self {
        self.channel_url = Some(url.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = Some(config);
        self
    }

    pub fn snapshot(mut self, config: SnapshotConfig) -> Self {
        self.snapshot = Some(config);
        self
    }

    pub fn logging(mut self, config: LoggingConfig) -> Self {
        self.logging = Some(config);
        self
    }

    /// Build the final ClientConfig
    pub fn build(self) -> Result<ClientConfig, String> {
        let api_base_url = self
            .api_base_url
            .ok_or_else(|| "api_base_url is required".to_string())?;

        Ok(ClientConfig {
            api_base_url,
            channel_url: self.channel_url,
            auth_token: self.auth_token,
            period: self.period.unwrap_or_default(),
            reconnect: self.reconnect.unwrap_or_default(),
            snapshot: self.snapshot.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_channel_url() {
        assert_eq!(
            derive_channel_url("http://localhost:8000/api/v1").unwrap(),
            "ws://localhost:8000/api/v1/ws"
        );
        assert_eq!(
            derive_channel_url("https://dash.example.com/").unwrap(),
            "wss://dash.example.com/ws"
        );
        assert!(derive_channel_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_builder_requires_base_url() {
        assert!(ClientConfig::builder().build().is_err());

        let config = ClientConfig::builder()
            .api_base_url("http://gw:9000")
            .auth_token("t0k")
            .period(Period::Last7Days)
            .build()
            .unwrap();
        assert_eq!(config.token(), "t0k");
        assert_eq!(config.period, Period::Last7Days);
        assert_eq!(config.resolved_channel_url().unwrap(), "ws://gw:9000/ws");
    }

    #[test]
    fn test_refresh_interval_disabled_by_zero() {
        let snapshot = SnapshotConfig::default();
        assert!(snapshot.refresh_interval().is_none());

        let snapshot = SnapshotConfig {
            refresh_interval_secs: 15,
            ..SnapshotConfig::default()
        };
        assert_eq!(snapshot.refresh_interval(), Some(Duration::from_secs(15)));
    }
}
