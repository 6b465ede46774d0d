use std::path::Path;

use config::{Config, ConfigBuilder, Environment, File, FileFormat, builder::DefaultState};
use eyre::{Context, Result};

use crate::config::models::ClientConfig;

/// Prefix of environment variables overlaying the file, e.g. `AXON_DASH__AUTH_TOKEN`
pub const ENV_PREFIX: &str = "AXON_DASH";

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

fn deserialize(builder: ConfigBuilder<DefaultState>, origin: &str) -> Result<ClientConfig> {
    let settings = builder
        .add_source(env_source())
        .build()
        .with_context(|| format!("Failed to build config from {origin}"))?;

    let client_config: ClientConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {origin}"))?;

    Ok(client_config)
}

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ClientConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ClientConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml, // Default to TOML
    };

    let builder = Config::builder().add_source(File::new(
        config_path
            .to_str()
            .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
        format,
    ));

    deserialize(builder, &config_path.display().to_string())
}

/// Load from `config_path` when given, otherwise from defaults plus environment.
pub fn load_config_or_default(config_path: Option<&str>) -> Result<ClientConfig> {
    match config_path {
        Some(path) => load_config_sync(path),
        None => deserialize(Config::builder(), "environment"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::core::model::Period;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
api_base_url = "http://gateway:8000/api/v1"
auth_token = "abc"
period = "7d"

[reconnect]
base_delay = "250ms"
max_consecutive_failures = 3

[snapshot]
retry_interval_secs = 2
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.api_base_url, "http://gateway:8000/api/v1");
        assert_eq!(config.period, Period::Last7Days);
        assert_eq!(config.reconnect.base_delay, "250ms");
        assert_eq!(config.reconnect.max_delay, "30s");
        assert_eq!(config.reconnect.max_consecutive_failures, 3);
        assert_eq!(config.snapshot.retry_interval_secs, 2);
        assert_eq!(config.snapshot.freshness_window_secs, 60);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "api_base_url": "https://dash.example.com/api/v1",
  "channel_url": "wss://push.example.com/ws",
  "logging": {
    "level": "debug",
    "json": true
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(
            config.resolved_channel_url().unwrap(),
            "wss://push.example.com/ws"
        );
        assert!(config.logging.json);
        assert_eq!(config.period, Period::Last30Days);
    }

    #[test]
    fn test_load_rejects_unknown_period() {
        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "period = \"1y\"\n").unwrap();

        assert!(load_config_sync(temp_file.path().to_str().unwrap()).is_err());
    }
}
