use std::time::Duration;

use crate::config::models::{ClientConfig, ReconnectConfig, SnapshotConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Client configuration validator
pub struct ClientConfigValidator;

impl ClientConfigValidator {
    /// Validate the entire client configuration, reporting every problem at once
    pub fn validate(config: &ClientConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.api_base_url.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "api_base_url".to_string(),
            });
        } else if let Err(e) = Self::validate_url(&config.api_base_url, "api_base_url") {
            errors.push(e);
        }

        if let Some(channel_url) = &config.channel_url {
            if let Err(e) = Self::validate_websocket_url(channel_url, "channel_url") {
                errors.push(e);
            }
        }

        if let Some(token) = &config.auth_token {
            if token.trim().is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: "auth_token".to_string(),
                    message: "Cannot be blank when set".to_string(),
                });
            }
        }

        if let Err(mut reconnect_errors) = Self::validate_reconnect_config(&config.reconnect) {
            errors.append(&mut reconnect_errors);
        }

        if let Err(mut snapshot_errors) = Self::validate_snapshot_config(&config.snapshot) {
            errors.append(&mut snapshot_errors);
        }

        if config
            .logging
            .level
            .parse::<tracing_subscriber::EnvFilter>()
            .is_err()
        {
            errors.push(ValidationError::InvalidField {
                field: "logging.level".to_string(),
                message: format!("'{}' is not a valid filter directive", config.logging.level),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_websocket_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "ws" && url.scheme() != "wss" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "WebSocket URL scheme must be 'ws' or 'wss', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "WebSocket URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid WebSocket URL format: {e}"),
            }),
        }
    }

    fn parse_delay(value: &str, field: &str, errors: &mut Vec<ValidationError>) -> Option<Duration> {
        match humantime::parse_duration(value) {
            Ok(d) => Some(d),
            Err(e) => {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: format!("'{value}' is not a valid duration: {e}"),
                });
                None
            }
        }
    }

    fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let base = Self::parse_delay(&config.base_delay, "reconnect.base_delay", &mut errors);
        let max = Self::parse_delay(&config.max_delay, "reconnect.max_delay", &mut errors);

        if let Some(base) = base {
            if base.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: "reconnect.base_delay".to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if let (Some(base), Some(max)) = (base, max) {
            if base > max {
                errors.push(ValidationError::InvalidField {
                    field: "reconnect.max_delay".to_string(),
                    message: format!(
                        "Must not be smaller than base_delay ({})",
                        config.base_delay
                    ),
                });
            }
        }

        if !config.multiplier.is_finite() || config.multiplier < 1.0 {
            errors.push(ValidationError::InvalidField {
                field: "reconnect.multiplier".to_string(),
                message: format!("Must be at least 1.0, got {}", config.multiplier),
            });
        }

        if !(0.0..1.0).contains(&config.jitter) {
            errors.push(ValidationError::InvalidField {
                field: "reconnect.jitter".to_string(),
                message: format!("Must be in [0, 1), got {}", config.jitter),
            });
        }

        if config.max_consecutive_failures == 0 {
            errors.push(ValidationError::InvalidField {
                field: "reconnect.max_consecutive_failures".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_snapshot_config(config: &SnapshotConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.retry_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "snapshot.retry_interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.request_timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "snapshot.request_timeout_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.max_pending_deltas == 0 {
            errors.push(ValidationError::InvalidField {
                field: "snapshot.max_pending_deltas".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
