use std::net::SocketAddr;

use http::HeaderName;

use crate::config::models::{OperatorConfig, ResolverConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Checks loaded configuration before anything is started with it
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate_resolver(config: &ResolverConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (field, address) in [
            ("listen_addr", &config.listen_addr),
            ("internal_listen_addr", &config.internal_listen_addr),
        ] {
            if let Err(e) = Self::validate_listen_address(field, address) {
                errors.push(e);
            }
        }

        for (field, value) in [
            ("queue_size", config.queue_size),
            ("max_queue_concurrency", config.max_queue_concurrency),
            ("initial_capacity", config.initial_capacity),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "must be greater than 0".to_string(),
                });
            }
        }
        if config.initial_capacity > config.max_queue_concurrency {
            errors.push(ValidationError::InvalidField {
                field: "initial_capacity".to_string(),
                message: format!(
                    "{} exceeds max_queue_concurrency {}",
                    config.initial_capacity, config.max_queue_concurrency
                ),
            });
        }

        for (field, value) in [
            ("req_timeout", config.req_timeout),
            ("queue_retry_duration", config.queue_retry_duration),
        ] {
            if value.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "must be a positive duration".to_string(),
                });
            }
        }

        if config.max_idle_proxy_conns_per_host > config.max_idle_proxy_conns {
            errors.push(ValidationError::InvalidField {
                field: "max_idle_proxy_conns_per_host".to_string(),
                message: "exceeds max_idle_proxy_conns".to_string(),
            });
        }

        if let Err(e) = HeaderName::from_bytes(config.header_for_host.as_bytes()) {
            errors.push(ValidationError::InvalidField {
                field: "header_for_host".to_string(),
                message: e.to_string(),
            });
        }

        if let Err(e) = Self::validate_url(&config.operator_url, "operator_url") {
            errors.push(e);
        }

        Self::finish(errors)
    }

    pub fn validate_operator(config: &OperatorConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.elasti_pod_namespace.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "elasti_pod_namespace".to_string(),
            });
        }
        for (field, value) in [
            ("polling_variable", config.polling_interval),
            (
                "informer_health_check_interval",
                config.informer_health_check_interval,
            ),
        ] {
            if value.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "must be a positive duration".to_string(),
                });
            }
        }
        for (field, address) in [
            ("elasti_server_addr", &config.elasti_server_addr),
            ("metrics_bind_address", &config.metrics_bind_address),
            ("health_probe_bind_address", &config.health_probe_bind_address),
        ] {
            if let Err(e) = Self::validate_listen_address(field, address) {
                errors.push(e);
            }
        }

        Self::finish(errors)
    }

    /// `IP:PORT`, or `:PORT` for all interfaces
    fn validate_listen_address(field: &str, address: &str) -> ValidationResult<()> {
        let full = if address.starts_with(':') {
            format!("0.0.0.0{address}")
        } else {
            address.to_string()
        };
        if full.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: format!("{field} must be in format 'IP:PORT' or ':PORT'"),
            });
        }
        Ok(())
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

    fn finish(mut errors: Vec<ValidationError>) -> ValidationResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            n => {
                let mut message = format!("Found {n} validation errors:\n");
                for (i, error) in errors.iter().enumerate() {
                    message.push_str(&format!("  {}. {}\n", i + 1, error));
                }
                Err(ValidationError::ValidationFailed { message })
            }
        }
    }
}
