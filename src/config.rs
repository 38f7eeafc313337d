//! Controller configuration
//!
//! Read once at start-up from `STRIDE_*` environment variables. Parsing goes
//! through a lookup function so it can be exercised without touching the
//! process environment.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default port for health, metrics and webhook endpoints
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Default bounded wait for a batch to become ready
pub const DEFAULT_BATCH_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Default controller name, used as event reporter and field manager
pub const DEFAULT_CONTROLLER_NAME: &str = "stride-controller";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    InvalidValue {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("STRIDE_WEBHOOK_TLS_CERT and STRIDE_WEBHOOK_TLS_KEY must be set together")]
    IncompleteTls,
}

/// Certificate and key files for serving the webhook over HTTPS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub health_port: u16,
    /// HTTPS is enabled when set
    pub webhook_tls: Option<TlsFiles>,
    pub batch_ready_timeout: Duration,
    pub controller_name: String,
    /// Pod name, reported as the event recorder instance
    pub instance: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            health_port: DEFAULT_HEALTH_PORT,
            webhook_tls: None,
            batch_ready_timeout: DEFAULT_BATCH_READY_TIMEOUT,
            controller_name: DEFAULT_CONTROLLER_NAME.to_string(),
            instance: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = ControllerConfig::default();

        if let Some(value) = get("STRIDE_HEALTH_PORT") {
            config.health_port = value
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|port| *port > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: "STRIDE_HEALTH_PORT",
                    expected: "a port between 1 and 65535",
                    value,
                })?;
        }

        if let Some(value) = get("STRIDE_BATCH_READY_TIMEOUT_SECONDS") {
            let seconds = value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: "STRIDE_BATCH_READY_TIMEOUT_SECONDS",
                    expected: "a positive number of seconds",
                    value,
                })?;
            config.batch_ready_timeout = Duration::from_secs(seconds);
        }

        if let Some(name) = get("STRIDE_CONTROLLER_NAME") {
            config.controller_name = name;
        }

        config.webhook_tls = match (get("STRIDE_WEBHOOK_TLS_CERT"), get("STRIDE_WEBHOOK_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        config.instance = get("POD_NAME");

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ControllerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.health_port, 8080);
        assert_eq!(config.batch_ready_timeout, Duration::from_secs(600));
        assert_eq!(config.controller_name, "stride-controller");
    }

    #[test]
    fn test_reads_all_variables() {
        let config = ControllerConfig::from_lookup(lookup(&[
            ("STRIDE_HEALTH_PORT", "9443"),
            ("STRIDE_BATCH_READY_TIMEOUT_SECONDS", "120"),
            ("STRIDE_CONTROLLER_NAME", "stride-test"),
            ("STRIDE_WEBHOOK_TLS_CERT", "/certs/tls.crt"),
            ("STRIDE_WEBHOOK_TLS_KEY", "/certs/tls.key"),
            ("POD_NAME", "stride-7d9f"),
        ]))
        .unwrap();

        assert_eq!(config.health_port, 9443);
        assert_eq!(config.batch_ready_timeout, Duration::from_secs(120));
        assert_eq!(config.controller_name, "stride-test");
        assert_eq!(
            config.webhook_tls,
            Some(TlsFiles {
                cert: PathBuf::from("/certs/tls.crt"),
                key: PathBuf::from("/certs/tls.key"),
            })
        );
        assert_eq!(config.instance.as_deref(), Some("stride-7d9f"));
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let config =
            ControllerConfig::from_lookup(lookup(&[("STRIDE_HEALTH_PORT", " ")])).unwrap();
        assert_eq!(config.health_port, DEFAULT_HEALTH_PORT);
    }

    #[test]
    fn test_rejects_invalid_numbers() {
        for (name, value) in [
            ("STRIDE_HEALTH_PORT", "0"),
            ("STRIDE_HEALTH_PORT", "http"),
            ("STRIDE_BATCH_READY_TIMEOUT_SECONDS", "0"),
            ("STRIDE_BATCH_READY_TIMEOUT_SECONDS", "-5"),
        ] {
            let err = ControllerConfig::from_lookup(lookup(&[(name, value)])).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { name: n, .. } if n == name),
                "{} = {}",
                name,
                value
            );
        }
    }

    #[test]
    fn test_rejects_half_configured_tls() {
        let err = ControllerConfig::from_lookup(lookup(&[(
            "STRIDE_WEBHOOK_TLS_CERT",
            "/certs/tls.crt",
        )]))
        .unwrap_err();
        assert_eq!(err, ConfigError::IncompleteTls);
    }
}
