//! Configuration data structures for the resolver and the operator.
//!
//! Field names are the lower-cased environment variable names, so the same
//! structs deserialize from a file or from the process environment. Every
//! field has a default; an empty environment yields a working setup.
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Durations are humantime strings (`30s`, `5m`); bare integers are seconds.
pub mod duration_str {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => match text.trim().parse::<u64>() {
                Ok(secs) => Ok(Duration::from_secs(secs)),
                Err(_) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
            },
        }
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }
}

/// Resolver settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    /// Public listener for proxied traffic
    pub listen_addr: String,
    /// Listener for `/metrics`, `/queue-status` and `/healthz`
    pub internal_listen_addr: String,
    /// Advisory cap on idle upstream connections
    pub max_idle_proxy_conns: usize,
    pub max_idle_proxy_conns_per_host: usize,
    /// Upper bound on how long one request may be held and forwarded
    #[serde(with = "duration_str")]
    pub req_timeout: Duration,
    /// Cooldown after a successful forward before a host takes traffic again
    #[serde(with = "duration_str")]
    pub traffic_re_enable_duration: Duration,
    /// Suppression window between two operator notifications for a service
    #[serde(with = "duration_str")]
    pub operator_retry_duration: Duration,
    /// Pause between readiness checks of a held request
    #[serde(with = "duration_str")]
    pub queue_retry_duration: Duration,
    pub queue_size: u32,
    pub max_queue_concurrency: u32,
    pub initial_capacity: u32,
    /// Header that overrides `Host` for routing
    pub header_for_host: String,
    pub operator_url: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8012".to_string(),
            internal_listen_addr: "0.0.0.0:8013".to_string(),
            max_idle_proxy_conns: 1000,
            max_idle_proxy_conns_per_host: 100,
            req_timeout: Duration::from_secs(600),
            traffic_re_enable_duration: Duration::from_secs(5),
            operator_retry_duration: Duration::from_secs(10),
            queue_retry_duration: Duration::from_secs(3),
            queue_size: 50_000,
            max_queue_concurrency: 100,
            initial_capacity: 100,
            header_for_host: "X-Envoy-Decorator-Operation".to_string(),
            operator_url: "http://elasti-operator-controller-service:8013".to_string(),
        }
    }
}

/// Operator settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespace the operator (and the resolver) runs in
    pub elasti_pod_namespace: String,
    /// Scale handler poll interval
    #[serde(rename = "polling_variable", with = "duration_str")]
    pub polling_interval: Duration,
    /// Listener for resolver notifications
    pub elasti_server_addr: String,
    #[serde(with = "duration_str")]
    pub informer_health_check_interval: Duration,
    pub metrics_bind_address: String,
    pub health_probe_bind_address: String,
    pub leader_elect: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            elasti_pod_namespace: "elasti".to_string(),
            polling_interval: Duration::from_secs(30),
            elasti_server_addr: "0.0.0.0:8013".to_string(),
            informer_health_check_interval: Duration::from_secs(5),
            metrics_bind_address: ":8080".to_string(),
            health_probe_bind_address: ":8081".to_string(),
            leader_elect: false,
        }
    }
}
