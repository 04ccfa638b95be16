//! `prometheus` trigger: compare an instant query against a threshold.
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::ports::scaler::{Scaler, ScalerError, ScalerFactory, ScalerResult};

pub const TRIGGER_TYPE: &str = "prometheus";
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_UPTIME_FILTER: &str = r#"container="prometheus""#;

#[derive(Debug, Clone, PartialEq)]
pub struct PrometheusMetadata {
    pub server_address: String,
    pub query: String,
    pub threshold: f64,
    pub uptime_filter: String,
}

impl PrometheusMetadata {
    pub fn from_value(metadata: &Value) -> ScalerResult<Self> {
        let field = |name: &str| -> ScalerResult<String> {
            metadata
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| ScalerError::InvalidMetadata(format!("missing {name}")))
        };
        let threshold = match metadata.get("threshold") {
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| ScalerError::InvalidMetadata(format!("threshold {s:?}: {e}")))?,
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| ScalerError::InvalidMetadata("threshold out of range".into()))?,
            _ => return Err(ScalerError::InvalidMetadata("missing threshold".into())),
        };
        Ok(Self {
            server_address: field("serverAddress")?
                .trim_end_matches('/')
                .to_string(),
            query: field("query")?,
            threshold,
            uptime_filter: field("uptimeFilter").unwrap_or_else(|_| DEFAULT_UPTIME_FILTER.into()),
        })
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Sample>,
}

#[derive(Deserialize)]
struct Sample {
    #[serde(default)]
    value: Vec<Value>,
}

pub struct PrometheusScaler {
    client: reqwest::Client,
    metadata: PrometheusMetadata,
    cooldown: Duration,
}

impl PrometheusScaler {
    pub fn new(client: reqwest::Client, metadata: PrometheusMetadata, cooldown: Duration) -> Self {
        Self {
            client,
            metadata,
            cooldown,
        }
    }

    fn uptime_query(&self) -> String {
        format!(
            "min_over_time((max(up{{{}}}) or vector(0))[{}s:])",
            self.metadata.uptime_filter,
            self.cooldown.as_secs_f64().ceil() as u64
        )
    }

    /// Run an instant query expected to yield one sample. A null sample
    /// reads as -1.
    async fn execute(&self, query: &str) -> ScalerResult<f64> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let url = url::Url::parse_with_params(
            &format!("{}/api/v1/query", self.metadata.server_address),
            &[("query", query), ("time", now.as_str())],
        )
        .map_err(|e| ScalerError::InvalidMetadata(format!("serverAddress: {e}")))?;

        let response = self
            .client
            .get(url)
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ScalerError::Query(format!("{query}: {e}")))?;
        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| ScalerError::UnexpectedResult(format!("{query}: {e}")))?;

        let sample = match body.data.result.as_slice() {
            [one] => one,
            [] => {
                return Err(ScalerError::UnexpectedResult(format!(
                    "{query}: result is empty"
                )));
            }
            _ => {
                return Err(ScalerError::UnexpectedResult(format!(
                    "{query}: returned multiple elements"
                )));
            }
        };
        let value = match sample.value.get(1) {
            Some(Value::Null) => -1.0,
            Some(Value::String(s)) => s
                .parse::<f64>()
                .map_err(|e| ScalerError::UnexpectedResult(format!("{query}: {e}")))?,
            Some(other) => other.as_f64().ok_or_else(|| {
                ScalerError::UnexpectedResult(format!("{query}: value {other}"))
            })?,
            None => {
                return Err(ScalerError::UnexpectedResult(format!(
                    "{query}: not enough values"
                )));
            }
        };
        if value.is_infinite() {
            return Err(ScalerError::UnexpectedResult(format!(
                "{query}: returned {value}"
            )));
        }
        Ok(value)
    }
}

#[async_trait]
impl Scaler for PrometheusScaler {
    async fn is_healthy(&self) -> ScalerResult<bool> {
        Ok(self.execute(&self.uptime_query()).await? == 1.0)
    }

    async fn should_scale_to_zero(&self) -> ScalerResult<bool> {
        let value = self.execute(&self.metadata.query).await?;
        Ok(value != -1.0 && value < self.metadata.threshold)
    }

    async fn should_scale_from_zero(&self) -> ScalerResult<bool> {
        let value = self.execute(&self.metadata.query).await?;
        Ok(value == -1.0 || value >= self.metadata.threshold)
    }

    async fn close(&self) -> ScalerResult<()> {
        Ok(())
    }
}

/// Creates scalers for the trigger types this build supports.
pub struct TriggerScalerFactory {
    client: reqwest::Client,
}

impl TriggerScalerFactory {
    pub fn new() -> eyre::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(QUERY_TIMEOUT).build()?,
        })
    }
}

impl ScalerFactory for TriggerScalerFactory {
    fn create(
        &self,
        trigger_type: &str,
        metadata: &Value,
        cooldown: Duration,
    ) -> ScalerResult<Box<dyn Scaler>> {
        match trigger_type {
            TRIGGER_TYPE => Ok(Box::new(PrometheusScaler::new(
                self.client.clone(),
                PrometheusMetadata::from_value(metadata)?,
                cooldown,
            ))),
            other => Err(ScalerError::UnsupportedTrigger(other.to_string())),
        }
    }
}
