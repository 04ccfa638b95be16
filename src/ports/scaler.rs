use async_trait::async_trait;
use thiserror::Error;

/// Error type for scale trigger evaluation
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ScalerError {
    /// Trigger metadata could not be parsed
    #[error("Invalid trigger metadata: {0}")]
    InvalidMetadata(String),

    /// Trigger type has no scaler implementation
    #[error("Unsupported trigger type: {0}")]
    UnsupportedTrigger(String),

    /// The metric source could not be queried
    #[error("Query failed: {0}")]
    Query(String),

    /// The metric source answered with something unusable
    #[error("Unexpected query result: {0}")]
    UnexpectedResult(String),
}

/// Result type alias for scaler operations
pub type ScalerResult<T> = Result<T, ScalerError>;

/// Scaler evaluates one configured trigger of an ElastiService.
#[async_trait]
pub trait Scaler: Send + Sync {
    /// Whether the metric source itself is trustworthy right now.
    async fn is_healthy(&self) -> ScalerResult<bool>;

    async fn should_scale_to_zero(&self) -> ScalerResult<bool>;

    async fn should_scale_from_zero(&self) -> ScalerResult<bool>;

    /// Release any resources held by the scaler.
    async fn close(&self) -> ScalerResult<()>;
}

/// Builds a scaler for a trigger of a given type.
pub trait ScalerFactory: Send + Sync + 'static {
    fn create(
        &self,
        trigger_type: &str,
        metadata: &serde_json::Value,
        cooldown: std::time::Duration,
    ) -> ScalerResult<Box<dyn Scaler>>;
}
