use async_trait::async_trait;

use crate::ports::cluster::ClusterError;

/// EndpointReadiness answers whether a service currently has at least one
/// ready endpoint address to receive traffic.
#[async_trait]
pub trait EndpointReadiness: Send + Sync + 'static {
    async fn has_ready_endpoints(&self, namespace: &str, service: &str)
    -> Result<bool, ClusterError>;
}
