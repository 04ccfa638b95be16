use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    core::names,
    ports::{
        cluster::{ClusterApi, ClusterError, ResourceKind},
        readiness::EndpointReadiness,
    },
};

/// Reads readiness from the EndpointSlices the control plane keeps for a
/// service.
pub struct EndpointSliceReadiness {
    cluster: Arc<dyn ClusterApi>,
}

impl EndpointSliceReadiness {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }
}

/// An endpoint counts when it has an address and is not marked unready.
fn has_ready_address(slice: &Value) -> bool {
    slice
        .get("endpoints")
        .and_then(Value::as_array)
        .is_some_and(|endpoints| {
            endpoints.iter().any(|ep| {
                let addressed = ep
                    .get("addresses")
                    .and_then(Value::as_array)
                    .is_some_and(|a| !a.is_empty());
                let ready = ep
                    .pointer("/conditions/ready")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                addressed && ready
            })
        })
}

#[async_trait]
impl EndpointReadiness for EndpointSliceReadiness {
    async fn has_ready_endpoints(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<bool, ClusterError> {
        let selector = format!("{}={}", names::SERVICE_NAME_LABEL, service);
        let slices = self
            .cluster
            .list(ResourceKind::EndpointSlice, Some(namespace), Some(&selector))
            .await?;
        Ok(slices.iter().any(has_ready_address))
    }
}
