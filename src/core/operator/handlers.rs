//! Watch callbacks registered by the reconciler. Each holds a weak handle so
//! a stored session never keeps the reconciler alive.
use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    crd::ScaleTargetKind,
    informer::WatchHandler,
    reconciler::Reconciler,
    workload::{compute_mode, workload_status},
};
use crate::ports::cluster::ObjectExt;

/// Drives mode switches from changes of the scale target workload.
pub struct ScaleTargetHandler {
    reconciler: Weak<Reconciler>,
    crd_namespace: String,
    crd_name: String,
    kind: ScaleTargetKind,
}

impl ScaleTargetHandler {
    pub fn new(
        reconciler: Weak<Reconciler>,
        crd_namespace: &str,
        crd_name: &str,
        kind: ScaleTargetKind,
    ) -> Self {
        Self {
            reconciler,
            crd_namespace: crd_namespace.to_string(),
            crd_name: crd_name.to_string(),
            kind,
        }
    }

    async fn handle(&self, object: Value) {
        let status = workload_status(self.kind, &object);
        let Some(mode) = compute_mode(status) else {
            tracing::debug!(
                "Scale target {}/{} in transition (replicas={}), keeping mode",
                object.namespace(),
                object.name(),
                status.replicas
            );
            return;
        };
        let Some(reconciler) = self.reconciler.upgrade() else {
            return;
        };
        if let Err(e) = reconciler
            .switch_mode(&self.crd_namespace, &self.crd_name, mode)
            .await
        {
            tracing::error!(
                "Mode switch for {}/{} failed: {:#}",
                self.crd_namespace,
                self.crd_name,
                e
            );
        }
    }
}

#[async_trait]
impl WatchHandler for ScaleTargetHandler {
    async fn on_add(&self, object: Value) {
        self.handle(object).await;
    }

    async fn on_update(&self, object: Value) {
        self.handle(object).await;
    }

    async fn on_delete(&self, object: Value) {
        tracing::warn!(
            "Scale target {}/{} of {}/{} was deleted",
            object.namespace(),
            object.name(),
            self.crd_namespace,
            self.crd_name
        );
    }
}

/// Keeps the private service in step with its public service.
pub struct PublicServiceHandler {
    reconciler: Weak<Reconciler>,
    service: String,
}

impl PublicServiceHandler {
    pub fn new(reconciler: Weak<Reconciler>, service: String) -> Self {
        Self {
            reconciler,
            service,
        }
    }
}

#[async_trait]
impl WatchHandler for PublicServiceHandler {
    async fn on_add(&self, object: Value) {
        self.on_update(object).await;
    }

    async fn on_update(&self, object: Value) {
        if let Some(reconciler) = self.reconciler.upgrade() {
            reconciler.sync_public_service(&object, &self.service).await;
        }
    }
}

/// Re-points proxied services when the resolver's pods change.
pub struct ResolverDeploymentHandler {
    reconciler: Weak<Reconciler>,
    crd_namespace: String,
    crd_name: String,
    service: String,
}

impl ResolverDeploymentHandler {
    pub fn new(
        reconciler: Weak<Reconciler>,
        crd_namespace: &str,
        crd_name: &str,
        service: &str,
    ) -> Self {
        Self {
            reconciler,
            crd_namespace: crd_namespace.to_string(),
            crd_name: crd_name.to_string(),
            service: service.to_string(),
        }
    }
}

#[async_trait]
impl WatchHandler for ResolverDeploymentHandler {
    async fn on_add(&self, object: Value) {
        self.on_update(object).await;
    }

    async fn on_update(&self, _object: Value) {
        if let Some(reconciler) = self.reconciler.upgrade() {
            reconciler
                .refresh_resolver_routing(&self.crd_namespace, &self.crd_name, &self.service)
                .await;
        }
    }
}
