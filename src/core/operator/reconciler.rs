//! ElastiService controller: finalizers, watches and proxy/serve transitions.
use std::sync::{Arc, Weak};

use chrono::Utc;
use eyre::{WrapErr, bail};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{
    crd::{ElastiService, Mode, ScaleTargetKind, ScaleTargetRef},
    directory::{CrdDetails, CrdDirectory},
    handlers::{PublicServiceHandler, ResolverDeploymentHandler, ScaleTargetHandler},
    informer::{InformerError, InformerManager, WatchRequest, informer_key},
    routing,
};
use crate::{
    core::names,
    metrics,
    ports::cluster::{ClusterApi, ClusterError, ObjectExt, ResourceKind, WatchEvent},
    utils::{Backoff, KeyedLocks},
};

/// Failed reconciles are requeued this many times before waiting for the
/// next change event.
const MAX_RECONCILE_ATTEMPTS: u32 = 5;

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    informer: Arc<InformerManager>,
    directory: Arc<CrdDirectory>,
    resolver_namespace: String,
    reconcile_locks: KeyedLocks,
    mode_locks: KeyedLocks,
    this: Weak<Reconciler>,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        informer: Arc<InformerManager>,
        directory: Arc<CrdDirectory>,
        resolver_namespace: impl Into<String>,
    ) -> Arc<Self> {
        let resolver_namespace = resolver_namespace.into();
        Arc::new_cyclic(|this| Self {
            cluster,
            informer,
            directory,
            resolver_namespace,
            reconcile_locks: KeyedLocks::new(),
            mode_locks: KeyedLocks::new(),
            this: this.clone(),
        })
    }

    pub fn directory(&self) -> &Arc<CrdDirectory> {
        &self.directory
    }

    pub fn informer(&self) -> &Arc<InformerManager> {
        &self.informer
    }

    /// Bring one ElastiService in line with its spec.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> eyre::Result<()> {
        let key = names::namespaced_key(namespace, name);
        let _guard = self.reconcile_locks.lock(&key).await;
        let mut timer = metrics::ReconcileTimer::new(name);

        let result = self.reconcile_locked(namespace, name).await;
        if let Err(e) = &result {
            timer.fail(&e.to_string());
        }
        result
    }

    async fn reconcile_locked(&self, namespace: &str, name: &str) -> eyre::Result<()> {
        let es = match self
            .cluster
            .get(ResourceKind::ElastiService, namespace, name)
            .await
        {
            Ok(value) => ElastiService::from_value(value)?,
            Err(e) if e.is_not_found() => {
                tracing::debug!("ElastiService {}/{} is gone, nothing to do", namespace, name);
                return Ok(());
            }
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("failed to get ElastiService {namespace}/{name}"));
            }
        };

        if es.is_being_deleted() {
            if es.has_finalizer() {
                self.finalize(&es).await?;
                self.set_finalizers(&es, without_finalizer(&es.metadata.finalizers))
                    .await?;
                tracing::info!("ElastiService {} finalized", es.key());
            }
            return Ok(());
        }

        if !es.has_finalizer() {
            let mut finalizers = es.metadata.finalizers.clone();
            finalizers.push(names::FINALIZER.to_string());
            self.set_finalizers(&es, finalizers).await?;
        }

        let target = &es.spec.scale_target_ref;
        if !target.is_complete() {
            bail!("ElastiService {} has an incomplete scaleTargetRef", es.key());
        }
        let kind: ScaleTargetKind = target.kind.parse()?;

        let previous = self.directory.get_crd(&es.service_key()).await;
        if let Some(previous) = previous {
            if previous.spec.scale_target_ref != *target {
                self.stop_scale_target_watch(&es, &previous.spec.scale_target_ref)
                    .await;
            }
        }

        self.directory
            .add_crd(
                &es.service_key(),
                CrdDetails {
                    crd_name: es.name().to_string(),
                    spec: es.spec.clone(),
                    status: es.status.clone(),
                },
            )
            .await;

        self.watch_public_service(&es).await;
        self.informer
            .add_watch(WatchRequest {
                crd_name: es.name().to_string(),
                crd_namespace: es.namespace().to_string(),
                resource: kind.resource_kind(),
                resource_name: target.name.clone(),
                resource_namespace: es.namespace().to_string(),
                handlers: Arc::new(ScaleTargetHandler::new(
                    self.this.clone(),
                    es.namespace(),
                    es.name(),
                    kind,
                )),
            })
            .await
            .wrap_err_with(|| format!("failed to watch scale target of {}", es.key()))?;

        tracing::info!("ElastiService {} reconciled", es.key());
        Ok(())
    }

    async fn watch_public_service(&self, es: &ElastiService) {
        let request = WatchRequest {
            crd_name: es.name().to_string(),
            crd_namespace: es.namespace().to_string(),
            resource: ResourceKind::Service,
            resource_name: es.spec.service.clone(),
            resource_namespace: es.namespace().to_string(),
            handlers: Arc::new(PublicServiceHandler::new(
                self.this.clone(),
                es.spec.service.clone(),
            )),
        };
        match self.informer.add_watch(request).await {
            Ok(()) => {}
            Err(InformerError::TargetNotFound(_)) => {
                tracing::warn!(
                    "Public service {}/{} not found, not watching it",
                    es.namespace(),
                    es.spec.service
                );
            }
            Err(e) => tracing::error!("Failed to watch public service of {}: {}", es.key(), e),
        }
    }

    async fn stop_scale_target_watch(&self, es: &ElastiService, old: &ScaleTargetRef) {
        let Ok(kind) = old.kind.parse::<ScaleTargetKind>() else {
            return;
        };
        let key = informer_key(es.name(), es.namespace(), kind.resource_kind(), &old.name);
        tracing::info!("Scale target of {} changed, stopping {}", es.key(), key);
        self.informer.stop_watch(&key).await;
    }

    async fn set_finalizers(&self, es: &ElastiService, finalizers: Vec<String>) -> eyre::Result<()> {
        self.cluster
            .patch(
                ResourceKind::ElastiService,
                es.namespace(),
                es.name(),
                json!({"metadata": {"finalizers": finalizers}}),
            )
            .await
            .wrap_err_with(|| format!("failed to update finalizers of {}", es.key()))?;
        Ok(())
    }

    /// Undo everything the operator created for a resource. Every step runs;
    /// failures are reported together.
    async fn finalize(&self, es: &ElastiService) -> eyre::Result<()> {
        tracing::info!("Finalizing ElastiService {}", es.key());
        self.informer
            .stop_for_crd(es.name(), es.namespace())
            .await;

        let mut failures = Vec::new();
        if let Err(e) = routing::delete_slices_to_resolver(
            self.cluster.as_ref(),
            es.namespace(),
            &es.spec.service,
        )
        .await
        {
            failures.push(format!("endpoint slices: {e}"));
        }
        if let Err(e) = routing::delete_private_service(
            self.cluster.as_ref(),
            es.namespace(),
            &es.spec.service,
        )
        .await
        {
            failures.push(format!("private service: {e}"));
        }

        self.directory.remove_crd(&es.service_key()).await;
        self.mode_locks.forget(&es.key()).await;

        if !failures.is_empty() {
            bail!("failed to finalize {}: {}", es.key(), failures.join("; "));
        }
        Ok(())
    }

    /// Apply `mode` to a resource and persist the attempt in its status.
    pub async fn switch_mode(&self, namespace: &str, name: &str, mode: Mode) -> eyre::Result<()> {
        let key = names::namespaced_key(namespace, name);
        let _guard = self.mode_locks.lock(&key).await;

        let es = match self
            .cluster
            .get(ResourceKind::ElastiService, namespace, name)
            .await
        {
            Ok(value) => ElastiService::from_value(value)?,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e).wrap_err_with(|| format!("failed to get ElastiService {key}")),
        };
        if es.is_being_deleted() {
            tracing::debug!("ElastiService {} is being deleted, skipping {} mode", key, mode);
            return Ok(());
        }

        tracing::info!("Switching {} to {} mode", key, mode);
        let result = match mode {
            Mode::Proxy => self.enable_proxy_mode(&es).await,
            Mode::Serve => self.enable_serve_mode(&es).await,
        };

        let status = json!({"status": {
            "lastReconciledTime": Utc::now().to_rfc3339(),
            "mode": mode.as_str(),
        }});
        if let Err(e) = self
            .cluster
            .patch_status(ResourceKind::ElastiService, namespace, name, status)
            .await
        {
            tracing::error!("Failed to update status of {}: {}", key, e);
        }
        self.directory
            .set_mode(&es.service_key(), mode.as_str())
            .await;
        metrics::set_mode(name, mode == Mode::Proxy);

        result.wrap_err_with(|| format!("failed to enable {mode} mode for {key}"))
    }

    async fn enable_proxy_mode(&self, es: &ElastiService) -> eyre::Result<()> {
        let public = self
            .cluster
            .get(ResourceKind::Service, es.namespace(), &es.spec.service)
            .await
            .wrap_err("failed to get public service")?;
        routing::ensure_private_service(self.cluster.as_ref(), &public, es)
            .await
            .wrap_err("failed to create private service")?;
        routing::upsert_slices_to_resolver(
            self.cluster.as_ref(),
            &self.resolver_namespace,
            es.namespace(),
            &es.spec.service,
        )
        .await
        .wrap_err("failed to point endpoint slices at the resolver")?;

        let request = WatchRequest {
            crd_name: es.name().to_string(),
            crd_namespace: es.namespace().to_string(),
            resource: ResourceKind::Deployment,
            resource_name: names::RESOLVER_DEPLOYMENT_NAME.to_string(),
            resource_namespace: self.resolver_namespace.clone(),
            handlers: Arc::new(ResolverDeploymentHandler::new(
                self.this.clone(),
                es.namespace(),
                es.name(),
                &es.spec.service,
            )),
        };
        if let Err(e) = self.informer.add_watch(request).await {
            tracing::warn!("Failed to watch resolver deployment for {}: {}", es.key(), e);
        }
        Ok(())
    }

    async fn enable_serve_mode(&self, es: &ElastiService) -> eyre::Result<()> {
        routing::delete_slices_to_resolver(self.cluster.as_ref(), es.namespace(), &es.spec.service)
            .await
            .wrap_err("failed to delete endpoint slices to the resolver")?;
        self.informer
            .stop_watch(&resolver_watch_key(es.name(), es.namespace()))
            .await;
        Ok(())
    }

    /// Copy selector and ports of an updated public service into its private twin.
    pub(crate) async fn sync_public_service(&self, public: &Value, expected_service: &str) {
        match routing::sync_private_service(self.cluster.as_ref(), public, expected_service).await {
            Ok(()) => {}
            Err(routing::RoutingError::Cluster(ClusterError::NotFound { .. })) => {
                tracing::debug!("Private service for {} not created yet", expected_service);
            }
            Err(e) => tracing::error!("Failed to sync private service for {}: {}", expected_service, e),
        }
    }

    /// Re-point a proxied service at the current resolver endpoints.
    pub(crate) async fn refresh_resolver_routing(&self, namespace: &str, name: &str, service: &str) {
        let _guard = self
            .mode_locks
            .lock(&names::namespaced_key(namespace, name))
            .await;
        let service_key = names::namespaced_key(namespace, service);
        let proxied = self
            .directory
            .get_crd(&service_key)
            .await
            .is_some_and(|d| d.status.mode() == Some(Mode::Proxy));
        if !proxied {
            return;
        }
        if let Err(e) = routing::upsert_slices_to_resolver(
            self.cluster.as_ref(),
            &self.resolver_namespace,
            namespace,
            service,
        )
        .await
        {
            tracing::error!("Failed to refresh resolver routing for {}: {}", service_key, e);
        }
    }

    /// Reconcile every existing ElastiService once, skipping those being deleted.
    pub async fn reconcile_existing(&self) -> eyre::Result<()> {
        let items = self
            .cluster
            .list(ResourceKind::ElastiService, None, None)
            .await
            .wrap_err("failed to list ElastiServices")?;
        tracing::info!("Reconciling {} existing ElastiService(s)", items.len());
        for item in items {
            let es = match ElastiService::from_value(item) {
                Ok(es) => es,
                Err(e) => {
                    tracing::error!("Skipping malformed ElastiService: {}", e);
                    continue;
                }
            };
            if es.is_being_deleted() {
                continue;
            }
            if let Err(e) = self.reconcile(es.namespace(), es.name()).await {
                tracing::error!("Initial reconcile of {} failed: {:#}", es.key(), e);
            }
        }
        Ok(())
    }

    /// Watch ElastiServices in all namespaces and reconcile each change until
    /// `shutdown` fires. A broken watch is reopened with backoff.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> eyre::Result<()> {
        let backoff = Backoff::restart();
        let mut failures = 0u32;
        loop {
            let mut stream = match self.cluster.watch(ResourceKind::ElastiService, "", None).await {
                Ok(stream) => stream,
                Err(e) => {
                    failures += 1;
                    tracing::error!("Failed to watch ElastiServices: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff.delay(failures)) => continue,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(WatchEvent::Added(object))) | Some(Ok(WatchEvent::Modified(object))) => {
                        failures = 0;
                        self.spawn_reconcile(&object, shutdown.clone());
                    }
                    Some(Ok(WatchEvent::Deleted(object))) => self.forget_deleted(object).await,
                    Some(Ok(WatchEvent::Synced)) => tracing::info!("ElastiService watch synced"),
                    Some(Err(e)) => {
                        tracing::error!("ElastiService watch failed: {}", e);
                        break;
                    }
                    None => {
                        tracing::warn!("ElastiService watch ended");
                        break;
                    }
                }
            }

            failures += 1;
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff.delay(failures)) => {}
            }
        }
    }

    fn spawn_reconcile(&self, object: &Value, shutdown: CancellationToken) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let namespace = object.namespace().to_string();
        let name = object.name().to_string();
        tokio::spawn(async move {
            let backoff = Backoff::restart();
            for attempt in 1..=MAX_RECONCILE_ATTEMPTS {
                match this.reconcile(&namespace, &name).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::error!(
                            "Reconcile of {}/{} failed (attempt {}): {:#}",
                            namespace,
                            name,
                            attempt,
                            e
                        );
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(backoff.delay(attempt)) => {}
                }
            }
        });
    }

    /// An ElastiService vanished without passing through the finalizer.
    async fn forget_deleted(&self, object: Value) {
        let Ok(es) = ElastiService::from_value(object) else {
            return;
        };
        let managed = self
            .directory
            .get_crd(&es.service_key())
            .await
            .is_some_and(|d| d.crd_name == es.name());
        if managed {
            tracing::info!("ElastiService {} deleted, dropping its watches", es.key());
            self.informer
                .stop_for_crd(es.name(), es.namespace())
                .await;
            self.directory.remove_crd(&es.service_key()).await;
        }
        self.reconcile_locks.forget(&es.key()).await;
        self.mode_locks.forget(&es.key()).await;
    }
}

pub fn resolver_watch_key(crd_name: &str, crd_namespace: &str) -> String {
    informer_key(
        crd_name,
        crd_namespace,
        ResourceKind::Deployment,
        names::RESOLVER_DEPLOYMENT_NAME,
    )
}

fn without_finalizer(finalizers: &[String]) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != names::FINALIZER)
        .cloned()
        .collect()
}
