//! Periodic scale-to-zero / scale-from-zero decisions driven by triggers.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use eyre::WrapErr;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{
    crd::{ElastiService, Mode, ScaleTargetKind},
    workload::spec_replicas,
};
use crate::{
    metrics,
    ports::{
        cluster::{ClusterApi, ResourceKind},
        scaler::{Scaler, ScalerFactory},
    },
    utils::KeyedLocks,
};

pub const KEDA_PAUSED_ANNOTATION: &str = "autoscaling.keda.sh/paused";
pub const KEDA_PAUSED_REPLICAS_ANNOTATION: &str = "autoscaling.keda.sh/paused-replicas";
const EVENT_SOURCE: &str = "elasti-operator";

/// Direction of a scale action, used for logs, events and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ToZero,
    FromZero,
}

impl Direction {
    fn reason(self, ok: bool) -> &'static str {
        match (self, ok) {
            (Self::ToZero, true) => "ScaledDownToZero",
            (Self::ToZero, false) => "ScaleToZeroFailed",
            (Self::FromZero, true) => "ScaledUpFromZero",
            (Self::FromZero, false) => "ScaleFromZeroFailed",
        }
    }
}

pub struct ScaleHandler {
    cluster: Arc<dyn ClusterApi>,
    scalers: Arc<dyn ScalerFactory>,
    scale_locks: KeyedLocks,
    polling_interval: Duration,
}

impl ScaleHandler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        scalers: Arc<dyn ScalerFactory>,
        polling_interval: Duration,
    ) -> Self {
        Self {
            cluster,
            scalers,
            scale_locks: KeyedLocks::new(),
            polling_interval,
        }
    }

    /// Evaluate every ElastiService once per polling interval until `shutdown`.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        tracing::info!(
            "Scale handler polling every {}",
            humantime::format_duration(self.polling_interval)
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_and_scale().await {
                        tracing::error!("Scale check failed: {:#}", e);
                    }
                }
            }
        }
        tracing::info!("Scale handler stopped");
    }

    /// One pass over all ElastiServices. Serving ones are checked for
    /// scale-to-zero, the rest for scale-from-zero.
    pub async fn check_and_scale(&self) -> eyre::Result<()> {
        let items = self
            .cluster
            .list(ResourceKind::ElastiService, None, None)
            .await
            .wrap_err("failed to list ElastiServices")?;

        let services: Vec<ElastiService> = items
            .into_iter()
            .filter_map(|item| match ElastiService::from_value(item) {
                Ok(es) => Some(es),
                Err(e) => {
                    tracing::error!("Skipping malformed ElastiService: {}", e);
                    None
                }
            })
            .filter(|es| !es.is_being_deleted())
            .collect();

        join_all(services.iter().map(|es| async move {
            let result = if es.status.mode() == Some(Mode::Serve) {
                self.handle_scale_to_zero(es).await
            } else {
                self.handle_scale_from_zero(es).await
            };
            if let Err(e) = result {
                tracing::error!("Scale check for {} failed: {:#}", es.key(), e);
            }
        }))
        .await;
        Ok(())
    }

    /// Scale to zero when every trigger agrees and the cooldown since the last
    /// scale-up has passed. Any error means no action.
    pub async fn handle_scale_to_zero(&self, es: &ElastiService) -> eyre::Result<()> {
        if es.spec.triggers.is_empty() {
            tracing::debug!("{} has no triggers, not scaling to zero", es.key());
            return Ok(());
        }
        for trigger in &es.spec.triggers {
            let Some(scaler) = self.create_scaler(es, &trigger.trigger_type, &trigger.metadata) else {
                return Ok(());
            };
            let verdict = evaluate_to_zero(scaler.as_ref()).await;
            close_scaler(scaler.as_ref(), &trigger.trigger_type).await;
            metrics::increment_scaler_evaluation(&trigger.trigger_type, verdict.label());
            match verdict {
                Verdict::Yes => {}
                Verdict::No => return Ok(()),
                Verdict::Unhealthy => {
                    tracing::info!(
                        "Trigger {} of {} is unhealthy, skipping scale to zero",
                        trigger.trigger_type,
                        es.key()
                    );
                    return Ok(());
                }
                Verdict::Failed(e) => {
                    tracing::warn!(
                        "Trigger {} of {} failed, not scaling: {}",
                        trigger.trigger_type,
                        es.key(),
                        e
                    );
                    return Ok(());
                }
            }
        }

        // never scaled up by us means no cooldown applies
        if let Some(scaled_up) = es.status.last_scaled_up_time {
            // a timestamp in the future reads as zero elapsed
            let elapsed = Utc::now()
                .signed_duration_since(scaled_up)
                .to_std()
                .unwrap_or_default();
            let cooldown = es.spec.cooldown();
            if elapsed < cooldown {
                tracing::info!(
                    "Skipping scale to zero of {}, cooldown of {} not met",
                    es.key(),
                    humantime::format_duration(cooldown)
                );
                return Ok(());
            }
        }

        if let Some(autoscaler) = es.spec.autoscaler.as_ref().filter(|a| a.is_keda()) {
            self.set_keda_paused(es.namespace(), &autoscaler.name, true)
                .await
                .wrap_err_with(|| format!("failed to pause ScaledObject of {}", es.key()))?;
        }

        self.scale_target_to_zero(es).await
    }

    /// Scale up when any trigger asks for it. Evaluation errors are not a
    /// reason to scale.
    pub async fn handle_scale_from_zero(&self, es: &ElastiService) -> eyre::Result<()> {
        let mut should_scale = false;
        for trigger in &es.spec.triggers {
            let Some(scaler) = self.create_scaler(es, &trigger.trigger_type, &trigger.metadata) else {
                continue;
            };
            let result = scaler.should_scale_from_zero().await;
            close_scaler(scaler.as_ref(), &trigger.trigger_type).await;
            match result {
                Ok(true) => {
                    metrics::increment_scaler_evaluation(&trigger.trigger_type, "scale");
                    should_scale = true;
                    break;
                }
                Ok(false) => metrics::increment_scaler_evaluation(&trigger.trigger_type, "hold"),
                Err(e) => {
                    metrics::increment_scaler_evaluation(&trigger.trigger_type, "error");
                    tracing::warn!(
                        "Trigger {} of {} failed: {}",
                        trigger.trigger_type,
                        es.key(),
                        e
                    );
                }
            }
        }
        if !should_scale {
            return Ok(());
        }

        self.scale_target_when_at_zero(es).await?;
        Ok(())
    }

    fn create_scaler(
        &self,
        es: &ElastiService,
        trigger_type: &str,
        metadata: &Value,
    ) -> Option<Box<dyn Scaler>> {
        match self
            .scalers
            .create(trigger_type, metadata, es.spec.cooldown())
        {
            Ok(scaler) => Some(scaler),
            Err(e) => {
                metrics::increment_scaler_evaluation(trigger_type, "error");
                tracing::warn!(
                    "Failed to create {} scaler for {}: {}",
                    trigger_type,
                    es.key(),
                    e
                );
                None
            }
        }
    }

    /// Set the target's replicas to zero.
    pub async fn scale_target_to_zero(&self, es: &ElastiService) -> eyre::Result<()> {
        let _guard = self.scale_locks.lock(&es.key()).await;
        tracing::info!("Scaling {} down to zero", es.key());
        let result = self.set_replicas(es, 0).await.map(|_| ());
        self.report(es, Direction::ToZero, &result).await;
        result
    }

    /// Restore `minTargetReplicas` if the target currently wants zero replicas;
    /// a running target is left alone. Returns whether a scale-up happened.
    pub async fn scale_target_when_at_zero(&self, es: &ElastiService) -> eyre::Result<bool> {
        let _guard = self.scale_locks.lock(&es.key()).await;
        let result = self.scale_up_if_at_zero(es).await;
        match &result {
            Ok(false) => {}
            Ok(true) => {
                let patch = json!({"status": {"lastScaledUpTime": Utc::now().to_rfc3339()}});
                if let Err(e) = self
                    .cluster
                    .patch_status(ResourceKind::ElastiService, es.namespace(), es.name(), patch)
                    .await
                {
                    // the scale-up itself went through
                    tracing::error!("Failed to record lastScaledUpTime for {}: {}", es.key(), e);
                }
                self.report(es, Direction::FromZero, &Ok(())).await;
            }
            Err(e) => {
                let failed: eyre::Result<()> = Err(eyre::eyre!("{e:#}"));
                self.report(es, Direction::FromZero, &failed).await;
            }
        }
        result
    }

    async fn scale_up_if_at_zero(&self, es: &ElastiService) -> eyre::Result<bool> {
        let (kind, target) = self.target_of(es)?;
        let workload = self
            .cluster
            .get(kind.resource_kind(), es.namespace(), target)
            .await
            .wrap_err_with(|| format!("failed to get scale target of {}", es.key()))?;
        if spec_replicas(&workload) != 0 {
            tracing::debug!("Scale target of {} is not at zero", es.key());
            return Ok(false);
        }
        // a paused ScaledObject pins the target at zero
        if let Some(autoscaler) = es.spec.autoscaler.as_ref().filter(|a| a.is_keda()) {
            self.set_keda_paused(es.namespace(), &autoscaler.name, false)
                .await
                .wrap_err_with(|| format!("failed to unpause ScaledObject of {}", es.key()))?;
        }
        tracing::info!(
            "Scaling {} up from zero to {} replica(s)",
            es.key(),
            es.spec.min_target_replicas
        );
        self.set_replicas(es, i64::from(es.spec.min_target_replicas))
            .await
    }

    /// Patch `spec.replicas` when it differs from `replicas`.
    async fn set_replicas(&self, es: &ElastiService, replicas: i64) -> eyre::Result<bool> {
        let (kind, target) = self.target_of(es)?;
        let resource = kind.resource_kind();
        let workload = self
            .cluster
            .get(resource, es.namespace(), target)
            .await
            .wrap_err_with(|| format!("failed to get {resource} {}/{target}", es.namespace()))?;
        if spec_replicas(&workload) == replicas {
            tracing::info!(
                "{} {}/{} already at {} replica(s)",
                resource,
                es.namespace(),
                target,
                replicas
            );
            return Ok(false);
        }
        self.cluster
            .patch(
                resource,
                es.namespace(),
                target,
                json!({"spec": {"replicas": replicas}}),
            )
            .await
            .wrap_err_with(|| format!("failed to scale {resource} {}/{target}", es.namespace()))?;
        Ok(true)
    }

    fn target_of<'a>(&self, es: &'a ElastiService) -> eyre::Result<(ScaleTargetKind, &'a str)> {
        let target = &es.spec.scale_target_ref;
        let kind = target
            .kind
            .parse::<ScaleTargetKind>()
            .wrap_err_with(|| format!("invalid scaleTargetRef of {}", es.key()))?;
        Ok((kind, target.name.as_str()))
    }

    async fn set_keda_paused(&self, namespace: &str, name: &str, paused: bool) -> eyre::Result<()> {
        let replicas = if paused { json!("0") } else { Value::Null };
        let patch = json!({"metadata": {"annotations": {
            KEDA_PAUSED_ANNOTATION: paused.to_string(),
            KEDA_PAUSED_REPLICAS_ANNOTATION: replicas,
        }}});
        self.cluster
            .patch(ResourceKind::ScaledObject, namespace, name, patch)
            .await?;
        tracing::info!("ScaledObject {}/{} paused={}", namespace, name, paused);
        Ok(())
    }

    async fn report(&self, es: &ElastiService, direction: Direction, result: &eyre::Result<()>) {
        let target = &es.spec.scale_target_ref.name;
        let error = result.as_ref().err().map(|e| format!("{e:#}"));
        metrics::increment_scale(&es.spec.service, target, error.as_deref());

        let message = match (&error, direction) {
            (None, Direction::ToZero) => format!("Scaled {target} down to zero"),
            (None, Direction::FromZero) => format!(
                "Scaled {target} up from zero to {} replica(s)",
                es.spec.min_target_replicas
            ),
            (Some(e), _) => format!("Failed to scale {target}: {e}"),
        };
        let event = scale_event(es, direction.reason(error.is_none()), error.is_none(), &message);
        if let Err(e) = self
            .cluster
            .create(ResourceKind::Event, es.namespace(), event)
            .await
        {
            tracing::warn!("Failed to record scale event for {}: {}", es.key(), e);
        }
    }
}

/// Core/v1 Event about a scale action on `es`.
pub fn scale_event(es: &ElastiService, reason: &str, normal: bool, message: &str) -> Value {
    let now = Utc::now().to_rfc3339();
    let mut involved = json!({
        "apiVersion": ResourceKind::ElastiService.api_version(),
        "kind": ResourceKind::ElastiService.kind(),
        "name": es.name(),
        "namespace": es.namespace(),
    });
    if let Some(uid) = &es.metadata.uid {
        involved["uid"] = json!(uid);
    }
    json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": {
            "name": format!("{}-{}", es.name(), uuid::Uuid::new_v4().simple()),
            "namespace": es.namespace(),
        },
        "involvedObject": involved,
        "reason": reason,
        "message": message,
        "type": if normal { "Normal" } else { "Warning" },
        "action": "Scale",
        "source": {"component": EVENT_SOURCE},
        "reportingComponent": EVENT_SOURCE,
        "firstTimestamp": now,
        "lastTimestamp": now,
        "count": 1,
    })
}

enum Verdict {
    Yes,
    No,
    Unhealthy,
    Failed(String),
}

impl Verdict {
    fn label(&self) -> &'static str {
        match self {
            Self::Yes => "scale",
            Self::No => "hold",
            Self::Unhealthy => "unhealthy",
            Self::Failed(_) => "error",
        }
    }
}

async fn evaluate_to_zero(scaler: &dyn Scaler) -> Verdict {
    match scaler.is_healthy().await {
        Ok(true) => {}
        Ok(false) => return Verdict::Unhealthy,
        Err(e) => return Verdict::Failed(e.to_string()),
    }
    match scaler.should_scale_to_zero().await {
        Ok(true) => Verdict::Yes,
        Ok(false) => Verdict::No,
        Err(e) => Verdict::Failed(e.to_string()),
    }
}

async fn close_scaler(scaler: &dyn Scaler, trigger_type: &str) {
    if let Err(e) = scaler.close().await {
        tracing::warn!("Failed to close {} scaler: {}", trigger_type, e);
    }
}
