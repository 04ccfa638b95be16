//! Lease-based leader election so only one operator replica runs controllers.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use eyre::WrapErr;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::ports::cluster::{ClusterApi, ResourceKind};

pub const LEASE_NAME: &str = "elasti-operator-leader";
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RENEW_PERIOD: Duration = Duration::from_secs(5);

fn micro_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct LeaderElector {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_period: Duration,
}

impl LeaderElector {
    pub fn new(cluster: Arc<dyn ClusterApi>, namespace: &str, identity: &str) -> Self {
        Self {
            cluster,
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_period: RENEW_PERIOD,
        }
    }

    pub fn with_timing(mut self, lease_duration: Duration, renew_period: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.renew_period = renew_period;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// One election round. Returns whether this replica holds the lease now.
    pub async fn try_acquire_or_renew(&self) -> eyre::Result<bool> {
        let now = Utc::now();
        let lease = match self
            .cluster
            .get(ResourceKind::Lease, &self.namespace, LEASE_NAME)
            .await
        {
            Ok(lease) => lease,
            Err(e) if e.is_not_found() => {
                return match self
                    .cluster
                    .create(ResourceKind::Lease, &self.namespace, self.fresh_lease(now, 0))
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_already_exists() => Ok(false),
                    Err(e) => Err(e).wrap_err("failed to create leader lease"),
                };
            }
            Err(e) => return Err(e).wrap_err("failed to get leader lease"),
        };

        let holder = lease
            .pointer("/spec/holderIdentity")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if holder == self.identity {
            self.cluster
                .patch(
                    ResourceKind::Lease,
                    &self.namespace,
                    LEASE_NAME,
                    json!({"spec": {"renewTime": micro_time(now)}}),
                )
                .await
                .wrap_err("failed to renew leader lease")?;
            return Ok(true);
        }

        if !holder.is_empty() && !lease_expired(&lease, now) {
            return Ok(false);
        }

        let transitions = lease
            .pointer("/spec/leaseTransitions")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let mut takeover = self.fresh_lease(now, transitions + 1);
        if let Some(version) = lease.pointer("/metadata/resourceVersion") {
            takeover["metadata"]["resourceVersion"] = version.clone();
        }
        match self
            .cluster
            .replace(ResourceKind::Lease, &self.namespace, LEASE_NAME, takeover)
            .await
        {
            Ok(_) => {
                tracing::info!("Took over leader lease from {:?}", holder);
                Ok(true)
            }
            Err(e) => {
                tracing::debug!("Lost leader lease race: {}", e);
                Ok(false)
            }
        }
    }

    /// Block until the lease is held or `shutdown` fires. Returns false on shutdown.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        tracing::info!("Waiting for leader lease {}/{}", self.namespace, LEASE_NAME);
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    tracing::info!("Acquired leader lease as {}", self.identity);
                    return true;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Leader election round failed: {:#}", e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.renew_period) => {}
            }
        }
    }

    /// Keep renewing until renewal has failed for a full lease duration or
    /// `shutdown` fires. Returns true when leadership was lost.
    pub async fn renew_until_lost(&self, shutdown: &CancellationToken) -> bool {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.renew_period) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    tracing::error!("Leader lease taken by another replica");
                    return true;
                }
                Err(e) => {
                    tracing::warn!("Failed to renew leader lease: {:#}", e);
                    if last_renewed.elapsed() >= self.lease_duration {
                        tracing::error!("Leader lease expired");
                        return true;
                    }
                }
            }
        }
    }

    /// Give the lease up so a standby can take over without waiting it out.
    pub async fn release(&self) {
        let held = self
            .cluster
            .get(ResourceKind::Lease, &self.namespace, LEASE_NAME)
            .await
            .ok()
            .and_then(|l| l.pointer("/spec/holderIdentity").and_then(Value::as_str).map(str::to_string))
            .is_some_and(|holder| holder == self.identity);
        if !held {
            return;
        }
        if let Err(e) = self
            .cluster
            .patch(
                ResourceKind::Lease,
                &self.namespace,
                LEASE_NAME,
                json!({"spec": {"holderIdentity": null}}),
            )
            .await
        {
            tracing::warn!("Failed to release leader lease: {}", e);
        } else {
            tracing::info!("Released leader lease");
        }
    }

    fn fresh_lease(&self, now: DateTime<Utc>, transitions: i64) -> Value {
        json!({
            "apiVersion": ResourceKind::Lease.api_version(),
            "kind": ResourceKind::Lease.kind(),
            "metadata": {"name": LEASE_NAME, "namespace": self.namespace},
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": self.lease_duration.as_secs(),
                "acquireTime": micro_time(now),
                "renewTime": micro_time(now),
                "leaseTransitions": transitions,
            }
        })
    }
}

fn lease_expired(lease: &Value, now: DateTime<Utc>) -> bool {
    let Some(renewed) = lease
        .pointer("/spec/renewTime")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    else {
        return true;
    };
    let duration = lease
        .pointer("/spec/leaseDurationSeconds")
        .and_then(Value::as_i64)
        .unwrap_or(LEASE_DURATION.as_secs() as i64);
    renewed.with_timezone(&Utc) + chrono::Duration::seconds(duration) < now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryCluster;

    #[tokio::test]
    async fn test_single_holder() {
        let cluster = Arc::new(MemoryCluster::new());
        let a = LeaderElector::new(cluster.clone(), "elasti", "a");
        let b = LeaderElector::new(cluster.clone(), "elasti", "b");

        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        // renewal keeps it
        assert!(a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let cluster = Arc::new(MemoryCluster::new());
        let a = LeaderElector::new(cluster.clone(), "elasti", "a");
        assert!(a.try_acquire_or_renew().await.unwrap());

        let stale = micro_time(Utc::now() - chrono::Duration::seconds(60));
        cluster
            .patch(
                ResourceKind::Lease,
                "elasti",
                LEASE_NAME,
                json!({"spec": {"renewTime": stale}}),
            )
            .await
            .unwrap();

        let b = LeaderElector::new(cluster.clone(), "elasti", "b");
        assert!(b.try_acquire_or_renew().await.unwrap());
        let lease = cluster
            .get(ResourceKind::Lease, "elasti", LEASE_NAME)
            .await
            .unwrap();
        assert_eq!(lease["spec"]["holderIdentity"], "b");
        assert_eq!(lease["spec"]["leaseTransitions"], 1);
        assert!(!a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_hands_over() {
        let cluster = Arc::new(MemoryCluster::new());
        let a = LeaderElector::new(cluster.clone(), "elasti", "a");
        let b = LeaderElector::new(cluster.clone(), "elasti", "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        a.release().await;
        assert!(b.try_acquire_or_renew().await.unwrap());
    }
}
