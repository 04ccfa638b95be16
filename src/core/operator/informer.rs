use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics,
    ports::cluster::{ClusterApi, ClusterError, ResourceKind, WatchEvent},
    utils::Backoff,
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InformerError {
    #[error("incomplete watch request: {0}")]
    InvalidRequest(String),

    /// The watched object does not exist when the watch is requested
    #[error("target not found: {0}")]
    TargetNotFound(#[source] ClusterError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

pub type InformerResult<T> = Result<T, InformerError>;

/// Callbacks for one watch session. They are kept with the session and
/// reused when the session is restarted.
#[async_trait]
pub trait WatchHandler: Send + Sync + 'static {
    async fn on_add(&self, object: Value);

    async fn on_update(&self, object: Value);

    async fn on_delete(&self, _object: Value) {}
}

/// What to watch, on behalf of which ElastiService, and who to tell.
#[derive(Clone)]
pub struct WatchRequest {
    pub crd_name: String,
    pub crd_namespace: String,
    pub resource: ResourceKind,
    pub resource_name: String,
    pub resource_namespace: String,
    pub handlers: Arc<dyn WatchHandler>,
}

impl WatchRequest {
    pub fn key(&self) -> String {
        informer_key(
            &self.crd_name,
            &self.crd_namespace,
            self.resource,
            &self.resource_name,
        )
    }
}

/// `crdName/namespace/resource/resourceName`, lower-cased.
pub fn informer_key(
    crd_name: &str,
    namespace: &str,
    resource: ResourceKind,
    resource_name: &str,
) -> String {
    format!("{crd_name}/{namespace}/{}/{resource_name}", resource.plural()).to_lowercase()
}

struct Session {
    request: WatchRequest,
    token: CancellationToken,
    synced: Arc<AtomicBool>,
    started_at: Instant,
    restarts: u32,
}

/// Registry of named watch sessions with a self-healing health check.
pub struct InformerManager {
    cluster: Arc<dyn ClusterApi>,
    sessions: scc::HashMap<String, Session>,
    health_check_interval: Duration,
    token: CancellationToken,
}

impl InformerManager {
    pub fn new(cluster: Arc<dyn ClusterApi>, health_check_interval: Duration) -> Self {
        Self {
            cluster,
            sessions: scc::HashMap::new(),
            health_check_interval,
            token: CancellationToken::new(),
        }
    }

    /// Register a watch; a no-op when one is already active under the same key.
    ///
    /// The session runs on its own task, so this returns once the target has
    /// been confirmed to exist.
    pub async fn add_watch(&self, request: WatchRequest) -> InformerResult<()> {
        if request.resource_name.is_empty() || request.resource_namespace.is_empty() {
            return Err(InformerError::InvalidRequest(request.key()));
        }
        let key = request.key();
        if self.sessions.read_async(&key, |_, _| ()).await.is_some() {
            tracing::debug!("Informer already running for {}", key);
            return Ok(());
        }

        self.cluster
            .get(
                request.resource,
                &request.resource_namespace,
                &request.resource_name,
            )
            .await
            .map_err(InformerError::TargetNotFound)?;

        match self.sessions.entry_async(key.clone()).await {
            scc::hash_map::Entry::Occupied(_) => return Ok(()),
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(self.spawn_session(request, 0));
            }
        }
        tracing::info!("Informer started for {}", key);
        metrics::set_informer_count(self.sessions.len());
        Ok(())
    }

    /// Stop and forget one session; unknown keys are ignored.
    pub async fn stop_watch(&self, key: &str) {
        if let Some((_, session)) = self.sessions.remove_async(key).await {
            session.token.cancel();
            tracing::info!("Informer stopped for {}", key);
            metrics::set_informer_count(self.sessions.len());
        }
    }

    /// Stop every session registered on behalf of one ElastiService.
    pub async fn stop_for_crd(&self, crd_name: &str, crd_namespace: &str) {
        let prefix = format!("{crd_name}/{crd_namespace}/").to_lowercase();
        let mut stopped = 0usize;
        self.sessions
            .retain_async(|key, session| {
                if key.starts_with(&prefix) {
                    session.token.cancel();
                    stopped += 1;
                    false
                } else {
                    true
                }
            })
            .await;
        tracing::info!(
            "Stopped {} informer(s) for CRD {}/{}",
            stopped,
            crd_namespace,
            crd_name
        );
        metrics::set_informer_count(self.sessions.len());
    }

    /// Stop all sessions and the health check.
    pub async fn stop(&self) {
        self.token.cancel();
        self.sessions
            .retain_async(|_, session| {
                session.token.cancel();
                false
            })
            .await;
        metrics::set_informer_count(0);
        tracing::info!("InformerManager stopped");
    }

    pub async fn is_watching(&self, key: &str) -> bool {
        self.sessions.read_async(key, |_, _| ()).await.is_some()
    }

    pub async fn is_synced(&self, key: &str) -> bool {
        self.sessions
            .read_async(key, |_, s| s.synced.load(Ordering::Acquire))
            .await
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the periodic health check until `shutdown` or [`InformerManager::stop`].
    pub async fn run_health_check(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => self.restart_unsynced().await,
            }
        }
        tracing::info!("Informer health check stopped");
    }

    /// Restart every session that has not synced within its grace period,
    /// reusing the stored handlers.
    pub async fn restart_unsynced(&self) {
        let backoff = Backoff::restart();
        let mut stale = Vec::new();
        self.sessions
            .retain_async(|key, session| {
                let grace = self
                    .health_check_interval
                    .max(backoff.base_delay(session.restarts));
                if !session.synced.load(Ordering::Acquire) && session.started_at.elapsed() >= grace
                {
                    stale.push(key.clone());
                }
                true
            })
            .await;

        for key in stale {
            if let scc::hash_map::Entry::Occupied(mut entry) =
                self.sessions.entry_async(key.clone()).await
            {
                tracing::warn!("Informer {} not synced, restarting", key);
                let old = entry.get();
                old.token.cancel();
                let replacement = self.spawn_session(old.request.clone(), old.restarts + 1);
                *entry.get_mut() = replacement;
            }
        }
    }

    fn spawn_session(&self, request: WatchRequest, restarts: u32) -> Session {
        let token = self.token.child_token();
        let synced = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_session(
            self.cluster.clone(),
            request.clone(),
            token.clone(),
            synced.clone(),
        ));
        Session {
            request,
            token,
            synced,
            started_at: Instant::now(),
            restarts,
        }
    }
}

async fn run_session(
    cluster: Arc<dyn ClusterApi>,
    request: WatchRequest,
    token: CancellationToken,
    synced: Arc<AtomicBool>,
) {
    let key = request.key();
    let mut stream = match cluster
        .watch(
            request.resource,
            &request.resource_namespace,
            Some(&request.resource_name),
        )
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!("Failed to open watch for {}: {}", key, e);
            return;
        }
    };

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(WatchEvent::Added(object))) => request.handlers.on_add(object).await,
            Some(Ok(WatchEvent::Modified(object))) => request.handlers.on_update(object).await,
            Some(Ok(WatchEvent::Deleted(object))) => request.handlers.on_delete(object).await,
            Some(Ok(WatchEvent::Synced)) => {
                synced.store(true, Ordering::Release);
                tracing::debug!("Informer {} synced", key);
            }
            Some(Err(e)) => {
                tracing::error!("Watch for {} failed: {}", key, e);
                synced.store(false, Ordering::Release);
                break;
            }
            None => {
                tracing::warn!("Watch for {} ended", key);
                synced.store(false, Ordering::Release);
                break;
            }
        }
    }
}
