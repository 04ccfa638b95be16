use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::time::Instant;

use super::{
    breaker::{Breaker, BreakerError, BreakerParams},
    host_manager::Host,
};
use crate::{core::names, ports::readiness::EndpointReadiness};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ThrottleError {
    #[error("breaker error: {0}")]
    Breaker(#[from] BreakerError),

    /// The request deadline passed between readiness retries
    #[error("thunk error: context done")]
    ContextDone,

    #[error("resolve error: {0}")]
    Resolve(#[source] BoxError),
}

impl ThrottleError {
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(
            self,
            Self::Breaker(BreakerError::DeadlineExceeded) | Self::ContextDone
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottlerParams {
    pub breaker: BreakerParams,
    /// Pause between readiness checks of a cold target.
    pub retry_duration: Duration,
    /// How long a positive readiness answer is trusted.
    pub ready_cache_ttl: Duration,
}

enum Step {
    Done(Result<(), ThrottleError>),
    Retry,
}

/// Holds a request until its target has ready endpoints, then resolves it
/// exactly once.
pub struct Throttler {
    breaker: Breaker,
    readiness: Arc<dyn EndpointReadiness>,
    retry_duration: Duration,
    ready_cache_ttl: Duration,
    ready_until: scc::HashMap<String, Instant>,
    queued: scc::HashMap<String, Arc<AtomicI64>>,
}

struct QueuedGuard(Arc<AtomicI64>);

impl Drop for QueuedGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Throttler {
    pub fn new(params: ThrottlerParams, readiness: Arc<dyn EndpointReadiness>) -> Self {
        Self {
            breaker: Breaker::new(params.breaker),
            readiness,
            retry_duration: params.retry_duration,
            ready_cache_ttl: params.ready_cache_ttl,
            ready_until: scc::HashMap::new(),
            queued: scc::HashMap::new(),
        }
    }

    /// Run `resolve` once the host's target is ready.
    ///
    /// `resolve` receives the attempt number, starting at 1. Only "not ready
    /// yet" is retried; a breaker rejection or a failed resolve ends the loop.
    /// `on_retry` runs after every retry sleep.
    pub async fn try_request<R, Fut, E, N>(
        &self,
        deadline: Instant,
        host: &Host,
        mut resolve: R,
        mut on_retry: N,
    ) -> Result<(), ThrottleError>
    where
        R: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxError>,
        N: FnMut(),
    {
        let _queued = self
            .track_queued(&host.namespace, &host.target_service)
            .await;
        let mut try_count: u32 = 1;

        loop {
            let resolve_once = &mut resolve;
            let step = self
                .breaker
                .maybe(deadline, || async move {
                    match self
                        .check_if_service_ready(&host.namespace, &host.target_service)
                        .await
                    {
                        Ok(true) => {
                            return Step::Done(
                                resolve_once(try_count)
                                    .await
                                    .map_err(|e| ThrottleError::Resolve(e.into())),
                            );
                        }
                        Ok(false) => {
                            tracing::debug!(
                                "Service {}/{} not ready yet, attempt {}",
                                host.namespace,
                                host.target_service,
                                try_count
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Readiness check for {}/{} failed: {}",
                                host.namespace,
                                host.target_service,
                                e
                            );
                        }
                    }

                    let wake_at = (Instant::now() + self.retry_duration).min(deadline);
                    tokio::time::sleep_until(wake_at).await;
                    if Instant::now() >= deadline {
                        return Step::Done(Err(ThrottleError::ContextDone));
                    }
                    Step::Retry
                })
                .await;

            match step {
                Ok(Step::Done(result)) => {
                    if let Err(e) = &result {
                        tracing::error!(
                            "Request for {}/{} finished after {} attempt(s) with error: {}",
                            host.namespace,
                            host.target_service,
                            try_count,
                            e
                        );
                    }
                    return result;
                }
                Ok(Step::Retry) => {
                    try_count += 1;
                    on_retry();
                }
                Err(e) => {
                    tracing::error!(
                        "Breaker rejected request for {}/{}: {}",
                        host.namespace,
                        host.target_service,
                        e
                    );
                    return Err(e.into());
                }
            }
        }
    }

    async fn check_if_service_ready(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<bool, crate::ports::cluster::ClusterError> {
        let key = names::namespaced_key(namespace, service);
        let now = Instant::now();
        let cached = self
            .ready_until
            .read_async(&key, |_, until| *until > now)
            .await;
        match cached {
            Some(true) => return Ok(true),
            Some(false) => {
                self.ready_until.remove_async(&key).await;
            }
            None => {}
        }

        let ready = self.readiness.has_ready_endpoints(namespace, service).await?;
        if ready {
            self.ready_until
                .upsert_async(key, now + self.ready_cache_ttl)
                .await;
        }
        Ok(ready)
    }

    async fn track_queued(&self, namespace: &str, service: &str) -> QueuedGuard {
        let counter = self
            .queued
            .entry_async(names::namespaced_key(namespace, service))
            .await
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .get()
            .clone();
        counter.fetch_add(1, Ordering::AcqRel);
        QueuedGuard(counter)
    }

    /// Requests currently held for one service.
    pub async fn queued_requests(&self, namespace: &str, service: &str) -> i64 {
        self.queued
            .read_async(&names::namespaced_key(namespace, service), |_, c| {
                c.load(Ordering::Acquire)
            })
            .await
            .unwrap_or(0)
    }

    /// Requests currently held across all services.
    pub async fn total_queued_requests(&self) -> i64 {
        let mut total = 0;
        self.queued
            .retain_async(|_, c| {
                total += c.load(Ordering::Acquire);
                true
            })
            .await;
        total
    }

    pub fn update_concurrency(&self, size: u32) {
        self.breaker.update_concurrency(size);
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }
}
