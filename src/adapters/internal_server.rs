//! Side listeners: the resolver's internal endpoints plus the shared
//! `/metrics` and probe handlers.
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{
    core::{names, resolver::Throttler},
    metrics,
};

#[derive(Debug, Deserialize)]
pub struct QueueStatusQuery {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_status: u8,
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

async fn healthz() -> &'static str {
    "ok"
}

async fn queue_status(
    State(throttler): State<Arc<Throttler>>,
    Query(query): Query<QueueStatusQuery>,
) -> Json<QueueStatus> {
    let private = names::private_service_name(&query.service);
    let queued = throttler.queued_requests(&query.namespace, &private).await;
    Json(QueueStatus {
        queue_status: u8::from(queued > 0),
    })
}

/// Router for the resolver's internal listener.
pub fn resolver_internal_router(throttler: Arc<Throttler>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/queue-status", get(queue_status))
        .with_state(throttler)
        .layer(TraceLayer::new_for_http())
}

/// `/metrics` alone, for the operator's metrics listener.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// `/healthz` always answers; `/readyz` answers once `ready` is set.
pub fn probe_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/readyz",
            get(|State(ready): State<Arc<AtomicBool>>| async move {
                if ready.load(Ordering::Acquire) {
                    (StatusCode::OK, "ok")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "not ready")
                }
            }),
        )
        .with_state(ready)
}

/// Accept `:8080` as shorthand for all interfaces.
pub fn parse_bind_address(addr: &str) -> eyre::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .wrap_err_with(|| format!("invalid bind address {addr:?}"))
}

/// Serve `router` on `addr` until `shutdown` is cancelled.
pub async fn serve_router(
    name: &str,
    addr: &str,
    router: Router,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let addr = parse_bind_address(addr)?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("failed to bind {name} to {addr}"))?;
    tracing::info!("{} listening on {}", name, addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .wrap_err_with(|| format!("{name} server error"))?;
    tracing::info!("{} stopped", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        core::resolver::{BreakerParams, Host, ThrottlerParams},
        ports::{cluster::ClusterError, readiness::EndpointReadiness},
    };

    struct NeverReady;

    #[async_trait]
    impl EndpointReadiness for NeverReady {
        async fn has_ready_endpoints(&self, _: &str, _: &str) -> Result<bool, ClusterError> {
            Ok(false)
        }
    }

    fn throttler() -> Arc<Throttler> {
        Arc::new(Throttler::new(
            ThrottlerParams {
                breaker: BreakerParams {
                    queue_depth: 4,
                    max_concurrency: 4,
                    initial_capacity: 4,
                },
                retry_duration: Duration::from_secs(1),
                ready_cache_ttl: Duration::from_secs(1),
            },
            Arc::new(NeverReady),
        ))
    }

    async fn get_json(router: Router, uri: &str) -> QueueStatus {
        let response = router
            .oneshot(axum::http::Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_status_reflects_held_requests() {
        let throttler = throttler();
        let router = resolver_internal_router(throttler.clone());
        let uri = "/queue-status?namespace=shop&service=orders";
        assert_eq!(get_json(router.clone(), uri).await, QueueStatus { queue_status: 0 });

        let held = throttler.clone();
        let task = tokio::spawn(async move {
            let host = Host::new_for_test("orders.shop", "shop", "orders");
            let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
            let _ = held
                .try_request(deadline, &host, |_| async { Ok::<_, std::io::Error>(()) }, || {})
                .await;
        });
        tokio::task::yield_now().await;

        assert_eq!(get_json(router.clone(), uri).await, QueueStatus { queue_status: 1 });
        task.abort();
        let _ = task.await;
        assert_eq!(get_json(router, uri).await, QueueStatus { queue_status: 0 });
    }

    #[tokio::test]
    async fn test_probes() {
        let ready = Arc::new(AtomicBool::new(false));
        let router = probe_router(ready.clone());
        let status = |router: Router, uri: &'static str| async move {
            router
                .oneshot(axum::http::Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap()
                .status()
        };
        assert_eq!(status(router.clone(), "/healthz").await, StatusCode::OK);
        assert_eq!(
            status(router.clone(), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        ready.store(true, Ordering::Release);
        assert_eq!(status(router, "/readyz").await, StatusCode::OK);
    }

    #[test]
    fn test_bind_address_shorthand() {
        assert_eq!(
            parse_bind_address(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind_address("nope").is_err());
    }
}
