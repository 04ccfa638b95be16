use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
};
use bytes::Bytes;
use eyre::{OptionExt, WrapErr};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::{
    internal_server::metrics_router,
    operator_client::{INCOMING_REQUEST_PATH, RequestCount},
};
use crate::{
    core::{
        names,
        operator::{CrdDirectory, ElastiService, ScaleHandler},
    },
    ports::cluster::{ClusterApi, ResourceKind},
};

#[derive(Debug, Serialize)]
struct Acknowledgement {
    message: &'static str,
}

/// Operator ingress: the resolver reports traffic for cold services here.
pub struct ElastiServer {
    cluster: Arc<dyn ClusterApi>,
    directory: Arc<CrdDirectory>,
    scale_handler: Arc<ScaleHandler>,
}

impl ElastiServer {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        directory: Arc<CrdDirectory>,
        scale_handler: Arc<ScaleHandler>,
    ) -> Self {
        Self {
            cluster,
            directory,
            scale_handler,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(INCOMING_REQUEST_PATH, any(incoming_request))
            .with_state(self)
            .merge(metrics_router())
            .layer(TraceLayer::new_for_http())
    }

    /// Bring the service's scale target back from zero if it is there.
    pub async fn scale_target_for_service(&self, namespace: &str, service: &str) -> eyre::Result<bool> {
        let key = names::namespaced_key(namespace, service);
        let details = self
            .directory
            .get_crd(&key)
            .await
            .ok_or_eyre(format!("no ElastiService registered for {key}"))?;
        let object = self
            .cluster
            .get(ResourceKind::ElastiService, namespace, &details.crd_name)
            .await
            .wrap_err_with(|| format!("failed to get ElastiService for {key}"))?;
        let es = ElastiService::from_value(object)?;
        self.scale_handler.scale_target_when_at_zero(&es).await
    }
}

async fn incoming_request(
    State(server): State<Arc<ElastiServer>>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Invalid request method").into_response();
    }
    let request: RequestCount = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::error!("Failed to decode request body: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid request body").into_response();
        }
    };
    tracing::info!(
        "Received request from resolver for {}/{} (count {})",
        request.namespace,
        request.svc,
        request.count
    );

    // answer the resolver first; scaling can take a while
    tokio::spawn(async move {
        match server
            .scale_target_for_service(&request.namespace, &request.svc)
            .await
        {
            Ok(true) => tracing::info!(
                "Scaled target of {}/{} up from zero",
                request.namespace,
                request.svc
            ),
            Ok(false) => tracing::debug!(
                "Target of {}/{} already running",
                request.namespace,
                request.svc
            ),
            Err(e) => tracing::error!(
                "Failed to scale target for {}/{}: {:#}",
                request.namespace,
                request.svc,
                e
            ),
        }
    });

    (
        StatusCode::OK,
        Json(Acknowledgement {
            message: "Request received successfully!",
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::{MemoryCluster, TriggerScalerFactory},
        core::operator::{
            CrdDetails,
            scale_handler::{KEDA_PAUSED_ANNOTATION, KEDA_PAUSED_REPLICAS_ANNOTATION},
        },
    };

    async fn setup() -> (Arc<MemoryCluster>, Router) {
        let cluster = Arc::new(MemoryCluster::new());
        let es = json!({
            "apiVersion": "elasti.truefoundry.com/v1alpha1",
            "kind": "ElastiService",
            "metadata": {"name": "orders-es", "namespace": "shop"},
            "spec": {
                "service": "orders",
                "minTargetReplicas": 2,
                "scaleTargetRef": {"apiVersion": "apps/v1", "kind": "deployments", "name": "orders"},
                "autoscaler": {"type": "keda", "name": "orders-so"}
            }
        });
        cluster
            .create(ResourceKind::ElastiService, "shop", es.clone())
            .await
            .unwrap();
        cluster
            .create(
                ResourceKind::Deployment,
                "shop",
                json!({"metadata": {"name": "orders"}, "spec": {"replicas": 0}}),
            )
            .await
            .unwrap();

        cluster
            .create(
                ResourceKind::ScaledObject,
                "shop",
                json!({
                    "apiVersion": "keda.sh/v1alpha1",
                    "kind": "ScaledObject",
                    "metadata": {
                        "name": "orders-so",
                        "annotations": {
                            KEDA_PAUSED_ANNOTATION: "true",
                            KEDA_PAUSED_REPLICAS_ANNOTATION: "0"
                        }
                    }
                }),
            )
            .await
            .unwrap();

        let directory = Arc::new(CrdDirectory::new());
        let parsed = ElastiService::from_value(es).unwrap();
        directory
            .add_crd(
                "shop/orders",
                CrdDetails {
                    crd_name: "orders-es".into(),
                    spec: parsed.spec.clone(),
                    status: parsed.status.clone(),
                },
            )
            .await;
        let scale_handler = Arc::new(ScaleHandler::new(
            cluster.clone(),
            Arc::new(TriggerScalerFactory::new().unwrap()),
            Duration::from_secs(30),
        ));
        let server = Arc::new(ElastiServer::new(cluster.clone(), directory, scale_handler));
        (cluster, server.router())
    }

    fn post(body: &str) -> axum::http::Request<Body> {
        axum::http::Request::post(INCOMING_REQUEST_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_incoming_request_scales_target_up() {
        let (cluster, router) = setup().await;
        let response = router
            .oneshot(post(r#"{"count":1,"svc":"orders","namespace":"shop"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], "Request received successfully!");

        let mut replicas = 0;
        for _ in 0..100 {
            let deployment = cluster
                .get(ResourceKind::Deployment, "shop", "orders")
                .await
                .unwrap();
            replicas = deployment["spec"]["replicas"].as_i64().unwrap();
            if replicas == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(replicas, 2);
    }

    #[tokio::test]
    async fn test_scale_up_unpauses_scaled_object() {
        let (cluster, _) = setup().await;
        let directory = Arc::new(CrdDirectory::new());
        let es = ElastiService::from_value(
            cluster
                .get(ResourceKind::ElastiService, "shop", "orders-es")
                .await
                .unwrap(),
        )
        .unwrap();
        directory
            .add_crd(
                "shop/orders",
                CrdDetails {
                    crd_name: "orders-es".into(),
                    spec: es.spec.clone(),
                    status: es.status.clone(),
                },
            )
            .await;
        let server = ElastiServer::new(
            cluster.clone(),
            directory,
            Arc::new(ScaleHandler::new(
                cluster.clone(),
                Arc::new(TriggerScalerFactory::new().unwrap()),
                Duration::from_secs(30),
            )),
        );

        assert!(server.scale_target_for_service("shop", "orders").await.unwrap());

        let deployment = cluster
            .get(ResourceKind::Deployment, "shop", "orders")
            .await
            .unwrap();
        assert_eq!(deployment["spec"]["replicas"], 2);
        let so = cluster
            .get(ResourceKind::ScaledObject, "shop", "orders-so")
            .await
            .unwrap();
        let annotations = &so["metadata"]["annotations"];
        assert_eq!(annotations[KEDA_PAUSED_ANNOTATION], "false");
        assert!(annotations.get(KEDA_PAUSED_REPLICAS_ANNOTATION).is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_method_and_body() {
        let (_, router) = setup().await;
        let response = router
            .clone()
            .oneshot(
                axum::http::Request::get(INCOMING_REQUEST_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = router.oneshot(post("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"Invalid request body");
    }

    #[tokio::test]
    async fn test_unknown_service_is_an_error() {
        let (cluster, _) = setup().await;
        let server = ElastiServer::new(
            cluster.clone(),
            Arc::new(CrdDirectory::new()),
            Arc::new(ScaleHandler::new(
                cluster,
                Arc::new(TriggerScalerFactory::new().unwrap()),
                Duration::from_secs(30),
            )),
        );
        assert!(server.scale_target_for_service("shop", "orders").await.is_err());
    }
}
