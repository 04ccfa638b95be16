use std::{
    backtrace::Backtrace,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::State,
    http::{HeaderValue, Request, Response, StatusCode, header},
};
use futures_util::FutureExt;
use serde_json::json;
use tokio::time::Instant;
use tracing::Instrument;

use crate::{
    core::resolver::{Host, HostManager, ThrottleError, Throttler},
    metrics,
    ports::{
        http_client::{HttpClient, HttpClientError},
        notifier::RequestNotifier,
    },
    tracing_setup,
};

pub const RETRY_COUNT_HEADER: &str = "elasti-retry-count";
const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

/// Entry point for every proxied request the resolver receives.
pub struct ResolverHandler {
    host_manager: Arc<HostManager>,
    throttler: Arc<Throttler>,
    http_client: Arc<dyn HttpClient>,
    notifier: Arc<dyn RequestNotifier>,
    req_timeout: Duration,
}

impl ResolverHandler {
    pub fn new(
        host_manager: Arc<HostManager>,
        throttler: Arc<Throttler>,
        http_client: Arc<dyn HttpClient>,
        notifier: Arc<dyn RequestNotifier>,
        req_timeout: Duration,
    ) -> Self {
        Self {
            host_manager,
            throttler,
            http_client,
            notifier,
            req_timeout,
        }
    }

    /// Router that sends every method and path through [`Self::handle`].
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(|State(handler): State<Arc<Self>>, req: Request<AxumBody>| async move {
                handler.handle(req).await
            })
            .with_state(self)
    }

    pub async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let started = Instant::now();
        let method = req.method().to_string();
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing_setup::create_request_span(&method, req.uri().path(), &request_id);

        let (response, source, namespace, error) = self.serve(req).instrument(span.clone()).await;

        let status = response.status().as_u16();
        span.record("http.status_code", status);
        span.record("duration_ms", started.elapsed().as_millis() as u64);
        metrics::record_incoming_request(
            &source,
            &namespace,
            &method,
            status,
            error.as_deref(),
            started.elapsed(),
        );
        metrics::set_queued_requests(self.throttler.total_queued_requests().await);
        response
    }

    /// Returns the response with the labels the request metric needs.
    async fn serve(
        &self,
        req: Request<AxumBody>,
    ) -> (Response<AxumBody>, String, String, Option<String>) {
        let host = match self.host_manager.get_host(req.headers()).await {
            Ok(host) => host,
            Err(e) => {
                tracing::error!("Error getting host: {}", e);
                return (
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
                    String::new(),
                    String::new(),
                    Some(e.to_string()),
                );
            }
        };
        let source = host.source_service.clone();
        let namespace = host.namespace.clone();

        if !host.traffic_allowed() {
            tracing::info!(
                "Traffic is switched for {}/{}, rejecting request",
                host.namespace,
                host.source_service
            );
            let mut response = json_response(
                StatusCode::FORBIDDEN,
                json!({"error": "traffic is switched"}),
            );
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
            return (response, source, namespace, Some("traffic is switched".into()));
        }

        self.spawn_notify(&host);

        let deadline = Instant::now() + self.req_timeout;
        let (parts, body) = req.into_parts();
        let mut pending_body = Some(body);
        let forwarded: Mutex<Option<Response<AxumBody>>> = Mutex::new(None);

        let result = {
            let parts = &parts;
            let forwarded = &forwarded;
            let host_ref = &host;
            self.throttler
                .try_request(
                    deadline,
                    &host,
                    move |attempt| {
                        let body = pending_body.take().unwrap_or_else(AxumBody::empty);
                        async move {
                            let outcome = self
                                .forward(host_ref, parts, body, attempt, deadline)
                                .await;
                            let (response, result) = match outcome {
                                Ok(response) => (response, Ok(())),
                                Err(e) => (
                                    text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
                                    Err(e),
                                ),
                            };
                            *forwarded.lock().unwrap_or_else(PoisonError::into_inner) =
                                Some(response);
                            if result.is_ok() {
                                self.host_manager
                                    .disable_traffic_for_host(&host_ref.incoming_host)
                                    .await;
                            }
                            result
                        }
                    },
                    || self.spawn_notify(&host),
                )
                .await
        };

        let forwarded = forwarded
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        match (result, forwarded) {
            (Ok(()), Some(response)) => (response, source, namespace, None),
            (Err(ThrottleError::Resolve(e)), Some(response)) => {
                (response, source, namespace, Some(e.to_string()))
            }
            (Err(e), _) if e.is_deadline_exceeded() => {
                tracing::warn!(
                    "Request for {}/{} exceeded its deadline: {}",
                    host.namespace,
                    host.source_service,
                    e
                );
                (
                    text_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"),
                    source,
                    namespace,
                    Some(e.to_string()),
                )
            }
            (Err(e), _) => (
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
                source,
                namespace,
                Some(e.to_string()),
            ),
            (Ok(()), None) => (
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
                source,
                namespace,
                Some("no response recorded".into()),
            ),
        }
    }

    fn spawn_notify(&self, host: &Host) {
        let notifier = self.notifier.clone();
        let namespace = host.namespace.clone();
        let service = host.source_service.clone();
        tokio::spawn(async move { notifier.notify(&namespace, &service).await });
    }

    /// Forward one attempt to the private service. Panics in the client are
    /// caught and reported as errors.
    async fn forward(
        &self,
        host: &Host,
        parts: &http::request::Parts,
        body: AxumBody,
        attempt: u32,
        deadline: Instant,
    ) -> Result<Response<AxumBody>, HttpClientError> {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", host.target_host, path);

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(&target)
            .version(parts.version);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(parts.headers.clone());
            if let Ok(value) = HeaderValue::from_str(&host.incoming_host) {
                headers.insert(FORWARDED_HOST_HEADER, value);
            }
            headers.insert(RETRY_COUNT_HEADER, HeaderValue::from(attempt));
        }
        let request = builder
            .body(body)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let span = tracing_setup::create_forward_span(&target, parts.method.as_str(), attempt);
        let send = AssertUnwindSafe(self.http_client.send_request(request)).catch_unwind();
        let outcome = tokio::time::timeout_at(deadline, send)
            .instrument(span)
            .await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    "Recovered from panic forwarding to {}: {}\n{}",
                    target,
                    message,
                    Backtrace::force_capture()
                );
                Err(HttpClientError::ConnectionError(format!(
                    "panic while forwarding: {message}"
                )))
            }
            Err(_) => Err(HttpClientError::ConnectionError(format!(
                "forward to {target} timed out"
            ))),
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use http::HeaderName;
    use http_body_util::BodyExt;

    use super::*;
    use crate::{
        core::resolver::{BreakerParams, ThrottlerParams},
        ports::{cluster::ClusterError, http_client::HttpClientResult, readiness::EndpointReadiness},
    };

    struct ReadyAfter {
        calls: AtomicU32,
        ready_from: u32,
    }

    #[async_trait]
    impl EndpointReadiness for ReadyAfter {
        async fn has_ready_endpoints(&self, _: &str, _: &str) -> Result<bool, ClusterError> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_from)
        }
    }

    #[derive(Default)]
    struct Upstream {
        fail: AtomicBool,
        panic: AtomicBool,
        seen: Mutex<Vec<http::request::Parts>>,
    }

    #[async_trait]
    impl HttpClient for Upstream {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            if self.panic.load(Ordering::SeqCst) {
                panic!("upstream exploded");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(HttpClientError::ConnectionError("refused".into()));
            }
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await.unwrap().to_bytes();
            self.seen.lock().unwrap().push(parts);
            Ok(Response::new(AxumBody::from(bytes)))
        }
    }

    #[derive(Default)]
    struct Notifications(AtomicU32);

    #[async_trait]
    impl RequestNotifier for Notifications {
        async fn notify(&self, _: &str, _: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler(
        ready_from: u32,
        upstream: Arc<Upstream>,
        notifications: Arc<Notifications>,
    ) -> ResolverHandler {
        let throttler = Throttler::new(
            ThrottlerParams {
                breaker: BreakerParams {
                    queue_depth: 10,
                    max_concurrency: 10,
                    initial_capacity: 10,
                },
                retry_duration: Duration::from_secs(5),
                ready_cache_ttl: Duration::from_secs(5),
            },
            Arc::new(ReadyAfter {
                calls: AtomicU32::new(0),
                ready_from,
            }),
        );
        ResolverHandler::new(
            Arc::new(HostManager::new(
                HeaderName::from_static("x-envoy-decorator-operation"),
                Duration::from_secs(30),
            )),
            Arc::new(throttler),
            upstream,
            notifications,
            Duration::from_secs(600),
        )
    }

    fn request(host: &str) -> Request<AxumBody> {
        Request::builder()
            .method("POST")
            .uri("/orders?id=7")
            .header(header::HOST, host)
            .body(AxumBody::from("payload"))
            .unwrap()
    }

    async fn body_string(response: Response<AxumBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_holds_until_ready_then_forwards() {
        let upstream = Arc::new(Upstream::default());
        let notifications = Arc::new(Notifications::default());
        let handler = handler(4, upstream.clone(), notifications.clone());

        let response = handler
            .handle(request("orders.shop.svc.cluster.local:8080"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "payload");

        let seen = upstream.seen.lock().unwrap();
        let parts = &seen[0];
        assert_eq!(parts.uri.path(), "/orders");
        assert_eq!(parts.uri.query(), Some("id=7"));
        assert!(parts.uri.host().unwrap().ends_with(".shop.svc.cluster.local"));
        assert_eq!(parts.headers[RETRY_COUNT_HEADER], "4");
        assert_eq!(
            parts.headers[header::HOST],
            "orders.shop.svc.cluster.local:8080"
        );
        assert_eq!(
            parts.headers[FORWARDED_HOST_HEADER],
            "orders.shop.svc.cluster.local:8080"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_rejects_second_request() {
        let upstream = Arc::new(Upstream::default());
        let handler = handler(1, upstream.clone(), Arc::new(Notifications::default()));

        let first = handler
            .handle(request("orders.shop.svc.cluster.local:8080"))
            .await;
        assert_eq!(first.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = handler
            .handle(request("orders.shop.svc.cluster.local:8080"))
            .await;
        assert_eq!(second.status(), StatusCode::FORBIDDEN);
        assert_eq!(second.headers()[header::CONNECTION], "close");
        assert_eq!(
            body_string(second).await,
            r#"{"error":"traffic is switched"}"#
        );
        assert_eq!(upstream.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_failure_is_bad_gateway_and_keeps_traffic() {
        let upstream = Arc::new(Upstream::default());
        upstream.fail.store(true, Ordering::SeqCst);
        let handler = handler(1, upstream.clone(), Arc::new(Notifications::default()));

        let response = handler.handle(request("orders.shop")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        upstream.fail.store(false, Ordering::SeqCst);
        let response = handler.handle(request("orders.shop")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_client_is_recovered() {
        let upstream = Arc::new(Upstream::default());
        upstream.panic.store(true, Ordering::SeqCst);
        let handler = handler(1, upstream, Arc::new(Notifications::default()));

        let response = handler.handle(request("orders.shop")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_service_unavailable() {
        let handler = ResolverHandler {
            req_timeout: Duration::from_secs(7),
            ..handler(
                u32::MAX,
                Arc::new(Upstream::default()),
                Arc::new(Notifications::default()),
            )
        };
        let response = handler.handle(request("orders.shop")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unparseable_host_is_internal_error() {
        let handler = handler(
            1,
            Arc::new(Upstream::default()),
            Arc::new(Notifications::default()),
        );
        let req = Request::builder()
            .uri("/")
            .body(AxumBody::empty())
            .unwrap();
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_renotify_operator() {
        let notifications = Arc::new(Notifications::default());
        let handler = handler(3, Arc::new(Upstream::default()), notifications.clone());
        let response = handler.handle(request("orders.shop")).await;
        assert_eq!(response.status(), StatusCode::OK);
        tokio::task::yield_now().await;
        // first notify plus one per retry
        assert_eq!(notifications.0.load(Ordering::SeqCst), 3);
    }
}
