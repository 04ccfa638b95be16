use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Uri, Version, header};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
};
use tokio::net::TcpStream;
use tower::Service;

use crate::{
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
    utils::Backoff,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// TCP connector that retries failed dials on an exponential schedule.
#[derive(Clone)]
pub struct BackoffConnector {
    inner: HttpConnector,
    backoff: Backoff,
}

impl BackoffConnector {
    pub fn new(backoff: Backoff) -> Self {
        let mut inner = HttpConnector::new();
        inner.set_nodelay(true);
        inner.set_keepalive(Some(Duration::from_secs(30)));
        inner.set_connect_timeout(Some(Duration::from_secs(30)));
        Self { inner, backoff }
    }
}

impl Service<Uri> for BackoffConnector {
    type Response = TokioIo<TcpStream>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let mut inner = self.inner.clone();
        let backoff = self.backoff;
        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                match inner.call(uri.clone()).await {
                    Ok(io) => return Ok(io),
                    Err(e) => {
                        attempt += 1;
                        if attempt >= backoff.steps {
                            return Err(e.into());
                        }
                        let delay = backoff.delay(attempt);
                        tracing::debug!(
                            "Dial to {} failed ({}), retrying in {:?}",
                            uri,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }
}

/// Forwards resolver traffic to private services over pooled HTTP/1.1
/// connections.
pub struct HttpClientAdapter {
    client: Client<BackoffConnector, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new(max_idle_per_host: usize) -> Self {
        Self::with_backoff(max_idle_per_host, Backoff::dial())
    }

    pub fn with_backoff(max_idle_per_host: usize, backoff: Backoff) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(BackoffConnector::new(backoff));
        Self { client }
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            return Err(HttpClientError::InvalidRequest(format!(
                "outgoing URI has no host: {}",
                req.uri()
            )));
        }
        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        let method = parts.method.clone();
        let uri = parts.uri.clone();
        tracing::debug!("Forwarding {} {}", method, uri);

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                // axum re-frames the streamed body
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(body)))
            }
            Err(e) => {
                tracing::error!("Error forwarding {} {}: {}", method, uri, e);
                Err(HttpClientError::ConnectionError(format!(
                    "request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}
