use async_trait::async_trait;

/// RequestNotifier tells the operator that traffic arrived for a route whose
/// workload may be scaled to zero. Delivery is best effort and never fails
/// the caller.
#[async_trait]
pub trait RequestNotifier: Send + Sync + 'static {
    async fn notify(&self, namespace: &str, service: &str);
}
