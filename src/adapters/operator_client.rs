use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{core::names, metrics, ports::notifier::RequestNotifier};

pub const INCOMING_REQUEST_PATH: &str = "/informer/incoming-request";
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of the resolver-to-operator notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCount {
    pub count: i64,
    pub svc: String,
    pub namespace: String,
}

/// Tells the operator about traffic for cold services, at most once per
/// service per suppression window.
pub struct OperatorClient {
    client: reqwest::Client,
    endpoint: String,
    retry_duration: Duration,
    suppressed_until: scc::HashMap<String, Instant>,
}

impl OperatorClient {
    pub fn new(operator_url: &str, retry_duration: Duration) -> eyre::Result<Self> {
        let client = reqwest::Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}{}",
                operator_url.trim_end_matches('/'),
                INCOMING_REQUEST_PATH
            ),
            retry_duration,
            suppressed_until: scc::HashMap::new(),
        })
    }

    /// Take the window for `key`. False while another notification holds it.
    async fn claim(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.suppressed_until.entry_async(key.to_string()).await {
            scc::hash_map::Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    return false;
                }
                *entry.get_mut() = now + self.retry_duration;
                true
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(now + self.retry_duration);
                true
            }
        }
    }

    async fn send(&self, namespace: &str, service: &str) -> Result<(), reqwest::Error> {
        let body = RequestCount {
            count: 1,
            svc: service.to_string(),
            namespace: namespace.to_string(),
        };
        self.client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl RequestNotifier for OperatorClient {
    async fn notify(&self, namespace: &str, service: &str) {
        let key = names::namespaced_key(namespace, service);
        if !self.claim(&key).await {
            tracing::debug!("Operator already notified for {}", key);
            return;
        }

        match self.send(namespace, service).await {
            Ok(()) => {
                metrics::increment_operator_rpc(None);
                tracing::info!("Operator notified of traffic for {}", key);
            }
            Err(e) => {
                metrics::increment_operator_rpc(Some(&e.to_string()));
                tracing::warn!("Failed to notify operator for {}: {}", key, e);
                // a failed attempt must not hold the window
                self.suppressed_until.remove_async(&key).await;
            }
        }
    }
}
