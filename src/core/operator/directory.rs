use super::crd::{ElastiServiceSpec, ElastiServiceStatus};

/// What the operator remembers about a managed public service.
#[derive(Debug, Clone, PartialEq)]
pub struct CrdDetails {
    pub crd_name: String,
    pub spec: ElastiServiceSpec,
    pub status: ElastiServiceStatus,
}

/// Process-wide index from `namespace/service` to the ElastiService managing it.
#[derive(Default)]
pub struct CrdDirectory {
    services: scc::HashMap<String, CrdDetails>,
}

impl CrdDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for a service.
    pub async fn add_crd(&self, service_key: &str, details: CrdDetails) {
        self.services
            .upsert_async(service_key.to_string(), details)
            .await;
    }

    pub async fn get_crd(&self, service_key: &str) -> Option<CrdDetails> {
        self.services
            .read_async(service_key, |_, d| d.clone())
            .await
    }

    pub async fn remove_crd(&self, service_key: &str) {
        self.services.remove_async(service_key).await;
    }

    /// Record the mode last applied to a service, if it is still managed.
    pub async fn set_mode(&self, service_key: &str, mode: &str) {
        if let scc::hash_map::Entry::Occupied(mut entry) =
            self.services.entry_async(service_key.to_string()).await
        {
            entry.get_mut().status.mode = mode.to_string();
        }
    }

    /// Snapshot of all entries.
    pub async fn entries(&self) -> Vec<(String, CrdDetails)> {
        let mut out = Vec::new();
        self.services
            .retain_async(|k, v| {
                out.push((k.clone(), v.clone()));
                true
            })
            .await;
        out
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
