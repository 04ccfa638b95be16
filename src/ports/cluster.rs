use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

/// Resource kinds the resolver and operator read or mutate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Service,
    EndpointSlice,
    Deployment,
    Rollout,
    ElastiService,
    ScaledObject,
    Event,
    Lease,
}

impl ResourceKind {
    pub fn api_version(&self) -> &'static str {
        match self {
            Self::Service | Self::Event => "v1",
            Self::EndpointSlice => "discovery.k8s.io/v1",
            Self::Deployment => "apps/v1",
            Self::Rollout => "argoproj.io/v1alpha1",
            Self::ElastiService => "elasti.truefoundry.com/v1alpha1",
            Self::ScaledObject => "keda.sh/v1alpha1",
            Self::Lease => "coordination.k8s.io/v1",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Service => "Service",
            Self::EndpointSlice => "EndpointSlice",
            Self::Deployment => "Deployment",
            Self::Rollout => "Rollout",
            Self::ElastiService => "ElastiService",
            Self::ScaledObject => "ScaledObject",
            Self::Event => "Event",
            Self::Lease => "Lease",
        }
    }

    /// Lower-case plural resource name, as used in API paths and informer keys.
    pub fn plural(&self) -> &'static str {
        match self {
            Self::Service => "services",
            Self::EndpointSlice => "endpointslices",
            Self::Deployment => "deployments",
            Self::Rollout => "rollouts",
            Self::ElastiService => "elastiservices",
            Self::ScaledObject => "scaledobjects",
            Self::Event => "events",
            Self::Lease => "leases",
        }
    }

    /// Split `api_version` into (group, version); the core group is "".
    pub fn group_version(&self) -> (&'static str, &'static str) {
        match self.api_version().split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version()),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

/// Custom error type for cluster API operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ClusterError {
    /// The addressed object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    /// Create was called for an object that already exists
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    /// The submitted object is malformed
    #[error("Invalid object: {0}")]
    Invalid(String),

    /// Watch stream failure
    #[error("Watch error: {0}")]
    Watch(String),

    /// Any other API server failure
    #[error("API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Result type alias for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// One change observed on a watched resource.
///
/// A watch stream first replays the current objects as `Added`, then yields
/// `Synced` exactly once, then live changes.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    Synced,
}

pub type WatchStream = BoxStream<'static, ClusterResult<WatchEvent>>;

/// ClusterApi is the port to the orchestrator's resource store.
///
/// Objects travel as JSON so that copies (private services, endpoint slices)
/// keep fields this crate does not model.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<Value>;

    /// List objects, optionally across all namespaces and filtered by an
    /// equality label selector (`k=v,k2=v2`).
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> ClusterResult<Vec<Value>>;

    async fn create(&self, kind: ResourceKind, namespace: &str, object: Value)
    -> ClusterResult<Value>;

    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> ClusterResult<Value>;

    /// Apply a JSON merge patch (RFC 7386) to the object.
    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ClusterResult<Value>;

    /// Apply a JSON merge patch to the status subresource.
    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ClusterResult<Value>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()>;

    /// Watch one namespace, optionally narrowed to a single object name.
    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: Option<&str>,
    ) -> ClusterResult<WatchStream>;
}

/// Accessors for the `metadata` block of a JSON object.
pub trait ObjectExt {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn label(&self, key: &str) -> Option<&str>;
    fn annotation(&self, key: &str) -> Option<&str>;
    fn finalizers(&self) -> Vec<String>;
    fn is_being_deleted(&self) -> bool;
}

impl ObjectExt for Value {
    fn name(&self) -> &str {
        self.pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(key))
            .and_then(Value::as_str)
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
    }

    fn finalizers(&self) -> Vec<String> {
        self.pointer("/metadata/finalizers")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_being_deleted(&self) -> bool {
        self.pointer("/metadata/deletionTimestamp")
            .is_some_and(|ts| !ts.is_null())
    }
}

/// Parse an equality-only label selector into (key, value) pairs.
pub fn parse_label_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|term| {
            let (k, v) = term.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Merge `patch` into `target` following JSON merge patch rules.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map.entry(key.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_merge_patch_sets_and_removes() {
        let mut obj = json!({
            "metadata": {"annotations": {"a": "1", "b": "2"}},
            "spec": {"replicas": 3}
        });
        merge_patch(
            &mut obj,
            &json!({"metadata": {"annotations": {"a": null, "c": "3"}}, "spec": {"replicas": 0}}),
        );
        assert_eq!(obj.annotation("a"), None);
        assert_eq!(obj.annotation("b"), Some("2"));
        assert_eq!(obj.annotation("c"), Some("3"));
        assert_eq!(obj["spec"]["replicas"], 0);
    }

    #[test]
    fn test_label_selector_parsing() {
        let terms = parse_label_selector("kubernetes.io/service-name=svc, elasti.io/owner=elastiservice");
        assert_eq!(
            terms,
            vec![
                ("kubernetes.io/service-name".to_string(), "svc".to_string()),
                ("elasti.io/owner".to_string(), "elastiservice".to_string()),
            ]
        );
        assert!(parse_label_selector("").is_empty());
    }

    #[test]
    fn test_object_accessors() {
        let obj = json!({
            "metadata": {
                "name": "orders",
                "namespace": "shop",
                "finalizers": ["x/y"],
                "deletionTimestamp": "2024-01-01T00:00:00Z"
            }
        });
        assert_eq!(obj.name(), "orders");
        assert_eq!(obj.namespace(), "shop");
        assert_eq!(obj.finalizers(), vec!["x/y".to_string()]);
        assert!(obj.is_being_deleted());
    }

    #[test]
    fn test_kind_group_version() {
        assert_eq!(ResourceKind::Service.group_version(), ("", "v1"));
        assert_eq!(
            ResourceKind::EndpointSlice.group_version(),
            ("discovery.k8s.io", "v1")
        );
        assert_eq!(ResourceKind::Rollout.plural(), "rollouts");
    }
}
