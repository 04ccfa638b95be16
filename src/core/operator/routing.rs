//! Routing objects owned by an ElastiService: the private mirror service and
//! the endpoint slices that point a public service at the resolver.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{Map, Value, json};
use thiserror::Error;

use super::crd::ElastiService;
use crate::{
    core::names,
    ports::cluster::{ClusterApi, ClusterError, ObjectExt, ResourceKind},
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RoutingError {
    /// No endpoint slice exists for the resolver service anywhere
    #[error("no resolver pod found")]
    NoResolverPodFound,

    #[error("public service {0} does not match the ElastiService")]
    ServiceMismatch(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

pub type RoutingResult<T> = Result<T, RoutingError>;

const SERVER_MANAGED_METADATA: [&str; 7] = [
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "managedFields",
    "ownerReferences",
    "generateName",
    "generation",
];

fn strip_server_metadata(object: &mut Value) {
    if let Some(meta) = object.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_MANAGED_METADATA {
            meta.remove(field);
        }
    }
    if let Some(map) = object.as_object_mut() {
        map.remove("status");
    }
}

fn ignore_not_found(result: Result<(), ClusterError>) -> Result<(), ClusterError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn owner_reference(owner: &ElastiService) -> Option<Value> {
    let uid = owner.metadata.uid.clone()?;
    let reference = OwnerReference {
        api_version: ResourceKind::ElastiService.api_version().to_string(),
        kind: ResourceKind::ElastiService.kind().to_string(),
        name: owner.name().to_string(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    };
    serde_json::to_value(reference).ok()
}

/// Copy of a public service under its private name, without cluster-assigned
/// addresses or node ports.
pub fn private_service_from(public: &Value, owner: &ElastiService) -> Value {
    let mut private = public.clone();
    strip_server_metadata(&mut private);

    if let Some(meta) = private.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(
            "name".into(),
            Value::String(names::private_service_name(public.name())),
        );
        if let Some(reference) = owner_reference(owner) {
            meta.insert("ownerReferences".into(), Value::Array(vec![reference]));
        }
    }
    if let Some(spec) = private.get_mut("spec").and_then(Value::as_object_mut) {
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
        spec.remove("healthCheckNodePort");
        if let Some(ports) = spec.get_mut("ports").and_then(Value::as_array_mut) {
            for port in ports.iter_mut().filter_map(Value::as_object_mut) {
                port.remove("nodePort");
            }
        }
    }
    private
}

/// Create the private service unless it already exists. Returns its name.
pub async fn ensure_private_service(
    cluster: &dyn ClusterApi,
    public: &Value,
    owner: &ElastiService,
) -> RoutingResult<String> {
    let namespace = public.namespace();
    let private_name = names::private_service_name(public.name());

    match cluster
        .get(ResourceKind::Service, namespace, &private_name)
        .await
    {
        Ok(_) => {
            tracing::debug!("Private service {}/{} already exists", namespace, private_name);
            return Ok(private_name);
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    tracing::info!("Creating private service {}/{}", namespace, private_name);
    match cluster
        .create(
            ResourceKind::Service,
            namespace,
            private_service_from(public, owner),
        )
        .await
    {
        Ok(_) => Ok(private_name),
        // lost a race with another reconcile of the same service
        Err(e) if e.is_already_exists() => Ok(private_name),
        Err(e) => Err(e.into()),
    }
}

/// Copy selector and ports of the public service into the private one.
pub async fn sync_private_service(
    cluster: &dyn ClusterApi,
    public: &Value,
    expected_service: &str,
) -> RoutingResult<()> {
    if public.name() != expected_service {
        return Err(RoutingError::ServiceMismatch(public.name().to_string()));
    }
    let namespace = public.namespace();
    let private_name = names::private_service_name(public.name());
    let mut private = cluster
        .get(ResourceKind::Service, namespace, &private_name)
        .await?;

    let selector = public
        .pointer("/spec/selector")
        .cloned()
        .unwrap_or(Value::Null);
    let ports: Vec<Value> = public
        .pointer("/spec/ports")
        .and_then(Value::as_array)
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let mut p = p.clone();
                    if let Some(map) = p.as_object_mut() {
                        map.remove("nodePort");
                    }
                    p
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(spec) = private.get_mut("spec").and_then(Value::as_object_mut) {
        spec.insert("selector".into(), selector);
        spec.insert("ports".into(), Value::Array(ports));
    }
    cluster
        .replace(ResourceKind::Service, namespace, &private_name, private)
        .await?;
    tracing::debug!("Private service {}/{} synced", namespace, private_name);
    Ok(())
}

pub async fn delete_private_service(
    cluster: &dyn ClusterApi,
    namespace: &str,
    public_service: &str,
) -> RoutingResult<()> {
    let private_name = names::private_service_name(public_service);
    ignore_not_found(
        cluster
            .delete(ResourceKind::Service, namespace, &private_name)
            .await,
    )?;
    Ok(())
}

/// Endpoint slices of the resolver service.
pub async fn resolver_slices(
    cluster: &dyn ClusterApi,
    resolver_namespace: &str,
) -> RoutingResult<Vec<Value>> {
    let selector = format!(
        "{}={}",
        names::SERVICE_NAME_LABEL,
        names::RESOLVER_SERVICE_NAME
    );
    let slices = cluster
        .list(
            ResourceKind::EndpointSlice,
            Some(resolver_namespace),
            Some(&selector),
        )
        .await?;
    if slices.is_empty() {
        return Err(RoutingError::NoResolverPodFound);
    }
    Ok(slices)
}

/// Copy of a resolver slice relabelled to serve `service`.
pub fn slice_to_resolver_from(resolver_slice: &Value, namespace: &str, service: &str, index: usize) -> Value {
    let mut slice = resolver_slice.clone();
    strip_server_metadata(&mut slice);

    let mut labels = resolver_slice
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    labels.insert(names::SERVICE_NAME_LABEL.into(), Value::String(service.into()));
    labels.insert(
        names::OWNER_LABEL.into(),
        Value::String(names::OWNER_LABEL_VALUE.into()),
    );

    if let Some(meta) = slice.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(
            "name".into(),
            Value::String(names::indexed_endpoint_slice_name(service, index)),
        );
        meta.insert("namespace".into(), Value::String(namespace.into()));
        meta.insert("labels".into(), Value::Object(labels));
    } else if let Some(map) = slice.as_object_mut() {
        map.insert(
            "metadata".into(),
            json!({
                "name": names::indexed_endpoint_slice_name(service, index),
                "namespace": namespace,
                "labels": labels,
            }),
        );
    }
    slice
}

/// Point `service` at the resolver: one slice per resolver slice, replaced
/// when present and created otherwise. Slices left over from a larger
/// resolver set are removed.
pub async fn upsert_slices_to_resolver(
    cluster: &dyn ClusterApi,
    resolver_namespace: &str,
    namespace: &str,
    service: &str,
) -> RoutingResult<()> {
    let sources = resolver_slices(cluster, resolver_namespace).await?;
    let mut written = Vec::with_capacity(sources.len());

    for (index, source) in sources.iter().enumerate() {
        let slice = slice_to_resolver_from(source, namespace, service, index);
        let name = names::indexed_endpoint_slice_name(service, index);
        written.push(name.clone());

        match cluster
            .get(ResourceKind::EndpointSlice, namespace, &name)
            .await
        {
            Ok(_) => {
                cluster
                    .replace(ResourceKind::EndpointSlice, namespace, &name, slice)
                    .await?;
                tracing::info!("EndpointSlice {}/{} updated", namespace, name);
            }
            Err(e) if e.is_not_found() => {
                cluster
                    .create(ResourceKind::EndpointSlice, namespace, slice)
                    .await?;
                tracing::info!("EndpointSlice {}/{} created", namespace, name);
            }
            Err(e) => return Err(e.into()),
        }
    }

    for stale in owned_slices(cluster, namespace, service).await? {
        if written.iter().any(|name| name == stale.name()) {
            continue;
        }
        ignore_not_found(
            cluster
                .delete(ResourceKind::EndpointSlice, namespace, stale.name())
                .await,
        )?;
        tracing::info!("Stale EndpointSlice {}/{} deleted", namespace, stale.name());
    }
    Ok(())
}

/// Slices we created to point `service` at the resolver.
async fn owned_slices(
    cluster: &dyn ClusterApi,
    namespace: &str,
    service: &str,
) -> RoutingResult<Vec<Value>> {
    let selector = format!(
        "{}={},{}={}",
        names::SERVICE_NAME_LABEL,
        service,
        names::OWNER_LABEL,
        names::OWNER_LABEL_VALUE
    );
    Ok(cluster
        .list(ResourceKind::EndpointSlice, Some(namespace), Some(&selector))
        .await?)
}

/// Remove every slice pointing `service` at the resolver.
pub async fn delete_slices_to_resolver(
    cluster: &dyn ClusterApi,
    namespace: &str,
    service: &str,
) -> RoutingResult<()> {
    for slice in owned_slices(cluster, namespace, service).await? {
        ignore_not_found(
            cluster
                .delete(ResourceKind::EndpointSlice, namespace, slice.name())
                .await,
        )?;
        tracing::info!("EndpointSlice {}/{} deleted", namespace, slice.name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn public_service() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "orders",
                "namespace": "shop",
                "uid": "svc-uid",
                "resourceVersion": "7",
                "labels": {"app": "orders"}
            },
            "spec": {
                "type": "NodePort",
                "clusterIP": "10.0.0.4",
                "clusterIPs": ["10.0.0.4"],
                "selector": {"app": "orders"},
                "ports": [{"name": "http", "port": 80, "targetPort": 8080, "nodePort": 30080}]
            }
        })
    }

    fn owner() -> ElastiService {
        ElastiService::from_value(json!({
            "metadata": {"name": "orders-es", "namespace": "shop", "uid": "es-uid"},
            "spec": {"service": "orders"}
        }))
        .unwrap()
    }

    #[test]
    fn test_private_service_copy() {
        let private = private_service_from(&public_service(), &owner());
        assert_eq!(private.name(), names::private_service_name("orders"));
        assert_eq!(private.namespace(), "shop");
        assert!(private.pointer("/metadata/resourceVersion").is_none());
        assert!(private.pointer("/metadata/uid").is_none());
        assert!(private.pointer("/spec/clusterIP").is_none());
        assert!(private.pointer("/spec/clusterIPs").is_none());
        assert!(private.pointer("/spec/ports/0/nodePort").is_none());
        assert_eq!(private["spec"]["selector"]["app"], "orders");
        assert_eq!(private["metadata"]["ownerReferences"][0]["uid"], "es-uid");
        assert_eq!(
            private["metadata"]["ownerReferences"][0]["kind"],
            "ElastiService"
        );
    }

    #[test]
    fn test_slice_copy_relabels() {
        let source = json!({
            "apiVersion": "discovery.k8s.io/v1",
            "kind": "EndpointSlice",
            "metadata": {
                "name": "elasti-resolver-service-abcde",
                "namespace": "elasti",
                "uid": "x",
                "resourceVersion": "3",
                "labels": {"kubernetes.io/service-name": "elasti-resolver-service", "team": "infra"}
            },
            "addressType": "IPv4",
            "endpoints": [{"addresses": ["10.1.0.9"]}],
            "ports": [{"port": 8012}]
        });
        let slice = slice_to_resolver_from(&source, "shop", "orders", 1);
        assert_eq!(slice.name(), names::indexed_endpoint_slice_name("orders", 1));
        assert_eq!(slice.namespace(), "shop");
        assert_eq!(slice.label(names::SERVICE_NAME_LABEL), Some("orders"));
        assert_eq!(slice.label(names::OWNER_LABEL), Some("elastiservice"));
        assert_eq!(slice.label("team"), Some("infra"));
        assert!(slice.pointer("/metadata/uid").is_none());
        assert_eq!(slice["endpoints"][0]["addresses"][0], "10.1.0.9");
    }
}
