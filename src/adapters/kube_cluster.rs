use async_trait::async_trait;
use futures_util::{StreamExt, future};
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, GroupVersionKind},
    runtime::watcher,
};
use serde_json::Value;

use crate::ports::cluster::{ClusterApi, ClusterError, ClusterResult, ResourceKind, WatchEvent, WatchStream};

/// ClusterApi backed by the Kubernetes API server through dynamic objects.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with in-cluster credentials, falling back to the local kubeconfig.
    pub async fn connect() -> eyre::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        let resource = api_resource(kind);
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        }
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    let (group, version) = kind.group_version();
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk(group, version, kind.kind()),
        kind.plural(),
    )
}

fn map_error(kind: ResourceKind, namespace: &str, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 422 || resp.code == 400 => {
            ClusterError::Invalid(resp.message)
        }
        other => ClusterError::Api(format!("{kind} {namespace}/{name}: {other}")),
    }
}

/// Serialize a dynamic object, restoring the type fields list responses omit.
fn to_value(kind: ResourceKind, object: &DynamicObject) -> ClusterResult<Value> {
    let mut value =
        serde_json::to_value(object).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.entry("apiVersion")
            .or_insert_with(|| Value::from(kind.api_version()));
        map.entry("kind").or_insert_with(|| Value::from(kind.kind()));
    }
    Ok(value)
}

fn from_value(kind: ResourceKind, mut value: Value) -> ClusterResult<DynamicObject> {
    if let Value::Object(map) = &mut value {
        map.entry("apiVersion")
            .or_insert_with(|| Value::from(kind.api_version()));
        map.entry("kind").or_insert_with(|| Value::from(kind.kind()));
    }
    serde_json::from_value(value).map_err(|e| ClusterError::Invalid(format!("{kind}: {e}")))
}

/// Translate watcher events; re-lists after the first sync surface as
/// modifications so consumers see `Synced` once.
fn translate(
    kind: ResourceKind,
    synced: &mut bool,
    event: Result<watcher::Event<DynamicObject>, watcher::Error>,
) -> Option<ClusterResult<WatchEvent>> {
    let event = match event {
        Ok(event) => event,
        Err(e) => return Some(Err(ClusterError::Watch(format!("{kind}: {e}")))),
    };
    let converted = match event {
        watcher::Event::Init => return None,
        watcher::Event::InitApply(obj) if !*synced => to_value(kind, &obj).map(WatchEvent::Added),
        watcher::Event::InitApply(obj) | watcher::Event::Apply(obj) => {
            to_value(kind, &obj).map(WatchEvent::Modified)
        }
        watcher::Event::Delete(obj) => to_value(kind, &obj).map(WatchEvent::Deleted),
        watcher::Event::InitDone if *synced => return None,
        watcher::Event::InitDone => {
            *synced = true;
            Ok(WatchEvent::Synced)
        }
    };
    Some(converted)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<Value> {
        let object = self
            .api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| map_error(kind, namespace, name, e))?;
        to_value(kind, &object)
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> ClusterResult<Vec<Value>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let ns = namespace.unwrap_or_default();
        let list = self
            .api(kind, ns)
            .list(&params)
            .await
            .map_err(|e| map_error(kind, ns, "", e))?;
        list.items.iter().map(|obj| to_value(kind, obj)).collect()
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        object: Value,
    ) -> ClusterResult<Value> {
        let object = from_value(kind, object)?;
        let name = object.metadata.name.clone().unwrap_or_default();
        let created = self
            .api(kind, namespace)
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_error(kind, namespace, &name, e))?;
        to_value(kind, &created)
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> ClusterResult<Value> {
        let object = from_value(kind, object)?;
        let replaced = self
            .api(kind, namespace)
            .replace(name, &PostParams::default(), &object)
            .await
            .map_err(|e| map_error(kind, namespace, name, e))?;
        to_value(kind, &replaced)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ClusterResult<Value> {
        let patched = self
            .api(kind, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(kind, namespace, name, e))?;
        to_value(kind, &patched)
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ClusterResult<Value> {
        let patched = self
            .api(kind, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(kind, namespace, name, e))?;
        to_value(kind, &patched)
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error(kind, namespace, name, e))?;
        Ok(())
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: Option<&str>,
    ) -> ClusterResult<WatchStream> {
        let mut config = watcher::Config::default();
        if let Some(name) = name {
            config = config.fields(&format!("metadata.name={name}"));
        }
        let mut synced = false;
        let stream = watcher(self.api(kind, namespace), config)
            .filter_map(move |event| future::ready(translate(kind, &mut synced, event)));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;
    use serde_json::json;

    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_error_mapping() {
        let kind = ResourceKind::Service;
        assert!(map_error(kind, "shop", "orders", api_error(404, "NotFound")).is_not_found());
        assert!(
            map_error(kind, "shop", "orders", api_error(409, "AlreadyExists")).is_already_exists()
        );
        assert!(matches!(
            map_error(kind, "shop", "orders", api_error(409, "Conflict")),
            ClusterError::Api(_)
        ));
        assert!(matches!(
            map_error(kind, "shop", "orders", api_error(422, "Invalid")),
            ClusterError::Invalid(_)
        ));
    }

    #[test]
    fn test_api_resource_for_custom_kinds() {
        let resource = api_resource(ResourceKind::ElastiService);
        assert_eq!(resource.group, "elasti.truefoundry.com");
        assert_eq!(resource.version, "v1alpha1");
        assert_eq!(resource.plural, "elastiservices");
        assert_eq!(api_resource(ResourceKind::Service).group, "");
    }

    #[test]
    fn test_value_conversion_fills_type_fields() {
        let object = from_value(
            ResourceKind::Deployment,
            json!({"metadata": {"name": "orders", "namespace": "shop"}, "spec": {"replicas": 2}}),
        )
        .unwrap();
        let value = to_value(ResourceKind::Deployment, &object).unwrap();
        assert_eq!(value["apiVersion"], "apps/v1");
        assert_eq!(value["kind"], "Deployment");
        assert_eq!(value["spec"]["replicas"], 2);
    }

    #[test]
    fn test_translate_emits_synced_once() {
        let kind = ResourceKind::Service;
        let obj = from_value(kind, json!({"metadata": {"name": "orders"}})).unwrap();
        let mut synced = false;

        assert!(translate(kind, &mut synced, Ok(watcher::Event::Init)).is_none());
        assert!(matches!(
            translate(kind, &mut synced, Ok(watcher::Event::InitApply(obj.clone()))),
            Some(Ok(WatchEvent::Added(_)))
        ));
        assert!(matches!(
            translate(kind, &mut synced, Ok(watcher::Event::InitDone)),
            Some(Ok(WatchEvent::Synced))
        ));
        // relist after a desync
        assert!(matches!(
            translate(kind, &mut synced, Ok(watcher::Event::InitApply(obj.clone()))),
            Some(Ok(WatchEvent::Modified(_)))
        ));
        assert!(translate(kind, &mut synced, Ok(watcher::Event::InitDone)).is_none());
        assert!(matches!(
            translate(kind, &mut synced, Ok(watcher::Event::Delete(obj))),
            Some(Ok(WatchEvent::Deleted(_)))
        ));
    }
}
