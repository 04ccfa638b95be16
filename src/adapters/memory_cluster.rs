//! In-process resource store implementing [`ClusterApi`].
//!
//! Used by tests and local runs. It mimics the API server closely enough for
//! the controller: resource versions, uids, finalizer-gated deletion and a
//! watch feed that replays current objects before live changes.
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures_util::{StreamExt, stream};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::ports::cluster::{
    ClusterApi, ClusterError, ClusterResult, ObjectExt, ResourceKind, WatchEvent, WatchStream,
    merge_patch, parse_label_selector,
};

type ObjectKey = (ResourceKind, String, String);

const WATCH_BUFFER: usize = 1024;

#[derive(Clone)]
struct WatchFilter {
    kind: ResourceKind,
    namespace: String,
    name: Option<String>,
}

impl WatchFilter {
    fn matches(&self, kind: ResourceKind, object: &Value) -> bool {
        kind == self.kind
            && (self.namespace.is_empty() || object.namespace() == self.namespace)
            && self.name.as_deref().is_none_or(|n| object.name() == n)
    }
}

pub struct MemoryCluster {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    feed: broadcast::Sender<(ResourceKind, WatchEvent)>,
    version: AtomicU64,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            feed,
            version: AtomicU64::new(1),
        }
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn publish(&self, kind: ResourceKind, event: WatchEvent) {
        // no receivers is fine
        let _ = self.feed.send((kind, event));
    }

    fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> ClusterError {
        ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Store an updated object, or drop it when its last finalizer is gone
    /// after deletion was requested.
    fn commit(
        &self,
        objects: &mut BTreeMap<ObjectKey, Value>,
        key: ObjectKey,
        mut object: Value,
    ) -> Value {
        let kind = key.0;
        set_meta(&mut object, "resourceVersion", Value::String(self.next_version()));
        if object.is_being_deleted() && object.finalizers().is_empty() {
            objects.remove(&key);
            self.publish(kind, WatchEvent::Deleted(object.clone()));
        } else {
            objects.insert(key, object.clone());
            self.publish(kind, WatchEvent::Modified(object.clone()));
        }
        object
    }
}

fn set_meta(object: &mut Value, field: &str, value: Value) {
    if !object.get("metadata").is_some_and(Value::is_object) {
        object["metadata"] = Value::Object(Default::default());
    }
    object["metadata"][field] = value;
}

fn matches_selector(object: &Value, selector: &[(String, String)]) -> bool {
    selector
        .iter()
        .all(|(k, v)| object.label(k) == Some(v.as_str()))
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<Value> {
        let objects = self.objects.lock().await;
        objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Self::not_found(kind, namespace, name))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> ClusterResult<Vec<Value>> {
        let selector = label_selector.map(parse_label_selector).unwrap_or_default();
        let objects = self.objects.lock().await;
        Ok(objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.is_none_or(|want| want == ns.as_str()))
            .filter(|(_, object)| matches_selector(object, &selector))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        mut object: Value,
    ) -> ClusterResult<Value> {
        let name = object.name().to_string();
        if name.is_empty() {
            return Err(ClusterError::Invalid(format!("{kind} without a name")));
        }
        let key = (kind, namespace.to_string(), name.clone());

        let mut objects = self.objects.lock().await;
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name,
            });
        }
        set_meta(&mut object, "namespace", Value::String(namespace.to_string()));
        set_meta(&mut object, "uid", Value::String(uuid::Uuid::new_v4().to_string()));
        set_meta(&mut object, "resourceVersion", Value::String(self.next_version()));
        set_meta(
            &mut object,
            "creationTimestamp",
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        objects.insert(key, object.clone());
        self.publish(kind, WatchEvent::Added(object.clone()));
        Ok(object)
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        mut object: Value,
    ) -> ClusterResult<Value> {
        let key = (kind, namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().await;
        let current = objects
            .get(&key)
            .ok_or_else(|| Self::not_found(kind, namespace, name))?;

        let sent_version = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty());
        let stored_version = current.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        if sent_version.is_some() && sent_version != stored_version {
            return Err(ClusterError::Api(format!(
                "conflict replacing {kind} {namespace}/{name}"
            )));
        }

        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            if let Some(v) = current.pointer(&format!("/metadata/{field}")) {
                set_meta(&mut object, field, v.clone());
            }
        }
        set_meta(&mut object, "name", Value::String(name.to_string()));
        set_meta(&mut object, "namespace", Value::String(namespace.to_string()));
        // status is only written through patch_status
        match current.get("status") {
            Some(status) => object["status"] = status.clone(),
            None => {
                if let Some(map) = object.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        Ok(self.commit(&mut objects, key, object))
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ClusterResult<Value> {
        let key = (kind, namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().await;
        let mut object = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(kind, namespace, name))?;
        merge_patch(&mut object, &patch);
        set_meta(&mut object, "name", Value::String(name.to_string()));
        set_meta(&mut object, "namespace", Value::String(namespace.to_string()));
        Ok(self.commit(&mut objects, key, object))
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> ClusterResult<Value> {
        let status = patch.get("status").cloned().unwrap_or(Value::Null);
        let key = (kind, namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().await;
        let mut object = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(kind, namespace, name))?;
        if !object.get("status").is_some_and(Value::is_object) {
            object["status"] = Value::Object(Default::default());
        }
        merge_patch(&mut object["status"], &status);
        Ok(self.commit(&mut objects, key, object))
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> ClusterResult<()> {
        let key = (kind, namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().await;
        let Some(object) = objects.get(&key).cloned() else {
            return Err(Self::not_found(kind, namespace, name));
        };

        if object.finalizers().is_empty() {
            objects.remove(&key);
            self.publish(kind, WatchEvent::Deleted(object));
            return Ok(());
        }
        if !object.is_being_deleted() {
            let mut object = object;
            set_meta(
                &mut object,
                "deletionTimestamp",
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
            self.commit(&mut objects, key, object);
        }
        Ok(())
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: Option<&str>,
    ) -> ClusterResult<WatchStream> {
        let filter = Arc::new(WatchFilter {
            kind,
            namespace: namespace.to_string(),
            name: name.map(str::to_string),
        });

        // Subscribe while holding the store so no change falls between the
        // snapshot and the live feed.
        let objects = self.objects.lock().await;
        let receiver = self.feed.subscribe();
        let snapshot: Vec<ClusterResult<WatchEvent>> = objects
            .iter()
            .filter(|((k, _, _), object)| filter.matches(*k, object))
            .map(|(_, object)| Ok(WatchEvent::Added(object.clone())))
            .collect();
        drop(objects);

        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let filter = filter.clone();
            async move {
                match item {
                    Ok((_, WatchEvent::Synced)) => None,
                    Ok((kind, event)) => {
                        let matches = match &event {
                            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => {
                                filter.matches(kind, o)
                            }
                            WatchEvent::Synced => false,
                        };
                        matches.then_some(Ok(event))
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(ClusterError::Watch(
                        format!("watch fell behind by {skipped} events"),
                    ))),
                }
            }
        });

        Ok(stream::iter(snapshot)
            .chain(stream::once(async { Ok(WatchEvent::Synced) }))
            .chain(live)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn service(name: &str, labels: Value) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": name, "labels": labels},
            "spec": {"ports": [{"port": 80}]}
        })
    }

    #[tokio::test]
    async fn test_crud_and_selectors() {
        let cluster = MemoryCluster::new();
        let created = cluster
            .create(ResourceKind::Service, "shop", service("orders", json!({"app": "orders"})))
            .await
            .unwrap();
        assert_eq!(created.namespace(), "shop");
        assert!(created.pointer("/metadata/uid").is_some());

        let dup = cluster
            .create(ResourceKind::Service, "shop", service("orders", json!({})))
            .await
            .unwrap_err();
        assert!(dup.is_already_exists());

        cluster
            .create(ResourceKind::Service, "shop", service("cart", json!({"app": "cart"})))
            .await
            .unwrap();
        let selected = cluster
            .list(ResourceKind::Service, Some("shop"), Some("app=cart"))
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name(), "cart");
        assert_eq!(
            cluster.list(ResourceKind::Service, None, None).await.unwrap().len(),
            2
        );

        cluster.delete(ResourceKind::Service, "shop", "cart").await.unwrap();
        assert!(
            cluster
                .get(ResourceKind::Service, "shop", "cart")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let cluster = MemoryCluster::new();
        let v1 = cluster
            .create(ResourceKind::Service, "shop", service("orders", json!({})))
            .await
            .unwrap();
        cluster
            .patch(ResourceKind::Service, "shop", "orders", json!({"spec": {"type": "ClusterIP"}}))
            .await
            .unwrap();
        assert!(
            cluster
                .replace(ResourceKind::Service, "shop", "orders", v1)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_finalizers_gate_deletion() {
        let cluster = MemoryCluster::new();
        let mut es = json!({"metadata": {"name": "orders-es", "finalizers": ["x/y"]}, "spec": {}});
        cluster
            .create(ResourceKind::ElastiService, "shop", es.clone())
            .await
            .unwrap();

        cluster
            .delete(ResourceKind::ElastiService, "shop", "orders-es")
            .await
            .unwrap();
        es = cluster
            .get(ResourceKind::ElastiService, "shop", "orders-es")
            .await
            .unwrap();
        assert!(es.is_being_deleted());

        cluster
            .patch(
                ResourceKind::ElastiService,
                "shop",
                "orders-es",
                json!({"metadata": {"finalizers": []}}),
            )
            .await
            .unwrap();
        assert!(
            cluster
                .get(ResourceKind::ElastiService, "shop", "orders-es")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_watch_replays_then_follows() {
        let cluster = MemoryCluster::new();
        cluster
            .create(ResourceKind::Service, "shop", service("orders", json!({})))
            .await
            .unwrap();
        cluster
            .create(ResourceKind::Service, "other", service("orders", json!({})))
            .await
            .unwrap();

        let mut stream = cluster
            .watch(ResourceKind::Service, "shop", Some("orders"))
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Added(_)))));
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Synced))));

        cluster
            .patch(ResourceKind::Service, "other", "orders", json!({"spec": {"type": "X"}}))
            .await
            .unwrap();
        cluster
            .patch(ResourceKind::Service, "shop", "orders", json!({"spec": {"type": "Y"}}))
            .await
            .unwrap();
        match stream.next().await {
            Some(Ok(WatchEvent::Modified(o))) => {
                assert_eq!(o.namespace(), "shop");
                assert_eq!(o["spec"]["type"], "Y");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        cluster.delete(ResourceKind::Service, "shop", "orders").await.unwrap();
        assert!(matches!(stream.next().await, Some(Ok(WatchEvent::Deleted(_)))));
    }

    #[tokio::test]
    async fn test_patch_status_only_touches_status() {
        let cluster = MemoryCluster::new();
        cluster
            .create(
                ResourceKind::ElastiService,
                "shop",
                json!({"metadata": {"name": "orders-es"}, "spec": {"service": "orders"}}),
            )
            .await
            .unwrap();
        let updated = cluster
            .patch_status(
                ResourceKind::ElastiService,
                "shop",
                "orders-es",
                json!({"status": {"mode": "proxy"}, "spec": {"service": "ignored"}}),
            )
            .await
            .unwrap();
        assert_eq!(updated["status"]["mode"], "proxy");
        assert_eq!(updated["spec"]["service"], "orders");
    }
}
