//! Kopa kubehub – discovery and cluster watch wiring

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kopa_core::{resource_key, ResourceDescriptor};
use kopa_sync::{Mirror, MirrorEntry, SyncItem, SyncQueue, WatchHandle, WatchSource};

/// Map served resources (incl. CRDs) by plural name, for resolving
/// analyzer-discovered kind names to descriptors.
pub async fn discover_resources(client: Client) -> Result<HashMap<String, ResourceDescriptor>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = HashMap::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            let descriptor =
                ResourceDescriptor::new(&ar.group, &ar.version, &ar.plural, namespaced);
            debug!(resource = %descriptor, namespaced, "discovered resource");
            out.insert(ar.plural.clone(), descriptor);
        }
    }
    Ok(out)
}

async fn find_api_resource(client: Client, descriptor: &ResourceDescriptor) -> Result<ApiResource> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, _caps) in group.recommended_resources() {
            if ar.group == descriptor.group
                && ar.version == descriptor.version
                && ar.plural == descriptor.resource
            {
                return Ok(ar.clone());
            }
        }
    }
    Err(anyhow!("resource not served: {}", descriptor))
}

/// Field selector excluding the configured namespaces, applied to both the
/// initial list and the live watch so excluded objects never reach us.
fn namespace_exclusion_selector(ignore: &[String]) -> Option<String> {
    if ignore.is_empty() {
        return None;
    }
    Some(
        ignore
            .iter()
            .map(|ns| format!("metadata.namespace!={}", ns))
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Shape one object into `(key, resourceVersion, value)`.
fn project(obj: &DynamicObject, namespaced: bool) -> Result<(String, String, serde_json::Value)> {
    let name = obj
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let key = resource_key(obj.metadata.namespace.as_deref(), name, namespaced);
    let version = obj.metadata.resource_version.clone().unwrap_or_default();
    let mut value = serde_json::to_value(obj).context("serializing object")?;
    strip_managed_fields(&mut value);
    Ok((key, version, value))
}

/// Reconcile a watcher relist against the mirror: every changed or new key
/// and every vanished key is queued, everything else stays quiet.
fn apply_relist(mirror: &Mirror, queue: &SyncQueue, fresh: Vec<(String, String, serde_json::Value)>) {
    let mut seen: Vec<String> = Vec::with_capacity(fresh.len());
    for (key, version, value) in fresh {
        seen.push(key.clone());
        if mirror.upsert(&key, &version, value) {
            queue.push(SyncItem::Object(key));
        }
    }
    for key in mirror.keys() {
        if !seen.contains(&key) {
            mirror.remove(&key);
            queue.push(SyncItem::Object(key));
        }
    }
}

/// Watch source backed by the cluster API. The initial list primes the
/// mirror and is fatal on failure; the spawned task keeps the mirror fresh
/// until its token is cancelled.
#[derive(Clone)]
pub struct KubeWatchSource {
    client: Client,
}

impl KubeWatchSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WatchSource for KubeWatchSource {
    async fn establish(
        &self,
        descriptor: &ResourceDescriptor,
        ignore_namespaces: &[String],
        mirror: Mirror,
        queue: SyncQueue,
        token: CancellationToken,
    ) -> Result<WatchHandle> {
        let ar = find_api_resource(self.client.clone(), descriptor).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let selector = namespace_exclusion_selector(ignore_namespaces);

        let mut lp = ListParams::default();
        if let Some(sel) = &selector {
            lp = lp.fields(sel);
        }
        let list = api.list(&lp).await.context("initial list")?;
        let namespaced = descriptor.namespaced;
        let mut primed = Vec::with_capacity(list.items.len());
        for obj in &list.items {
            let (key, version, value) = project(obj, namespaced)?;
            primed.push((
                key,
                MirrorEntry {
                    resource_version: version,
                    value,
                },
            ));
        }
        mirror.replace_all(primed);
        info!(resource = %descriptor, objects = mirror.len(), "initial list complete");

        let mut cfg = watcher::Config::default();
        if let Some(sel) = &selector {
            cfg = cfg.fields(sel);
        }
        let resource = descriptor.clone();
        let task = tokio::spawn(async move {
            let stream = watcher::watcher(api, cfg);
            futures::pin_mut!(stream);
            debug!(resource = %resource, "watch started");
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = stream.next() => event,
                };
                match event {
                    Some(Ok(Event::Applied(obj))) => match project(&obj, namespaced) {
                        Ok((key, version, value)) => {
                            if mirror.upsert(&key, &version, value) {
                                queue.push(SyncItem::Object(key));
                            }
                        }
                        Err(err) => warn!(resource = %resource, error = %err, "dropping event"),
                    },
                    Some(Ok(Event::Deleted(obj))) => match project(&obj, namespaced) {
                        Ok((key, _, _)) => {
                            if mirror.remove(&key) {
                                queue.push(SyncItem::Object(key));
                            }
                        }
                        Err(err) => warn!(resource = %resource, error = %err, "dropping event"),
                    },
                    Some(Ok(Event::Restarted(objs))) => {
                        debug!(resource = %resource, count = objs.len(), "watch relist");
                        let mut fresh = Vec::with_capacity(objs.len());
                        for obj in &objs {
                            match project(obj, namespaced) {
                                Ok(shaped) => fresh.push(shaped),
                                Err(err) => {
                                    warn!(resource = %resource, error = %err, "dropping relisted object")
                                }
                            }
                        }
                        apply_relist(&mirror, &queue, fresh);
                    }
                    // The watcher re-establishes itself; a relist follows.
                    Some(Err(err)) => warn!(resource = %resource, error = %err, "watch error"),
                    None => {
                        warn!(resource = %resource, "watch stream ended");
                        break;
                    }
                }
            }
            debug!(resource = %resource, "watch stopped");
        });

        Ok(WatchHandle::new(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(name: &str, ns: Option<&str>, version: &str) -> DynamicObject {
        let mut meta = json!({
            "name": name,
            "resourceVersion": version,
            "managedFields": [{"manager": "kopa"}],
        });
        if let Some(ns) = ns {
            meta["namespace"] = json!(ns);
        }
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Thing",
            "metadata": meta,
        }))
        .unwrap()
    }

    #[test]
    fn selector_excludes_each_namespace() {
        assert_eq!(namespace_exclusion_selector(&[]), None);
        assert_eq!(
            namespace_exclusion_selector(&["kube-system".into(), "opa".into()]),
            Some("metadata.namespace!=kube-system,metadata.namespace!=opa".to_string())
        );
    }

    #[test]
    fn project_builds_key_and_strips_managed_fields() {
        let (key, version, value) = project(&dynamic("pod1", Some("ns1"), "5"), true).unwrap();
        assert_eq!(key, "ns1/pod1");
        assert_eq!(version, "5");
        assert!(value["metadata"].get("managedFields").is_none());
        assert_eq!(value["metadata"]["name"], json!("pod1"));

        let (key, _, _) = project(&dynamic("node1", None, "1"), false).unwrap();
        assert_eq!(key, "node1");
    }

    #[test]
    fn relist_queues_changes_and_removals() {
        let mirror = Mirror::new();
        let queue = SyncQueue::new();
        mirror.upsert("a", "1", json!(1));
        mirror.upsert("b", "1", json!(1));

        apply_relist(
            &mirror,
            &queue,
            vec![
                ("a".to_string(), "1".to_string(), json!(1)), // unchanged
                ("c".to_string(), "1".to_string(), json!(3)), // new
            ],
        );

        assert!(mirror.contains("a"));
        assert!(!mirror.contains("b"));
        assert!(mirror.contains("c"));
        // Only the new key and the vanished key produce work.
        assert_eq!(queue.len(), 2);
    }
}
