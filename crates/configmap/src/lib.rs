//! ConfigMap policy/data synchronization.
//!
//! Watches labeled ConfigMaps, publishes each key as a policy module or a
//! JSON data document at `namespace/name/key`, and patches a status
//! annotation back onto the object after every attempt. Failed policy
//! uploads are retried through a bounded counter persisted as an
//! annotation, so the countdown survives a process restart. A failed data
//! removal wipes the remote store and republishes everything known, since a
//! partially applied remove cannot be trusted.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::watcher::{self, Event},
    Client,
};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kopa_core::BackoffPolicy;
use kopa_policy::PolicySink;

mod matcher;

pub use matcher::{fingerprint, Classification, MatcherConfig};

pub const STATUS_ANNOTATION: &str = "kopa.dev/status";
pub const RETRIES_ANNOTATION: &str = "kopa.dev/retries";

const DEFAULT_RETRIES: i64 = 2;

/// Writes annotations back onto watched objects. Seam so the sync logic
/// runs clusterless in tests.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> anyhow::Result<()>;
}

/// Annotation writer backed by the cluster API (strategic-merge patch).
pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({"metadata": {"annotations": annotations}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[derive(serde::Serialize)]
struct SyncStatus {
    status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    error: Vec<String>,
}

impl SyncStatus {
    fn ok() -> Self {
        Self {
            status: "ok",
            error: Vec::new(),
        }
    }

    fn error(errors: Vec<String>) -> Self {
        Self {
            status: "error",
            error: errors,
        }
    }
}

/// Last-seen state of one matched ConfigMap; enough to undo its documents
/// and to republish them after a reset.
#[derive(Debug, Clone)]
struct CmRecord {
    resource_version: String,
    fingerprint: u64,
    classification: Classification,
    data: BTreeMap<String, String>,
}

/// Replicates policy/data ConfigMaps into the remote store.
pub struct ConfigMapSync {
    opa: Arc<dyn kopa_opa::Client>,
    status: Arc<dyn StatusWriter>,
    matcher: MatcherConfig,
    backoff: BackoffPolicy,
    sink: Option<Arc<dyn PolicySink>>,
    records: Mutex<FxHashMap<String, CmRecord>>,
}

impl ConfigMapSync {
    pub fn new(
        opa: Arc<dyn kopa_opa::Client>,
        status: Arc<dyn StatusWriter>,
        matcher: MatcherConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            opa,
            status,
            matcher,
            backoff,
            sink: None,
            records: Mutex::new(FxHashMap::default()),
        }
    }

    /// Also commit matched policy modules to a local store (feeds the
    /// dependency analyzer).
    pub fn with_policy_sink(mut self, sink: Arc<dyn PolicySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Watch the configured namespaces until `token` is cancelled.
    pub async fn run(self: Arc<Self>, client: Client, token: CancellationToken) -> anyhow::Result<()> {
        let scopes: Vec<Option<String>> = if self.matcher.namespaces.iter().any(|ns| ns == "*") {
            vec![None]
        } else {
            self.matcher.namespaces.iter().cloned().map(Some).collect()
        };
        info!(namespaces = ?self.matcher.namespaces, "configmap sync starting");
        let mut tasks = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let api: Api<ConfigMap> = match &scope {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            };
            let sync = Arc::clone(&self);
            let task_token = token.child_token();
            tasks.push(tokio::spawn(async move {
                sync.watch_scope(api, scope, task_token).await;
            }));
        }
        token.cancelled().await;
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "configmap watch task ended abnormally");
            }
        }
        info!("configmap sync stopped");
        Ok(())
    }

    async fn watch_scope(&self, api: Api<ConfigMap>, scope: Option<String>, token: CancellationToken) {
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        debug!(ns = %scope.as_deref().unwrap_or("(all)"), "configmap watch started");
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(Event::Applied(cm))) => self.process_applied(&cm, &token).await,
                Some(Ok(Event::Deleted(cm))) => self.process_deleted(&cm, &token).await,
                Some(Ok(Event::Restarted(cms))) => {
                    self.process_relist(&cms, scope.as_deref(), &token).await
                }
                Some(Err(err)) => warn!(error = %err, "configmap watch error"),
                None => {
                    warn!("configmap watch stream ended");
                    break;
                }
            }
        }
        debug!(ns = %scope.as_deref().unwrap_or("(all)"), "configmap watch stopped");
    }

    async fn process_applied(&self, cm: &ConfigMap, token: &CancellationToken) {
        let Some((namespace, name)) = object_id(cm) else {
            return;
        };
        let cm_key = format!("{}/{}", namespace, name);
        let version = cm.metadata.resource_version.clone().unwrap_or_default();
        let old = self.lock_records().get(&cm_key).cloned();
        if let Some(old) = &old {
            if !version.is_empty() && old.resource_version == version {
                return;
            }
        }

        let classification = self.matcher.classify(cm);
        if classification.matches() {
            let labels = cm.metadata.labels.clone().unwrap_or_default();
            let data = cm.data.clone().unwrap_or_default();
            let fp = fingerprint(&labels, &data);
            let retries = annotation(cm, RETRIES_ANNOTATION);
            let unchanged = old.as_ref().map_or(false, |o| o.fingerprint == fp);
            // A nonzero retry annotation forces a resync of unchanged
            // content; that is how the countdown proceeds.
            let skip = unchanged && retries.as_deref() == Some("0");
            debug!(
                cm = %cm_key,
                policy = classification.is_policy(),
                unchanged,
                retries = retries.as_deref().unwrap_or("-"),
                "configmap applied"
            );
            self.lock_records().insert(
                cm_key,
                CmRecord {
                    resource_version: version,
                    fingerprint: fp,
                    classification,
                    data: data.clone(),
                },
            );
            if let Some(old) = &old {
                // Label flip between policy and data: withdraw the old
                // representation before publishing the new one.
                if old.classification.matches() && old.classification != classification {
                    self.remove_documents(&namespace, &name, old, token).await;
                }
            }
            if !skip {
                self.publish(&namespace, &name, &data, classification, retries.as_deref())
                    .await;
            }
        } else if let Some(old) = old {
            debug!(cm = %cm_key, "configmap no longer matches");
            if old.classification.matches() {
                self.remove_documents(&namespace, &name, &old, token).await;
            }
            self.lock_records().remove(&cm_key);
        }
    }

    async fn process_deleted(&self, cm: &ConfigMap, token: &CancellationToken) {
        let Some((namespace, name)) = object_id(cm) else {
            return;
        };
        let cm_key = format!("{}/{}", namespace, name);
        let record = self.lock_records().remove(&cm_key).or_else(|| {
            // Never seen (e.g. deleted while we were away): classify what
            // the final object tells us.
            let classification = self.matcher.classify(cm);
            classification.matches().then(|| CmRecord {
                resource_version: String::new(),
                fingerprint: 0,
                classification,
                data: cm.data.clone().unwrap_or_default(),
            })
        });
        if let Some(record) = record {
            if record.classification.matches() {
                debug!(cm = %cm_key, "configmap deleted");
                self.remove_documents(&namespace, &name, &record, token).await;
            }
        }
    }

    async fn process_relist(&self, cms: &[ConfigMap], scope: Option<&str>, token: &CancellationToken) {
        let listed: HashSet<String> = cms.iter().filter_map(|cm| {
            object_id(cm).map(|(ns, name)| format!("{}/{}", ns, name))
        })
        .collect();
        let stale: Vec<(String, CmRecord)> = self
            .lock_records()
            .iter()
            .filter(|(key, _)| {
                let in_scope = match scope {
                    Some(ns) => key.starts_with(&format!("{}/", ns)),
                    None => true,
                };
                in_scope && !listed.contains(*key)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, record) in stale {
            if let Some((namespace, name)) = key.split_once('/') {
                debug!(cm = %key, "configmap vanished across relist");
                if record.classification.matches() {
                    self.remove_documents(namespace, name, &record, token).await;
                }
            }
            self.lock_records().remove(&key);
        }
        for cm in cms {
            self.process_applied(cm, token).await;
        }
    }

    /// Publish every key of a matched ConfigMap, then patch the status and
    /// retry annotations back (best effort).
    async fn publish(
        &self,
        namespace: &str,
        name: &str,
        data: &BTreeMap<String, String>,
        classification: Classification,
        retries_annotation: Option<&str>,
    ) {
        let path = format!("{}/{}", namespace, name);
        let mut errors: Vec<String> = Vec::new();
        // BTreeMap iterates keys sorted, so error lists are stable.
        for (key, value) in data {
            let id = format!("{}/{}", path, key);
            let result = if classification.is_policy() {
                let res = self.opa.insert_policy(&id, value.as_bytes()).await;
                if res.is_ok() {
                    if let Some(sink) = &self.sink {
                        sink.upsert_module(&id, value);
                    }
                }
                res.map_err(|e| e.to_string())
            } else {
                match serde_json::from_str::<Value>(value) {
                    Ok(doc) => self
                        .opa
                        .put_data(&id, &doc)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(err) => Err(format!("parse JSON data: {}", err)),
                }
            };
            match result {
                Ok(()) => info!(id = %id, policy = classification.is_policy(), "configmap entry synced"),
                Err(err) => {
                    warn!(id = %id, error = %err, "configmap entry failed");
                    errors.push(format!("{}: {}", key, err));
                }
            }
        }
        let retries = if errors.is_empty() || !classification.is_policy() {
            0
        } else {
            next_retries(retries_annotation)
        };
        let status = if errors.is_empty() {
            SyncStatus::ok()
        } else {
            SyncStatus::error(errors)
        };
        self.write_status(namespace, name, status, retries).await;
    }

    /// Withdraw a ConfigMap's documents from the remote store.
    async fn remove_documents(
        &self,
        namespace: &str,
        name: &str,
        record: &CmRecord,
        token: &CancellationToken,
    ) {
        let path = format!("{}/{}", namespace, name);
        if record.classification.is_policy() {
            for key in record.data.keys() {
                let id = format!("{}/{}", path, key);
                if let Err(err) = self.opa.delete_policy(&id).await {
                    error!(id = %id, error = %err, "failed to delete policy");
                }
                if let Some(sink) = &self.sink {
                    sink.remove_module(&id);
                }
            }
        } else if let Err(err) = self.opa.patch_data(&path, "remove", None).await {
            error!(path = %path, error = %err, "failed to remove data; resetting remote store");
            self.reset_and_republish(token).await;
        }
    }

    /// Wipe the remote data tree, with backoff until it succeeds, then
    /// republish everything still on record.
    async fn reset_and_republish(&self, token: &CancellationToken) {
        let mut backoff = self.backoff.backoff();
        loop {
            if token.is_cancelled() {
                return;
            }
            match self.opa.put_data("/", &Value::Object(Default::default())).await {
                Ok(()) => break,
                Err(err) => {
                    let delay = backoff.next();
                    error!(error = %err, retry_in = ?delay, "remote reset failed");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        let records: Vec<(String, CmRecord)> = self
            .lock_records()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        info!(configmaps = records.len(), "remote store reset; republishing");
        for (key, record) in records {
            if let Some((namespace, name)) = key.split_once('/') {
                self.publish(namespace, name, &record.data, record.classification, None)
                    .await;
            }
        }
    }

    async fn write_status(&self, namespace: &str, name: &str, status: SyncStatus, retries: i64) {
        let payload = match serde_json::to_string(&status) {
            Ok(payload) => payload,
            Err(err) => {
                error!(cm = %format!("{}/{}", namespace, name), error = %err, "failed to serialize status");
                return;
            }
        };
        let annotations: BTreeMap<String, String> = [
            (STATUS_ANNOTATION.to_string(), payload),
            (RETRIES_ANNOTATION.to_string(), retries.to_string()),
        ]
        .into_iter()
        .collect();
        if let Err(err) = self.status.patch_annotations(namespace, name, annotations).await {
            error!(
                cm = %format!("{}/{}", namespace, name),
                error = %err,
                "failed to patch status annotation"
            );
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, FxHashMap<String, CmRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn object_id(cm: &ConfigMap) -> Option<(String, String)> {
    match (&cm.metadata.namespace, &cm.metadata.name) {
        (Some(ns), Some(name)) => Some((ns.clone(), name.clone())),
        _ => None,
    }
}

fn annotation(cm: &ConfigMap, key: &str) -> Option<String> {
    cm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key).cloned())
}

/// Countdown for failed policy uploads: a positive annotation decrements,
/// an exhausted or missing one restarts at the default.
fn next_retries(previous: Option<&str>) -> i64 {
    match previous.and_then(|s| s.parse::<i64>().ok()) {
        Some(r) if r > 0 => r - 1,
        Some(_) => DEFAULT_RETRIES,
        None => DEFAULT_RETRIES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kopa_opa::mock::{Call, MockClient};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingStatus {
        patches: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    }

    impl RecordingStatus {
        fn patches(&self) -> Vec<(String, BTreeMap<String, String>)> {
            self.patches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl StatusWriter for RecordingStatus {
        async fn patch_annotations(
            &self,
            namespace: &str,
            name: &str,
            annotations: BTreeMap<String, String>,
        ) -> anyhow::Result<()> {
            self.patches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((format!("{}/{}", namespace, name), annotations));
            Ok(())
        }
    }

    fn configmap(
        ns: &str,
        name: &str,
        version: &str,
        labels: serde_json::Value,
        annotations: serde_json::Value,
        data: serde_json::Value,
    ) -> ConfigMap {
        serde_json::from_value(json!({
            "metadata": {
                "namespace": ns,
                "name": name,
                "resourceVersion": version,
                "labels": labels,
                "annotations": annotations,
            },
            "data": data,
        }))
        .unwrap()
    }

    fn sync_with(
        mock: &MockClient,
        status: &Arc<RecordingStatus>,
        matcher: MatcherConfig,
    ) -> ConfigMapSync {
        ConfigMapSync::new(
            Arc::new(mock.clone()),
            Arc::clone(status) as Arc<dyn StatusWriter>,
            matcher,
            BackoffPolicy {
                min: std::time::Duration::from_millis(5),
                max: std::time::Duration::from_millis(20),
                jitter: 0.0,
            },
        )
    }

    fn data_matcher() -> MatcherConfig {
        MatcherConfig {
            enable_data: true,
            ..MatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn policy_keys_publish_sorted_with_ok_status() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sync = sync_with(&mock, &status, MatcherConfig::default());
        let token = CancellationToken::new();

        let cm = configmap(
            "opa",
            "rules",
            "1",
            json!({}),
            json!({}),
            json!({"b.rego": "package b", "a.rego": "package a"}),
        );
        sync.process_applied(&cm, &token).await;

        assert_eq!(
            mock.calls(),
            vec![
                Call::InsertPolicy {
                    id: "opa/rules/a.rego".to_string(),
                    module: "package a".to_string(),
                },
                Call::InsertPolicy {
                    id: "opa/rules/b.rego".to_string(),
                    module: "package b".to_string(),
                },
            ]
        );
        let patches = status.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "opa/rules");
        assert_eq!(
            patches[0].1.get(STATUS_ANNOTATION).map(String::as_str),
            Some(r#"{"status":"ok"}"#)
        );
        assert_eq!(
            patches[0].1.get(RETRIES_ANNOTATION).map(String::as_str),
            Some("0")
        );
    }

    #[tokio::test]
    async fn data_keys_are_json_decoded() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sync = sync_with(&mock, &status, data_matcher());
        let token = CancellationToken::new();

        let cm = configmap(
            "opa",
            "settings",
            "1",
            json!({"kopa.dev/data": "json"}),
            json!({}),
            json!({"limits.json": r#"{"max": 3}"#}),
        );
        sync.process_applied(&cm, &token).await;

        assert_eq!(
            mock.calls(),
            vec![Call::PutData {
                path: "opa/settings/limits.json".to_string(),
                value: json!({"max": 3}),
            }]
        );
    }

    #[tokio::test]
    async fn malformed_json_data_reports_error_status() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sync = sync_with(&mock, &status, data_matcher());
        let token = CancellationToken::new();

        let cm = configmap(
            "opa",
            "settings",
            "1",
            json!({"kopa.dev/data": "json"}),
            json!({}),
            json!({"bad.json": "{not json"}),
        );
        sync.process_applied(&cm, &token).await;

        assert!(mock.calls().is_empty());
        let patches = status.patches();
        assert!(patches[0].1[STATUS_ANNOTATION].contains(r#""status":"error""#));
        // Data failures do not consume the policy retry budget.
        assert_eq!(patches[0].1[RETRIES_ANNOTATION], "0");
    }

    #[tokio::test]
    async fn unchanged_fingerprint_with_exhausted_retries_skips() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sync = sync_with(&mock, &status, MatcherConfig::default());
        let token = CancellationToken::new();

        let cm = configmap(
            "opa",
            "rules",
            "1",
            json!({}),
            json!({}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&cm, &token).await;
        assert_eq!(mock.calls().len(), 1);

        // Status patch bumped the version but content is unchanged and the
        // retry annotation reads 0.
        let echo = configmap(
            "opa",
            "rules",
            "2",
            json!({}),
            json!({RETRIES_ANNOTATION: "0"}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&echo, &token).await;
        assert_eq!(mock.calls().len(), 1, "no republication expected");

        // Same resource version is suppressed outright.
        sync.process_applied(&echo, &token).await;
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn failed_policy_counts_down_retries() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sync = sync_with(&mock, &status, MatcherConfig::default());
        let token = CancellationToken::new();

        mock.fail("insert_policy", "opa/rules/a.rego", 2);
        let cm = configmap(
            "opa",
            "rules",
            "1",
            json!({}),
            json!({}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&cm, &token).await;
        let patches = status.patches();
        assert_eq!(patches[0].1[RETRIES_ANNOTATION], "2");
        assert!(patches[0].1[STATUS_ANNOTATION].contains("error"));

        // The annotation patch produced a new version; content unchanged,
        // retries still counting down.
        let retry = configmap(
            "opa",
            "rules",
            "2",
            json!({}),
            json!({RETRIES_ANNOTATION: "2"}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&retry, &token).await;
        let patches = status.patches();
        assert_eq!(patches[1].1[RETRIES_ANNOTATION], "1");

        // Third attempt succeeds and resets the counter.
        let retry2 = configmap(
            "opa",
            "rules",
            "3",
            json!({}),
            json!({RETRIES_ANNOTATION: "1"}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&retry2, &token).await;
        let patches = status.patches();
        assert_eq!(patches[2].1[RETRIES_ANNOTATION], "0");
        assert_eq!(patches[2].1[STATUS_ANNOTATION], r#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn label_removal_withdraws_policies() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let mut matcher = MatcherConfig::default();
        matcher.require_label = true;
        let sync = sync_with(&mock, &status, matcher);
        let token = CancellationToken::new();

        let labelled = configmap(
            "anywhere",
            "rules",
            "1",
            json!({"kopa.dev/policy": "rego"}),
            json!({}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&labelled, &token).await;
        assert_eq!(mock.calls().len(), 1);

        let unlabelled = configmap(
            "anywhere",
            "rules",
            "2",
            json!({}),
            json!({}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&unlabelled, &token).await;
        assert_eq!(
            mock.calls()[1],
            Call::DeletePolicy {
                id: "anywhere/rules/a.rego".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn deletion_of_data_issues_one_remove() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sync = sync_with(&mock, &status, data_matcher());
        let token = CancellationToken::new();

        let cm = configmap(
            "opa",
            "settings",
            "1",
            json!({"kopa.dev/data": "json"}),
            json!({}),
            json!({"a.json": "1", "b.json": "2"}),
        );
        sync.process_applied(&cm, &token).await;
        mock.take_calls();

        sync.process_deleted(&cm, &token).await;
        assert_eq!(
            mock.calls(),
            vec![Call::PatchData {
                path: "opa/settings".to_string(),
                op: "remove".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn failed_data_removal_resets_and_republishes() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sync = sync_with(&mock, &status, data_matcher());
        let token = CancellationToken::new();

        let keep = configmap(
            "opa",
            "keep",
            "1",
            json!({"kopa.dev/data": "json"}),
            json!({}),
            json!({"k.json": "7"}),
        );
        let gone = configmap(
            "opa",
            "gone",
            "1",
            json!({"kopa.dev/data": "json"}),
            json!({}),
            json!({"g.json": "8"}),
        );
        sync.process_applied(&keep, &token).await;
        sync.process_applied(&gone, &token).await;
        mock.take_calls();

        mock.fail("patch", "opa/gone", 1);
        sync.process_deleted(&gone, &token).await;

        let calls = mock.calls();
        assert_eq!(
            calls[0],
            Call::PatchData {
                path: "opa/gone".to_string(),
                op: "remove".to_string(),
            }
        );
        // Reset wipes the root, then republishes what is still on record.
        assert_eq!(
            calls[1],
            Call::PutData {
                path: "".to_string(),
                value: json!({}),
            }
        );
        assert!(calls[2..].contains(&Call::PutData {
            path: "opa/keep/k.json".to_string(),
            value: json!(7),
        }));
        assert!(!calls[2..]
            .iter()
            .any(|c| matches!(c, Call::PutData { path, .. } if path.starts_with("opa/gone"))));
    }

    struct RecordingSink {
        events: Mutex<Vec<(String, String)>>,
    }

    impl PolicySink for RecordingSink {
        fn upsert_module(&self, id: &str, source: &str) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(("upsert".to_string(), format!("{}:{}", id, source)));
        }

        fn remove_module(&self, id: &str) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(("remove".to_string(), id.to_string()));
        }
    }

    #[tokio::test]
    async fn policy_sink_sees_uploads_and_removals() {
        let mock = MockClient::new();
        let status = Arc::new(RecordingStatus::default());
        let sink = Arc::new(RecordingSink {
            events: Mutex::new(Vec::new()),
        });
        let sync = sync_with(&mock, &status, MatcherConfig::default())
            .with_policy_sink(Arc::clone(&sink) as Arc<dyn PolicySink>);
        let token = CancellationToken::new();

        let cm = configmap(
            "opa",
            "rules",
            "1",
            json!({}),
            json!({}),
            json!({"a.rego": "package a"}),
        );
        sync.process_applied(&cm, &token).await;
        sync.process_deleted(&cm, &token).await;

        let events = sink.events.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(
            events,
            vec![
                ("upsert".to_string(), "opa/rules/a.rego:package a".to_string()),
                ("remove".to_string(), "opa/rules/a.rego".to_string()),
            ]
        );
    }
}
