//! Dependency-driven replication: analyze the consuming policy's rule graph
//! on every commit and keep exactly the referenced resource kinds
//! replicating.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use kopa_core::{BackoffPolicy, ResourceDescriptor};
use kopa_opa::Data;
use kopa_policy::{analyze, CompiledPolicy, Ref};
use kopa_sync::{GenericSync, WatchSource};

/// One running replication engine in the active set.
struct RunningSync {
    token: CancellationToken,
    loaded: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct ReconcilerState {
    running: HashMap<ResourceDescriptor, RunningSync>,
    /// True once an analysis result has been applied successfully.
    ready: bool,
}

/// Owns the active replication set. All mutations and readiness queries go
/// through one mutex, which is never held across an await.
pub struct DynamicSync {
    writer: Box<dyn Data>,
    source: Arc<dyn WatchSource>,
    /// Plural resource name → descriptor, resolved once at startup.
    resources: HashMap<String, ResourceDescriptor>,
    entrypoint: Ref,
    prefix: Ref,
    ignore_namespaces: Vec<String>,
    backoff: BackoffPolicy,
    state: Mutex<ReconcilerState>,
}

impl DynamicSync {
    /// `writer` must already be scoped to the replication path; engines
    /// derive their own per-resource prefix from it. `entrypoint` and
    /// `replicate_path` are slash-separated document pointers (e.g.
    /// `"system/main"`, `"kubernetes"`).
    pub fn new(
        writer: Box<dyn Data>,
        source: Arc<dyn WatchSource>,
        resources: HashMap<String, ResourceDescriptor>,
        entrypoint: &str,
        replicate_path: &str,
        ignore_namespaces: Vec<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            writer,
            source,
            resources,
            entrypoint: Ref::from_pointer(entrypoint),
            prefix: Ref::from_pointer(replicate_path),
            ignore_namespaces,
            backoff,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Ready once analysis has been applied and every running engine has
    /// completed its first reload.
    pub fn ready(&self) -> bool {
        let state = self.lock();
        if !state.ready {
            debug!("dynamic sync not ready: no analysis applied");
            return false;
        }
        for (descriptor, running) in &state.running {
            if !running.loaded.load(Ordering::SeqCst) {
                debug!(resource = %descriptor, "dynamic sync not ready: engine not loaded");
                return false;
            }
        }
        true
    }

    /// Descriptors currently replicating, sorted for stable output.
    pub fn active(&self) -> Vec<ResourceDescriptor> {
        let mut out: Vec<ResourceDescriptor> = self.lock().running.keys().cloned().collect();
        out.sort_by(|a, b| a.resource.cmp(&b.resource));
        out
    }

    /// Consume policy commits until `token` is cancelled.
    pub async fn run(
        &self,
        mut updates: watch::Receiver<Arc<CompiledPolicy>>,
        token: CancellationToken,
    ) {
        // Commits that landed before we subscribed still deserve a pass.
        updates.mark_changed();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        info!("policy store closed; dynamic sync stopping");
                        break;
                    }
                }
            }
            let policy = updates.borrow_and_update().clone();
            let analysis = analyze(&policy, &self.entrypoint, &self.prefix);
            if !analysis.missing.is_empty() {
                debug!(
                    entrypoint = %self.entrypoint,
                    "entrypoint unresolved; keeping current replication set"
                );
                continue;
            }
            debug!(kinds = ?analysis.kinds, "analysis result");
            self.apply_kinds(&analysis.kinds, &token);
        }
        self.shutdown().await;
    }

    /// Reconcile the active set against the discovered kinds.
    fn apply_kinds(&self, kinds: &[String], parent: &CancellationToken) {
        let mut state = self.lock();

        // Resolve every kind first; an unresolvable one fails the whole
        // result and leaves the set as it was.
        let mut descriptors = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self.resources.get(kind) {
                Some(descriptor) => descriptors.push(descriptor.clone()),
                None => {
                    error!(
                        resource = %kind,
                        "cannot resolve resource to group/version/resource for replication"
                    );
                    state.ready = false;
                    return;
                }
            }
        }
        state.ready = true;

        for descriptor in &descriptors {
            if state.running.contains_key(descriptor) {
                debug!(resource = %descriptor, "replication already running");
                continue;
            }
            info!(resource = %descriptor, "starting replication");
            let running = self.start_engine(descriptor.clone(), parent);
            state.running.insert(descriptor.clone(), running);
        }

        state.running.retain(|descriptor, running| {
            if descriptors.contains(descriptor) {
                true
            } else {
                info!(resource = %descriptor, "stopping replication");
                running.token.cancel();
                false
            }
        });
    }

    fn start_engine(&self, descriptor: ResourceDescriptor, parent: &CancellationToken) -> RunningSync {
        let engine = GenericSync::new(
            descriptor.clone(),
            &*self.writer,
            self.backoff,
            self.ignore_namespaces.clone(),
        );
        let loaded = engine.loaded_flag();
        let token = parent.child_token();
        let task = {
            let source = Arc::clone(&self.source);
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run(&*source, token).await {
                    error!(resource = %descriptor, error = %err, "replication failed to start");
                }
            })
        };
        RunningSync {
            token,
            loaded,
            task,
        }
    }

    async fn shutdown(&self) {
        let tasks: Vec<(ResourceDescriptor, tokio::task::JoinHandle<()>)> = {
            let mut state = self.lock();
            state.ready = false;
            state
                .running
                .drain()
                .map(|(descriptor, running)| {
                    running.token.cancel();
                    (descriptor, running.task)
                })
                .collect()
        };
        for (descriptor, task) in tasks {
            if let Err(err) = task.await {
                error!(resource = %descriptor, error = %err, "replication task ended abnormally");
            }
        }
        info!("dynamic sync stopped");
    }

    fn lock(&self) -> MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
