//! Generic resource replication: reload-then-incremental rounds with
//! exponential backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kopa_core::{BackoffPolicy, ResourceDescriptor};
use kopa_opa::Data;

use crate::mirror::Mirror;
use crate::queue::{SyncItem, SyncQueue};
use crate::{SyncError, WatchSource};

/// Replicates one resource kind into the remote document tree.
///
/// `run` blocks until the token is cancelled and errors only when the watch
/// cannot be established; every later failure is absorbed by abandoning the
/// round and reloading after backoff.
pub struct GenericSync {
    descriptor: ResourceDescriptor,
    opa: Box<dyn Data>,
    backoff: BackoffPolicy,
    ignore_namespaces: Vec<String>,
    loaded: Arc<AtomicBool>,
}

impl GenericSync {
    /// `writer` is scoped by the descriptor's resource name, so the engine's
    /// subtree root is `<replicate-path>/<resource>`.
    pub fn new(
        descriptor: ResourceDescriptor,
        writer: &dyn Data,
        backoff: BackoffPolicy,
        ignore_namespaces: Vec<String>,
    ) -> Self {
        let opa = writer.prefix(&descriptor.resource);
        Self {
            descriptor,
            opa,
            backoff,
            ignore_namespaces,
            loaded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sticky flag, set once the first reload of any round has landed.
    pub fn loaded_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.loaded)
    }

    pub fn ready(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Drive replication until `token` is cancelled.
    pub async fn run(&self, source: &dyn WatchSource, token: CancellationToken) -> Result<(), SyncError> {
        let mirror = Mirror::new();
        let queue = SyncQueue::new();
        let watch = source
            .establish(
                &self.descriptor,
                &self.ignore_namespaces,
                mirror.clone(),
                queue.clone(),
                token.child_token(),
            )
            .await
            .map_err(SyncError::Setup)?;
        info!(resource = %self.descriptor, objects = mirror.len(), "replication started");

        let mut backoff = self.backoff.backoff();
        let mut delay = Duration::ZERO;
        loop {
            queue.push_after(SyncItem::Reload, delay);
            let mut loaded_round = false;
            let failure = loop {
                let item = tokio::select! {
                    _ = token.cancelled() => None,
                    item = queue.pop() => item,
                };
                let Some(item) = item else {
                    queue.shut_down();
                    watch.stop().await;
                    info!(resource = %self.descriptor, "replication stopped");
                    return Ok(());
                };
                match item {
                    SyncItem::Reload if !loaded_round => match self.reload(&mirror).await {
                        Ok(count) => {
                            loaded_round = true;
                            backoff.reset();
                            self.loaded.store(true, Ordering::SeqCst);
                            counter!("kopa_sync_reloads_total", 1u64);
                            debug!(resource = %self.descriptor, count, "reload complete");
                        }
                        Err(err) => break err,
                    },
                    // Already satisfied within this round.
                    SyncItem::Reload => {}
                    SyncItem::Object(key) if loaded_round => {
                        if let Err(err) = self.sync_one(&mirror, &key).await {
                            break err;
                        }
                    }
                    // The round's reload is still ahead of us and will pick
                    // this change up from the mirror.
                    SyncItem::Object(_) => {}
                }
            };
            queue.clear();
            delay = backoff.next();
            counter!("kopa_sync_failures_total", 1u64);
            warn!(
                resource = %self.descriptor,
                error = %failure,
                retry_in = ?delay,
                "sync failed; abandoning round and reloading after backoff"
            );
        }
    }

    /// Replace the whole subtree with a projection of the mirror.
    async fn reload(&self, mirror: &Mirror) -> Result<usize, kopa_opa::Error> {
        let snapshot = mirror.snapshot();
        let count = snapshot.len();
        let payload = generate_sync_payload(snapshot, self.descriptor.namespaced);
        self.opa.put_data("/", &payload).await?;
        Ok(count)
    }

    /// Write or remove one key, whichever the mirror currently says.
    async fn sync_one(&self, mirror: &Mirror, key: &str) -> Result<(), kopa_opa::Error> {
        match mirror.get(key) {
            Some(value) => self.opa.put_data(key, &value).await,
            None => self.opa.patch_data(key, "remove", None).await,
        }
    }
}

/// Deterministic projection of the mirror: `{ns: {name: obj}}` for
/// namespaced kinds, `{name: obj}` otherwise.
pub fn generate_sync_payload(objs: Vec<(String, Value)>, namespaced: bool) -> Value {
    let mut combined = Map::with_capacity(objs.len());
    for (key, obj) in objs {
        if namespaced {
            let (ns, name) = match key.split_once('/') {
                Some(pair) => pair,
                // A key without a namespace segment should not occur for a
                // namespaced kind; file it under its own name.
                None => ("", key.as_str()),
            };
            let entry = combined
                .entry(ns.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(by_name) = entry {
                by_name.insert(name.to_string(), obj);
            }
        } else {
            combined.insert(key, obj);
        }
    }
    Value::Object(combined)
}
