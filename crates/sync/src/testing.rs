//! Watch source double for engine tests: a fixed initial listing plus
//! handles to drive later events by hand.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use kopa_core::ResourceDescriptor;

use crate::mirror::{Mirror, MirrorEntry};
use crate::queue::{SyncItem, SyncQueue};
use crate::{WatchHandle, WatchSource};

#[derive(Default)]
struct StaticState {
    initial: Vec<(String, MirrorEntry)>,
    fail: Option<String>,
    handles: Option<(Mirror, SyncQueue)>,
}

/// Shared-state watch source: `establish` primes the mirror with the
/// configured objects and exposes the mirror/queue pair so a test can
/// simulate watch callbacks afterwards.
#[derive(Clone, Default)]
pub struct StaticWatchSource {
    state: Arc<Mutex<StaticState>>,
}

impl StaticWatchSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source whose `establish` fails, as an unreachable API would.
    pub fn failing(message: &str) -> Self {
        let source = Self::new();
        source.lock().fail = Some(message.to_string());
        source
    }

    /// Add `(key, resource_version, value)` to the initial listing.
    pub fn seed(&self, key: &str, resource_version: &str, value: Value) {
        self.lock().initial.push((
            key.to_string(),
            MirrorEntry {
                resource_version: resource_version.to_string(),
                value,
            },
        ));
    }

    /// Simulate an add/update notification.
    pub fn apply(&self, key: &str, resource_version: &str, value: Value) {
        if let Some((mirror, queue)) = self.handles() {
            if mirror.upsert(key, resource_version, value) {
                queue.push(SyncItem::Object(key.to_string()));
            }
        }
    }

    /// Simulate a delete notification.
    pub fn delete(&self, key: &str) {
        if let Some((mirror, queue)) = self.handles() {
            if mirror.remove(key) {
                queue.push(SyncItem::Object(key.to_string()));
            }
        }
    }

    /// Mirror and queue wired to the engine, once `establish` has run.
    pub fn handles(&self) -> Option<(Mirror, SyncQueue)> {
        self.lock().handles.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WatchSource for StaticWatchSource {
    async fn establish(
        &self,
        _descriptor: &ResourceDescriptor,
        _ignore_namespaces: &[String],
        mirror: Mirror,
        queue: SyncQueue,
        _token: CancellationToken,
    ) -> Result<WatchHandle, anyhow::Error> {
        let mut state = self.lock();
        if let Some(message) = &state.fail {
            return Err(anyhow::anyhow!("{}", message));
        }
        mirror.replace_all(state.initial.iter().cloned());
        state.handles = Some((mirror, queue));
        Ok(WatchHandle::detached())
    }
}
