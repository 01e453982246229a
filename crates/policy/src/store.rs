//! Local policy store: module sources, recompiled on every commit, with a
//! change notification for the analyzer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::graph::CompiledPolicy;

/// Receives policy modules discovered elsewhere (e.g. the ConfigMap sync).
pub trait PolicySink: Send + Sync {
    fn upsert_module(&self, id: &str, source: &str);
    fn remove_module(&self, id: &str);
}

/// Module id → source text; every mutation recompiles the whole set and
/// publishes the new compiled policy to subscribers.
pub struct PolicyStore {
    modules: Mutex<BTreeMap<String, String>>,
    tx: watch::Sender<Arc<CompiledPolicy>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        let (tx, _) = watch::channel(Arc::new(CompiledPolicy::default()));
        Self {
            modules: Mutex::new(BTreeMap::new()),
            tx,
        }
    }
}

impl PolicyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to compiled-policy commits. The initial value is the empty
    /// policy; `changed()` resolves on the next commit.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CompiledPolicy>> {
        self.tx.subscribe()
    }

    /// Latest committed policy.
    pub fn current(&self) -> Arc<CompiledPolicy> {
        self.tx.borrow().clone()
    }

    fn commit(&self) {
        let modules = self
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let (policy, errors) = CompiledPolicy::compile(&modules);
        for err in &errors {
            warn!(error = %err, "policy module skipped during compile");
        }
        debug!(
            modules = modules.len(),
            rules = policy.rules.len(),
            skipped = errors.len(),
            "policy store committed"
        );
        // send_replace notifies even when no receiver is registered yet.
        self.tx.send_replace(Arc::new(policy));
    }
}

impl PolicySink for PolicyStore {
    fn upsert_module(&self, id: &str, source: &str) {
        self.modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), source.to_string());
        self.commit();
    }

    fn remove_module(&self, id: &str) {
        let removed = self
            .modules
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        if removed {
            self.commit();
        }
    }
}
