//! Kopa replication engine: watch, queue, and write loops that keep the
//! remote document tree consistent with the cluster.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use kopa_core::ResourceDescriptor;

mod engine;
mod mirror;
mod queue;
pub mod testing;

pub use engine::{generate_sync_payload, GenericSync};
pub use mirror::{Mirror, MirrorEntry};
pub use queue::{SyncItem, SyncQueue};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The watch could not be established; fatal to this engine only.
    #[error("watch setup: {0}")]
    Setup(#[source] anyhow::Error),
}

/// Seam between a replication engine and the cluster.
///
/// An implementation primes the mirror with an initial listing (failing the
/// call if that listing cannot be obtained), then keeps the mirror fresh in
/// the background, pushing `SyncItem::Object` for every real change.
/// Configured namespaces must be excluded from both the listing and the
/// live watch.
#[async_trait]
pub trait WatchSource: Send + Sync {
    async fn establish(
        &self,
        descriptor: &ResourceDescriptor,
        ignore_namespaces: &[String],
        mirror: Mirror,
        queue: SyncQueue,
        token: CancellationToken,
    ) -> Result<WatchHandle, anyhow::Error>;
}

/// Running watch task; `stop` waits for it to wind down after its token has
/// been cancelled.
pub struct WatchHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WatchHandle {
    pub fn new(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Handle with no background task (test sources).
    pub fn detached() -> Self {
        Self { task: None }
    }

    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "watch task ended abnormally");
            }
        }
    }
}
