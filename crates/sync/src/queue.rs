//! Delayed multi-producer/single-consumer work queue.
//!
//! Watch callbacks produce, the sync loop consumes. Items are delivered no
//! earlier than their scheduled ready time; a duplicate of an item that is
//! still pending coalesces into the earlier schedule. Shutdown unblocks a
//! blocked `pop`.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Work item for the sync loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncItem {
    /// Recompute the whole subtree from the local mirror.
    Reload,
    /// A single tracked object changed.
    Object(String),
}

struct Scheduled {
    ready: Instant,
    seq: u64,
    item: SyncItem,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.ready == other.ready && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready.cmp(&other.ready).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<Scheduled>>,
    pending: FxHashSet<SyncItem>,
    shutdown: bool,
    seq: u64,
}

/// Cloning yields another handle onto the same queue.
#[derive(Clone, Default)]
pub struct SyncQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `item` for delivery after `delay`. No-op if an equal item is
    /// already pending or the queue is shut down.
    pub fn push_after(&self, item: SyncItem, delay: Duration) {
        {
            let mut state = self.lock();
            if state.shutdown || state.pending.contains(&item) {
                return;
            }
            state.pending.insert(item.clone());
            let seq = state.seq;
            state.seq += 1;
            state.heap.push(Reverse(Scheduled {
                ready: Instant::now() + delay,
                seq,
                item,
            }));
        }
        self.notify.notify_one();
    }

    /// Schedule `item` for immediate delivery.
    pub fn push(&self, item: SyncItem) {
        self.push_after(item, Duration::ZERO);
    }

    /// Drop every pending item. Blocked pops stay blocked.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.heap.clear();
        state.pending.clear();
    }

    /// Drop pending items and wake a blocked `pop` with `None`.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            state.shutdown = true;
            state.heap.clear();
            state.pending.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next ready item; `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<SyncItem> {
        loop {
            // Register interest before re-checking state so a push between
            // the check and the await cannot be lost.
            let notified = self.notify.notified();
            let wait = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                let now = Instant::now();
                match state.heap.peek().map(|Reverse(next)| next.ready) {
                    Some(ready) if ready <= now => {
                        if let Some(Reverse(next)) = state.heap.pop() {
                            state.pending.remove(&next.item);
                            return Some(next.item);
                        }
                        continue;
                    }
                    Some(ready) => Some(ready - now),
                    None => None,
                }
            };
            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
