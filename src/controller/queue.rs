// src/controller/queue.rs

//! De-duplicating work queue
//!
//! A name is queued at most once, and is never handed to two workers at the
//! same time: adding a name that is being processed marks it dirty, and it
//! is queued again when the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct QueueState {
    /// Waiting names, in arrival order
    pending: VecDeque<String>,
    /// Mirror of `pending` for de-duplication
    queued: HashSet<String>,
    /// Names a worker is processing
    active: HashSet<String>,
    /// Active names added again; requeued on `done`
    dirty: HashSet<String>,
    /// Consecutive failures per name
    failures: HashMap<String, u32>,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a name unless it is already waiting
    pub async fn add(&self, name: &str) {
        let mut state = self.state.lock().await;
        if state.queued.contains(name) {
            return;
        }
        if state.active.contains(name) {
            state.dirty.insert(name.to_string());
            return;
        }
        state.queued.insert(name.to_string());
        state.pending.push_back(name.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Queue a name once `delay` has passed
    pub fn add_after(self: &Arc<Self>, name: String, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&name).await;
        });
    }

    /// Wait for the next name and mark it active
    pub async fn next(&self) -> String {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(name) = state.pending.pop_front() {
                    state.queued.remove(&name);
                    state.active.insert(name.clone());
                    let more = !state.pending.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on so idle workers see the rest
                        self.notify.notify_one();
                    }
                    return name;
                }
            }
            notified.await;
        }
    }

    /// Finish processing a name handed out by [`next`](Self::next)
    pub async fn done(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.active.remove(name);
        if state.dirty.remove(name) && state.queued.insert(name.to_string()) {
            state.pending.push_back(name.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Record a failure and return how long to wait before retrying
    ///
    /// The delay doubles with each consecutive failure, up to `max`.
    pub async fn backoff(&self, name: &str, base: Duration, max: Duration) -> Duration {
        let mut state = self.state.lock().await;
        let failures = state.failures.entry(name.to_string()).or_insert(0);
        *failures += 1;
        let exponent = (*failures - 1).min(16);
        base.saturating_mul(1u32 << exponent).min(max)
    }

    /// Reset the failure count after a successful pass
    pub async fn forget(&self, name: &str) {
        self.state.lock().await.failures.remove(name);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.pending.is_empty()
    }
}
