//! Rate-limited work queue of transaction keys.
//!
//! A key is handed to at most one worker at a time. Adding a key that a
//! worker is processing marks it dirty; it is re-queued when the worker
//! calls [`WorkQueue::done`]. Retries back off exponentially per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

#[derive(Default)]
struct Inner {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, u32>,
    shut_down: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    base: Duration,
    cap: Duration,
}

impl WorkQueue {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            base,
            cap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: &str) {
        let mut inner = self.lock();
        if inner.shut_down {
            return;
        }
        if inner.processing.contains(key) {
            inner.dirty.insert(key.to_string());
            return;
        }
        if inner.queued.insert(key.to_string()) {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Retry `key` after its backoff, never sooner than `floor`.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str, floor: Duration) {
        let delay = {
            let mut inner = self.lock();
            let failures = inner.failures.entry(key.to_string()).or_insert(0);
            let delay = self.backoff(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        let delay = delay.max(floor);
        debug!(key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(20));
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            // Register before checking so a shutdown in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shut_down {
                    return None;
                }
                if let Some(key) = inner.queue.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as no longer being processed.
    pub fn done(&self, key: &str) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.remove(key) && !inner.shut_down && inner.queued.insert(key.to_string()) {
            inner.queue.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Wake every waiter and refuse new keys.
    pub fn shut_down(&self) {
        let mut inner = self.lock();
        inner.shut_down = true;
        inner.queue.clear();
        inner.queued.clear();
        inner.dirty.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Accept keys again after a shutdown.
    pub fn restart(&self) {
        let mut inner = self.lock();
        inner.shut_down = false;
        inner.failures.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
