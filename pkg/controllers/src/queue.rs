use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Keys waiting to be processed, queued or not.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Level-triggered work queue.
///
/// A key is handed to at most one worker at a time. Adding a key that is
/// already queued is a no-op; adding a key that is being processed queues
/// it again once `done` is called for it.
pub struct WorkQueue<K> {
    state: Arc<Mutex<QueueState<K>>>,
    notify: Arc<Notify>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub async fn add(&self, key: K) {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds `key` once `delay` has passed.
    pub fn add_after(&self, key: K, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Waits for the next key. `None` once the queue is shut down and empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as processed, queueing it again if it was re-added.
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn shut_down(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
