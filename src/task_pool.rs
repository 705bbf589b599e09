//! Per-source serial task queues.
//!
//! Tasks emitted under one key run one at a time in submission order on a
//! worker dedicated to that key; different keys never wait on each other.
//! Queues are unbounded, so no task is dropped. Tasks should be short: work
//! that waits on the network belongs in its own `tokio::spawn`.

use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

/// How long an idle worker waits for more tasks before retiring.
pub const DEFAULT_WORKER_IDLE: Duration = Duration::from_millis(500);

pub type Task = Box<dyn FnOnce() + Send + 'static>;

type Queues<K> = Arc<Mutex<FxHashMap<K, mpsc::UnboundedSender<Task>>>>;

pub struct UdpTaskPool<K> {
    queues: Queues<K>,
    idle: Duration,
}

impl<K> UdpTaskPool<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_WORKER_IDLE)
    }

    pub fn with_idle_timeout(idle: Duration) -> Self {
        Self {
            queues: Arc::default(),
            idle,
        }
    }

    /// Queue `task` behind every task previously emitted for `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn emit_task<F>(&self, key: K, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task: Task = Box::new(task);
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(tx) = queues.get(&key) {
            match tx.send(task) {
                Ok(()) => return,
                // The worker is gone; start a new one with the task.
                Err(mpsc::error::SendError(returned)) => task = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail: `rx` is alive.
        let _ = tx.send(task);
        queues.insert(key.clone(), tx);
        drop(queues);

        tokio::spawn(run_worker(key, rx, self.queues.clone(), self.idle));
    }

    /// Number of sources with a live worker.
    pub fn len(&self) -> usize {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for UdpTaskPool<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker<K>(
    key: K,
    mut rx: mpsc::UnboundedReceiver<Task>,
    queues: Queues<K>,
    idle: Duration,
) where
    K: Eq + Hash,
{
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(task)) => {
                // A panicking task must not take the rest of the queue with it.
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    tracing::warn!("queued task panicked");
                }
            }
            Ok(None) => return,
            Err(_) => {
                // Senders only push while holding the map lock, so an empty
                // queue observed under the lock stays empty once we leave.
                let mut queues = queues.lock().unwrap_or_else(|e| e.into_inner());
                if rx.is_empty() {
                    queues.remove(&key);
                    return;
                }
            }
        }
    }
}
