//! OS-thread worker pool for CPU-bound fan-out (leg resolution, per-pair
//! pricing/risk evaluation). Never used for network I/O: callers issuing
//! HTTP requests run as `async fn`s on the `tokio` runtime instead and hand
//! already-fetched data to pool tasks.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    Shutdown,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    stopping: Mutex<bool>,
    to_stop: Mutex<usize>,
    active: Mutex<usize>,
    idle_cond: Condvar,
}

/// A resizable pool of OS threads draining a FIFO task queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// A handle to a single submitted unit of work, yielding its result once the
/// worker thread has completed it.
pub struct TaskHandle<T> {
    receiver: std::sync::mpsc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    pub fn join(self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            stopping: Mutex::new(false),
            to_stop: Mutex::new(0),
            active: Mutex::new(0),
            idle_cond: Condvar::new(),
        });
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(Self::spawn_worker(id, Arc::clone(&shared)));
        }
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Size the pool to the machine's available parallelism.
    pub fn auto_sized() -> Self {
        let n = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self::new(n)
    }

    fn spawn_worker(id: usize, shared: Arc<Shared>) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("box-worker-{id}"))
            .spawn(move || Self::worker_loop(shared))
            .expect("failed to spawn worker thread")
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            let task = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break Some(task);
                    }
                    let stopping = *shared.stopping.lock().unwrap();
                    let mut to_stop = shared.to_stop.lock().unwrap();
                    if *to_stop > 0 {
                        *to_stop -= 1;
                        return;
                    }
                    if stopping {
                        return;
                    }
                    drop(to_stop);
                    queue = shared.cond.wait(queue).unwrap();
                }
            };
            let Some(task) = task else { return };

            {
                let mut active = shared.active.lock().unwrap();
                *active += 1;
            }

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
            if let Err(panic) = result {
                warn!(?panic, "worker task panicked");
            }

            let mut active = shared.active.lock().unwrap();
            *active -= 1;
            if *active == 0 && shared.queue.lock().unwrap().is_empty() {
                shared.idle_cond.notify_all();
            }
        }
    }

    /// Enqueue a unit of work, returning a handle whose `join()` yields the
    /// result. Fails if the pool has already begun shutting down.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if *self.shared.stopping.lock().unwrap() {
            return Err(PoolError::Shutdown);
        }
        let (tx, rx) = std::sync::mpsc::channel();
        let task: Task = Box::new(move || {
            let result = f();
            let _ = tx.send(result);
        });
        self.shared.queue.lock().unwrap().push_back(task);
        self.shared.cond.notify_one();
        Ok(TaskHandle { receiver: rx })
    }

    /// Grow the pool by spawning workers, or shrink it by signalling workers
    /// to exit after their current task. Shrinking waits up to a bounded
    /// grace period then proceeds regardless of whether workers have
    /// actually exited.
    pub fn resize(&self, n: usize) {
        let mut workers = self.workers.lock().unwrap();
        let current = workers.len();
        if n > current {
            for id in current..n {
                workers.push(Self::spawn_worker(id, Arc::clone(&self.shared)));
            }
        } else if n < current {
            let to_remove = current - n;
            *self.shared.to_stop.lock().unwrap() += to_remove;
            self.shared.cond.notify_all();
            let grace = Duration::from_secs(3);
            let start = std::time::Instant::now();
            while *self.shared.to_stop.lock().unwrap() > 0 && start.elapsed() < grace {
                std::thread::sleep(Duration::from_millis(20));
            }
            workers.retain(|h| !h.is_finished());
            debug!(remaining = workers.len(), "pool resize grace period elapsed");
        }
    }

    pub fn active_count(&self) -> usize {
        *self.shared.active.lock().unwrap()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Block until the queue is empty and no task is running.
    pub fn wait_idle(&self) {
        let queue_empty = |shared: &Shared| shared.queue.lock().unwrap().is_empty();
        loop {
            let active = self.shared.active.lock().unwrap();
            if *active == 0 && queue_empty(&self.shared) {
                return;
            }
            let _unused = self.shared.idle_cond.wait_timeout(active, Duration::from_millis(50));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        *self.shared.stopping.lock().unwrap() = true;
        self.shared.cond.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn submitted_tasks_all_complete_exactly_once() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..50 {
            let counter = Arc::clone(&counter);
            handles.push(
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    i
                })
                .unwrap(),
            );
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        let mut results: Vec<i32> = handles.into_iter().filter_map(|h| h.join()).collect();
        results.sort();
        assert_eq!(results, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn submit_after_drop_like_shutdown_is_rejected() {
        let pool = WorkerPool::new(1);
        *pool.shared.stopping.lock().unwrap() = true;
        let result = pool.submit(|| 1);
        assert!(matches!(result, Err(PoolError::Shutdown)));
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let pool = WorkerPool::new(2);
        pool.resize(4);
        assert_eq!(pool.workers.lock().unwrap().len(), 4);
        pool.resize(1);
        assert!(pool.workers.lock().unwrap().len() <= 4);
    }
}
