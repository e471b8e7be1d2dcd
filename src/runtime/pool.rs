//! Fixed-size worker pool fed by a bounded task queue.
//!
//! The pool is generic over the task payload; the logic run for each task
//! is injected as a handler at construction. Submission never blocks: a
//! full queue hands the task straight back to the caller.

use crate::runtime::sync::{lock, Semaphore};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// What happens to queued tasks when the pool shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownPolicy {
    /// Workers finish every queued task before exiting.
    #[default]
    Drain,
    /// Queued tasks are removed and returned to the caller.
    Discard,
}

/// Submission failures. The rejected task is handed back.
pub enum PoolError<T> {
    /// The queue is at capacity.
    QueueFull(T),
    /// The pool no longer accepts tasks.
    ShutDown(T),
}

impl<T> PoolError<T> {
    /// Recover the rejected task.
    pub fn into_inner(self) -> T {
        match self {
            PoolError::QueueFull(task) | PoolError::ShutDown(task) => task,
        }
    }
}

impl<T> fmt::Debug for PoolError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::QueueFull(_) => f.write_str("QueueFull(..)"),
            PoolError::ShutDown(_) => f.write_str("ShutDown(..)"),
        }
    }
}

impl<T> fmt::Display for PoolError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::QueueFull(_) => write!(f, "worker queue is full"),
            PoolError::ShutDown(_) => write!(f, "worker pool is shut down"),
        }
    }
}

impl<T> std::error::Error for PoolError<T> {}

struct QueueState<T> {
    tasks: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer task queue.
///
/// The mutex guards the deque; the semaphore counts queued tasks so that
/// consumers park without holding the lock.
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    items: Semaphore,
    capacity: usize,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            items: Semaphore::new(0),
            capacity,
        }
    }

    /// Enqueue a task without blocking.
    pub fn push(&self, task: T) -> Result<(), PoolError<T>> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(PoolError::ShutDown(task));
            }
            if state.tasks.len() >= self.capacity {
                return Err(PoolError::QueueFull(task));
            }
            state.tasks.push_back(task);
        }
        self.items.release();
        Ok(())
    }

    /// Block until a task is available.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        if !self.items.acquire() {
            return None;
        }
        lock(&self.state).tasks.pop_front()
    }

    /// Stop accepting tasks and wake every blocked consumer.
    ///
    /// With `ShutdownPolicy::Discard` the queued tasks are removed and
    /// returned.
    pub fn close(&self, policy: ShutdownPolicy) -> Vec<T> {
        let discarded = {
            let mut state = lock(&self.state);
            state.closed = true;
            match policy {
                ShutdownPolicy::Drain => Vec::new(),
                ShutdownPolicy::Discard => state.tasks.drain(..).collect(),
            }
        };
        // Permits left behind by discarded tasks make `pop` return `None`.
        self.items.close();
        discarded
    }

    pub fn len(&self) -> usize {
        lock(&self.state).tasks.len()
    }
}

/// Fixed set of persistent worker threads.
pub struct WorkerPool<T: Send + 'static> {
    queue: Arc<TaskQueue<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads, each running `handler` on dequeued tasks.
    pub fn new<F>(workers: usize, capacity: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 || capacity == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker pool needs at least one worker and a non-zero queue",
            ));
        }

        let queue = Arc::new(TaskQueue::new(capacity));
        let handler = Arc::new(handler);
        let mut pool = Self {
            queue,
            workers: Vec::with_capacity(workers),
        };

        for worker_id in 0..workers {
            let queue = Arc::clone(&pool.queue);
            let handler = Arc::clone(&handler);

            // On a spawn failure, dropping `pool` joins the workers already started.
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &queue, &*handler))?;

            pool.workers.push(handle);
        }

        debug!(workers, capacity, "Worker pool started");
        Ok(pool)
    }

    /// Queue a task for a worker.
    pub fn submit(&self, task: T) -> Result<(), PoolError<T>> {
        self.queue.push(task)
    }

    /// Stop accepting tasks, wake all workers and join them.
    ///
    /// Returns the tasks dropped from the queue under
    /// `ShutdownPolicy::Discard`. Calling it again is a no-op.
    pub fn shutdown(&mut self, policy: ShutdownPolicy) -> Vec<T> {
        let discarded = self.queue.close(policy);

        for handle in self.workers.drain(..) {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                error!(worker = ?name, "Worker panicked");
            }
        }

        discarded
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of worker threads still running.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown(ShutdownPolicy::Drain);
    }
}

fn worker_loop<T, F>(worker_id: usize, queue: &TaskQueue<T>, handler: &F)
where
    F: Fn(T),
{
    debug!(worker = worker_id, "Worker started");
    while let Some(task) = queue.pop() {
        handler(task);
    }
    debug!(worker = worker_id, "Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier, Condvar};
    use std::time::Duration;

    /// Blocks workers until opened.
    struct Gate {
        open: Mutex<bool>,
        cond: Condvar,
    }

    impl Gate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: Mutex::new(false),
                cond: Condvar::new(),
            })
        }

        fn wait(&self) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }

        fn open(&self) {
            *self.open.lock().unwrap() = true;
            self.cond.notify_all();
        }
    }

    #[test]
    fn test_tasks_run_on_workers() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let pool = WorkerPool::new(4, 16, move |n: u32| {
            let name = thread::current().name().unwrap().to_owned();
            tx.lock().unwrap().send((n * 2, name)).unwrap();
        })
        .unwrap();

        for n in 0..10 {
            pool.submit(n).unwrap();
        }

        let mut results: Vec<(u32, String)> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        results.sort();
        let doubled: Vec<u32> = results.iter().map(|(n, _)| *n).collect();
        assert_eq!(doubled, (0..10).map(|n| n * 2).collect::<Vec<_>>());
        assert!(results.iter().all(|(_, name)| name.starts_with("worker-")));
    }

    #[test]
    fn test_queue_full() {
        let gate = Gate::new();
        let started = Arc::new(Barrier::new(3));
        let pool = {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            WorkerPool::new(2, 3, move |n: usize| {
                if n < 2 {
                    started.wait();
                }
                gate.wait();
            })
            .unwrap()
        };

        // Occupy both workers.
        pool.submit(0).unwrap();
        pool.submit(1).unwrap();
        started.wait();

        for n in 2..5 {
            pool.submit(n).unwrap();
        }
        assert_eq!(pool.queued(), 3);

        match pool.submit(5) {
            Err(PoolError::QueueFull(task)) => assert_eq!(task, 5),
            other => panic!("unexpected: {:?}", other),
        }

        gate.open();
        drop(pool);
    }

    #[test]
    fn test_single_owner_per_task() {
        // Stands in for one connection: only one worker may hold it at once.
        let in_flight = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let (token_tx, token_rx) = mpsc::channel::<()>();
        let token_tx = Mutex::new(token_tx);

        let mut pool = {
            let in_flight = Arc::clone(&in_flight);
            let overlaps = Arc::clone(&overlaps);
            let done = Arc::clone(&done);
            WorkerPool::new(8, 64, move |(): ()| {
                if in_flight.swap(true, Ordering::AcqRel) {
                    overlaps.fetch_add(1, Ordering::Relaxed);
                }
                thread::yield_now();
                in_flight.store(false, Ordering::Release);
                done.fetch_add(1, Ordering::Relaxed);
                token_tx.lock().unwrap().send(()).unwrap();
            })
            .unwrap()
        };

        // The owner resubmits only after the previous run handed the token back.
        pool.submit(()).unwrap();
        for _ in 0..999 {
            token_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            pool.submit(()).unwrap();
        }
        token_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.shutdown(ShutdownPolicy::Drain);
        assert_eq!(done.load(Ordering::Relaxed), 1000);
        assert_eq!(overlaps.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_graceful_shutdown_drains_queue() {
        let gate = Gate::new();
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            WorkerPool::new(2, 100, move |_: usize| {
                gate.wait();
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        for n in 0..20 {
            pool.submit(n).unwrap();
        }

        let opener = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.open();
            })
        };

        let discarded = pool.shutdown(ShutdownPolicy::Drain);
        opener.join().unwrap();

        assert!(discarded.is_empty());
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert_eq!(pool.workers(), 0);
        assert!(matches!(pool.submit(99), Err(PoolError::ShutDown(99))));
    }

    #[test]
    fn test_discard_policy_returns_queued_tasks() {
        let gate = Gate::new();
        let started = Arc::new(Barrier::new(2));
        let done = Arc::new(AtomicUsize::new(0));
        let mut pool = {
            let gate = Arc::clone(&gate);
            let started = Arc::clone(&started);
            let done = Arc::clone(&done);
            WorkerPool::new(1, 10, move |n: usize| {
                if n == 0 {
                    started.wait();
                }
                gate.wait();
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        for n in 0..5 {
            pool.submit(n).unwrap();
        }
        started.wait();

        let opener = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                gate.open();
            })
        };

        let mut discarded = pool.shutdown(ShutdownPolicy::Discard);
        opener.join().unwrap();
        discarded.sort();

        assert_eq!(discarded, vec![1, 2, 3, 4]);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(WorkerPool::new(0, 10, |_: ()| {}).is_err());
        assert!(WorkerPool::new(1, 0, |_: ()| {}).is_err());
    }

    #[test]
    fn test_queue_pop_after_close() {
        let queue = TaskQueue::new(4);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.close(ShutdownPolicy::Drain);

        assert!(matches!(queue.push(3), Err(PoolError::ShutDown(3))));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }
}
