use crate::error::SubmitError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

type Body<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send>;
type Completion<T, E> = Box<dyn FnOnce(&Result<T, TaskFailure<E>>) + Send>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskFailure<E> {
    #[error("{0}")]
    Failed(E),
    #[error("task panicked: {0}")]
    Panicked(String),
}

pub struct Task<T, E> {
    id: Uuid,
    body: Body<T, E>,
    on_complete: Option<Completion<T, E>>,
}

impl<T, E> Task<T, E> {
    pub fn new(body: impl FnOnce() -> Result<T, E> + Send + 'static) -> Self {
        Self::with_id(Uuid::new_v4(), body)
    }

    pub fn with_id(id: Uuid, body: impl FnOnce() -> Result<T, E> + Send + 'static) -> Self {
        Self {
            id,
            body: Box::new(body),
            on_complete: None,
        }
    }

    pub fn on_complete(
        mut self,
        callback: impl FnOnce(&Result<T, TaskFailure<E>>) + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Debug)]
pub struct TaskResult<T, E> {
    pub task_id: Uuid,
    pub outcome: Result<T, TaskFailure<E>>,
}

impl<T, E> TaskResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

struct Shared<T, E> {
    queue: Mutex<VecDeque<Task<T, E>>>,
    not_empty: Condvar,
    capacity: usize,
    unfinished: Mutex<usize>,
    all_done: Condvar,
}

struct Running {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct WorkerPool<T, E> {
    workers: usize,
    shared: Arc<Shared<T, E>>,
    running: Mutex<Option<Running>>,
    results_tx: mpsc::Sender<TaskResult<T, E>>,
    results_rx: Mutex<mpsc::Receiver<TaskResult<T, E>>>,
}

impl<T, E> WorkerPool<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (results_tx, results_rx) = mpsc::channel();
        Self {
            workers: workers.max(1),
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                not_empty: Condvar::new(),
                capacity,
                unfinished: Mutex::new(0),
                all_done: Condvar::new(),
            }),
            running: Mutex::new(None),
            results_tx,
            results_rx: Mutex::new(results_rx),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&stop);
            let results = self.results_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("batch-worker-{i}"))
                .spawn(move || worker_loop(&shared, &stop, &results));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => error!("failed to spawn batch worker {i}: {err}"),
            }
        }
        info!(workers = handles.len(), capacity = self.shared.capacity, "worker pool started");
        *running = Some(Running { stop, handles });
    }

    /// Signals every worker and joins those that exit within `timeout`.
    /// Workers still busy after that are detached, not killed; they exit
    /// once their current task returns. Returns how many were joined.
    pub fn stop(&self, timeout: Duration) -> usize {
        let Some(Running { stop, handles }) = self.running.lock().take() else {
            return 0;
        };
        stop.store(true, Ordering::SeqCst);
        self.shared.not_empty.notify_all();

        let deadline = Instant::now() + timeout;
        let mut pending = handles;
        let mut joined = 0;
        while !pending.is_empty() && Instant::now() < deadline {
            let (finished, still_running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|h| h.is_finished());
            for handle in finished {
                if handle.join().is_err() {
                    warn!("batch worker exited by panic");
                }
                joined += 1;
            }
            pending = still_running;
            if !pending.is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
        }
        if !pending.is_empty() {
            warn!(abandoned = pending.len(), "worker pool stop timed out; detaching busy workers");
        }
        info!(joined, "worker pool stopped");
        joined
    }

    pub fn try_submit(&self, task: Task<T, E>) -> Result<Uuid, SubmitError> {
        let id = task.id;
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                warn!(capacity = self.shared.capacity, "task queue full, rejecting task");
                return Err(SubmitError::QueueFull(self.shared.capacity));
            }
            *self.shared.unfinished.lock() += 1;
            queue.push_back(task);
        }
        self.shared.not_empty.notify_one();
        debug!(%id, "task queued");
        Ok(id)
    }

    pub fn submit(&self, task: Task<T, E>) -> bool {
        self.try_submit(task).is_ok()
    }

    pub fn submit_batch(&self, tasks: impl IntoIterator<Item = Task<T, E>>) -> usize {
        let mut accepted = 0;
        for task in tasks {
            if !self.submit(task) {
                break;
            }
            accepted += 1;
        }
        accepted
    }

    pub fn wait_for_results(&self, n: usize, timeout: Duration) -> Vec<TaskResult<T, E>> {
        let deadline = Instant::now() + timeout;
        let rx = self.results_rx.lock();
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(result) => out.push(result),
                Err(_) => break,
            }
        }
        out
    }

    pub fn wait_all(&self, timeout: Duration) -> Vec<TaskResult<T, E>> {
        let deadline = Instant::now() + timeout;
        {
            let mut unfinished = self.shared.unfinished.lock();
            while *unfinished > 0 {
                if self
                    .shared
                    .all_done
                    .wait_until(&mut unfinished, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }
        let rx = self.results_rx.lock();
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }
}

impl<T, E> Drop for WorkerPool<T, E> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.stop.store(true, Ordering::SeqCst);
            self.shared.not_empty.notify_all();
        }
    }
}

fn worker_loop<T, E>(
    shared: &Shared<T, E>,
    stop: &AtomicBool,
    results: &mpsc::Sender<TaskResult<T, E>>,
) {
    while !stop.load(Ordering::SeqCst) {
        let task = {
            let mut queue = shared.queue.lock();
            if queue.is_empty() {
                shared.not_empty.wait_for(&mut queue, POLL_INTERVAL);
            }
            queue.pop_front()
        };
        let Some(task) = task else {
            continue;
        };
        run_task(task, results);

        let mut unfinished = shared.unfinished.lock();
        *unfinished = unfinished.saturating_sub(1);
        if *unfinished == 0 {
            shared.all_done.notify_all();
        }
    }
}

fn run_task<T, E>(task: Task<T, E>, results: &mpsc::Sender<TaskResult<T, E>>) {
    let Task {
        id,
        body,
        on_complete,
    } = task;
    let outcome = match catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(TaskFailure::Failed(err)),
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            error!(task = %id, "task panicked: {msg}");
            Err(TaskFailure::Panicked(msg))
        }
    };
    if let Some(callback) = on_complete
        && catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err()
    {
        error!(task = %id, "task completion callback panicked");
    }
    // The receiver lives as long as the pool; a send error means the pool
    // is gone and nobody is waiting for this result.
    let _ = results.send(TaskResult {
        task_id: id,
        outcome,
    });
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Pool = WorkerPool<usize, String>;

    #[test]
    fn backpressure_without_consumers() {
        let pool = Pool::new(2, 2);
        let tasks = (0..5).map(|i| Task::new(move || Ok(i)));
        assert_eq!(pool.submit_batch(tasks), 2);
        assert_eq!(pool.queued(), 2);
        assert_eq!(
            pool.try_submit(Task::new(|| Ok(9))).unwrap_err(),
            SubmitError::QueueFull(2)
        );
    }

    #[test]
    fn queued_tasks_run_once_started() {
        let pool = Pool::new(3, 10);
        let ids = (0..6)
            .map(|i| pool.try_submit(Task::new(move || Ok(i * 10))).unwrap())
            .collect::<Vec<_>>();
        pool.start();
        let results = pool.wait_for_results(6, Duration::from_secs(5));
        assert_eq!(results.len(), 6);
        for id in ids {
            assert!(results.iter().any(|r| r.task_id == id && r.is_success()));
        }
        pool.stop(Duration::from_secs(2));
    }

    #[test]
    fn start_twice_is_a_noop_and_stop_joins_workers() {
        let pool = Pool::new(2, 4);
        pool.start();
        pool.start();
        assert!(pool.is_running());
        assert_eq!(pool.stop(Duration::from_secs(2)), 2);
        assert!(!pool.is_running());
        assert_eq!(pool.stop(Duration::from_secs(1)), 0);
    }

    #[test]
    fn failures_and_panics_become_results() {
        let pool = Pool::new(2, 4);
        pool.start();
        let failed = pool.try_submit(Task::new(|| Err("nope".to_string()))).unwrap();
        let panicked = pool
            .try_submit(Task::new(|| -> Result<usize, String> { panic!("boom") }))
            .unwrap();
        let results = pool.wait_for_results(2, Duration::from_secs(5));
        assert_eq!(results.len(), 2);
        for r in &results {
            if r.task_id == failed {
                assert_eq!(r.outcome, Err(TaskFailure::Failed("nope".to_string())));
            } else {
                assert_eq!(r.task_id, panicked);
                assert_eq!(r.outcome, Err(TaskFailure::Panicked("boom".to_string())));
            }
        }
        pool.stop(Duration::from_secs(2));
    }

    #[test]
    fn failures_display_their_cause() {
        let failed: TaskFailure<String> = TaskFailure::Failed("event 3 is full".to_string());
        assert_eq!(failed.to_string(), "event 3 is full");
        let panicked: TaskFailure<String> = TaskFailure::Panicked("boom".to_string());
        assert_eq!(panicked.to_string(), "task panicked: boom");
    }

    #[test]
    fn wait_for_results_returns_short_on_timeout() {
        let pool = Pool::new(1, 4);
        pool.submit(Task::new(|| Ok(1)));
        // Not started: nothing can complete.
        let results = pool.wait_for_results(1, Duration::from_millis(30));
        assert!(results.is_empty());
    }

    #[test]
    fn completion_callback_sees_the_outcome() {
        let pool = Pool::new(1, 4);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        pool.submit(Task::new(|| Ok(41)).on_complete(move |outcome| {
            if let Ok(v) = outcome {
                s.store(*v + 1, Ordering::SeqCst);
            }
        }));
        pool.start();
        let results = pool.wait_all(Duration::from_secs(5));
        assert_eq!(results.len(), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
        pool.stop(Duration::from_secs(2));
    }

    #[test]
    fn stop_detaches_workers_stuck_in_a_task() {
        let pool = Pool::new(1, 4);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        pool.submit(Task::new(move || {
            let _ = release_rx.lock().recv_timeout(Duration::from_secs(5));
            Ok(0)
        }));
        pool.start();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.stop(Duration::from_millis(50)), 0);
        release_tx.send(()).unwrap();
    }
}
