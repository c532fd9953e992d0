use std::sync::{Arc, Mutex};

use crossbeam_utils::Backoff;

use crate::job::Job;
use crate::queue::JobQueue;
use crate::worker::{Interrupted, Work, WorkerControl, WorkerThread};

struct QueueWorkerInner {
    queue: Option<Arc<JobQueue>>,
    current: Option<Arc<Job>>,
    done: bool,
}

struct QueueWorkerState {
    inner: Mutex<QueueWorkerInner>,
}

impl QueueWorkerState {
    fn queue(&self) -> Option<Arc<JobQueue>> {
        self.inner.lock().unwrap().queue.clone()
    }

    fn current(&self) -> Option<Arc<Job>> {
        self.inner.lock().unwrap().current.clone()
    }

    fn set_current(&self, job: Option<Arc<Job>>) {
        self.inner.lock().unwrap().current = job;
    }

    fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    // Snapshot the queue handle, then pull outside the state lock; the pull
    // parks on the queue's block while the queue is empty.
    fn next_job(&self) -> Option<Arc<Job>> {
        let queue = {
            let inner = self.inner.lock().unwrap();
            if inner.done {
                return None;
            }
            inner.queue.clone()
        };
        queue.and_then(|queue| queue.next_job(true))
    }
}

// The polling loop each queue worker runs.
struct QueuePoller {
    state: Arc<QueueWorkerState>,
}

impl Work for QueuePoller {
    fn run(&self, ctrl: &WorkerControl) -> Result<(), Interrupted> {
        let state = &*self.state;
        let mut first_iteration = true;
        let mut leftover = None;

        let result = loop {
            if let Err(interrupted) = ctrl.checkpoint() {
                break Err(interrupted);
            }
            let valid = state.queue().is_some();
            let job = state.next_job();
            let done = state.is_done();
            if let Some(job) = job {
                if !done {
                    state.set_current(Some(job.clone()));
                    if job.is_ready() {
                        // A panicking body ends this iteration only; the
                        // worker goes back to polling.
                        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            job.start();
                        }));
                    }
                    state.set_current(None);
                } else {
                    leftover = Some(job);
                }
            }
            if first_iteration {
                std::thread::yield_now();
                first_iteration = false;
            }
            if done || !valid {
                break Ok(());
            }
        };

        state.set_current(None);
        // Shutdown raced in between the dequeue and the dispatch; don't let
        // the job evaporate without a state transition.
        if let Some(job) = leftover {
            if state.is_done() && job.is_ready() {
                job.cancel();
            }
        }
        result
    }
}

/// A worker thread bound to a shared [`JobQueue`].
///
/// The worker loops pulling the next job off the queue, parking while the
/// queue is empty, and runs each job's lifecycle on its own thread. Binding
/// a queue auto-starts the thread; [`cancel`](QueueWorker::cancel) shuts it
/// down and dropping the worker does the same.
pub struct QueueWorker {
    thread: WorkerThread,
    state: Arc<QueueWorkerState>,
}

impl QueueWorker {
    pub fn new(queue: Option<Arc<JobQueue>>) -> QueueWorker {
        let state = Arc::new(QueueWorkerState {
            inner: Mutex::new(QueueWorkerInner {
                queue: None,
                current: None,
                done: false,
            }),
        });
        let poller = Arc::new(QueuePoller {
            state: Arc::clone(&state),
        });
        let mut worker = QueueWorker {
            thread: WorkerThread::new(poller),
            state,
        };
        worker.set_job_queue(queue);
        worker
    }

    /// Swaps the queue the worker polls.
    ///
    /// The worker is paused and drained off the old queue's block before the
    /// handle changes, so it can never pull from a queue it no longer owns.
    /// Assigning a queue to a stopped worker starts it.
    pub fn set_job_queue(&mut self, queue: Option<Arc<JobQueue>>) {
        let old = self.state.queue();
        let unchanged = match (&old, &queue) {
            (None, None) => true,
            (Some(old), Some(new)) => Arc::ptr_eq(old, new),
            _ => false,
        };
        if unchanged {
            return;
        }

        self.thread.pause();
        while self.thread.is_running() && !self.thread.is_paused() {
            // The worker may be parked on the old queue's empty-block rather
            // than at a checkpoint; keep letting it through.
            if let Some(old) = &old {
                old.release_block();
            }
            std::thread::yield_now();
        }
        self.state.inner.lock().unwrap().queue = queue.clone();
        self.thread.resume();

        if queue.is_some() && !self.thread.is_running() {
            self.thread.start();
        }
    }

    pub fn job_queue(&self) -> Option<Arc<JobQueue>> {
        self.state.queue()
    }

    pub fn is_valid_queue(&self) -> bool {
        self.state.queue().is_some()
    }

    /// The job currently being processed, if any.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        self.state.current()
    }

    /// Marks the in-flight job canceled; its body decides when to stop.
    pub fn cancel_current_job(&self) {
        if let Some(job) = self.state.current() {
            job.cancel();
        }
    }

    pub fn is_processing_job(&self) -> bool {
        self.state.current().is_some()
    }

    /// True while the queue still holds jobs or one is in flight here.
    pub fn has_jobs_to_process(&self) -> bool {
        let (queue, processing) = {
            let inner = self.state.inner.lock().unwrap();
            (inner.queue.clone(), inner.current.is_some())
        };
        processing || queue.map_or(false, |queue| !queue.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.state.queue().map_or(true, |queue| queue.is_empty())
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Flags the polling loop to wind down (or un-flags it before a
    /// restart). Setting it releases whatever the worker is holding: the
    /// in-flight job's `release` hook runs and the queue block opens.
    pub fn set_done(&self, done: bool) {
        let held = {
            let mut inner = self.state.inner.lock().unwrap();
            if inner.done == done {
                return;
            }
            inner.done = done;
            if done {
                Some((inner.current.clone(), inner.queue.clone()))
            } else {
                None
            }
        };
        match held {
            Some((current, queue)) => {
                if let Some(job) = current {
                    job.release();
                }
                if let Some(queue) = queue {
                    queue.release_block();
                }
            }
            // Clearing the flag re-arms a previously canceled worker so a
            // queue assignment can start it again.
            None => self.thread.control().set_cancel(false),
        }
    }

    /// Stops the worker and does not return until its thread has exited.
    ///
    /// The in-flight job is marked canceled (its body still finishes its
    /// current stretch), and the queue block is re-released for as long as
    /// the worker might still be reaching for it.
    pub fn cancel(&self) {
        if !self.thread.is_running() {
            return;
        }
        let (current, queue) = {
            let mut inner = self.state.inner.lock().unwrap();
            inner.done = true;
            (inner.current.clone(), inner.queue.clone())
        };
        if let Some(job) = current {
            job.cancel();
        }
        // Interrupt the thread as well: a worker parked at its pause barrier
        // would otherwise never observe the done flag.
        self.thread.cancel();
        if let Some(queue) = &queue {
            queue.release_block();
        }

        let backoff = Backoff::new();
        while self.thread.is_running() {
            // The worker can re-arm the block between our checks.
            if let Some(queue) = self.state.queue() {
                queue.release_block();
            }
            backoff.snooze();
        }
    }

    pub fn start(&mut self) {
        self.thread.start();
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_running()
    }

    pub fn wait_for_completion(&self) {
        self.thread.wait_for_completion();
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct PoolInner {
    queue: Arc<JobQueue>,
    workers: Vec<QueueWorker>,
}

/// A fixed set of [`QueueWorker`]s bound to one shared [`JobQueue`].
///
/// Every worker polls the same queue; producers keep their own handle to it
/// and enqueue from any thread. A pool with zero threads is valid but inert:
/// jobs pile up on the queue until threads are added.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// Builds a pool of `n_threads` workers. When `queue` is `None` the pool
    /// allocates its own, reachable through [`job_queue`](WorkerPool::job_queue).
    pub fn new(queue: Option<Arc<JobQueue>>, n_threads: usize) -> WorkerPool {
        let pool = WorkerPool {
            inner: Mutex::new(PoolInner {
                queue: queue.unwrap_or_else(JobQueue::new),
                workers: Vec::new(),
            }),
        };
        pool.set_number_of_threads(n_threads);
        pool
    }

    /// Grows the pool with fresh workers on the shared queue, or shrinks it
    /// by retiring the tail. Surviving workers are not disturbed.
    pub fn set_number_of_threads(&self, n_threads: usize) {
        let retired = {
            let mut inner = self.inner.lock().unwrap();
            let current = inner.workers.len();
            if n_threads > current {
                let queue = inner.queue.clone();
                for _ in current..n_threads {
                    inner.workers.push(QueueWorker::new(Some(queue.clone())));
                }
                Vec::new()
            } else {
                inner.workers.drain(n_threads..).collect::<Vec<_>>()
            }
        };
        // Dropping a worker cancels it and joins its thread; do that outside
        // the pool lock.
        drop(retired);
    }

    pub fn number_of_threads(&self) -> usize {
        self.inner.lock().unwrap().workers.len()
    }

    /// Rebinds every worker to `queue`.
    pub fn set_job_queue(&self, queue: Arc<JobQueue>) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue = queue.clone();
        for worker in &mut inner.workers {
            worker.set_job_queue(Some(queue.clone()));
        }
    }

    pub fn job_queue(&self) -> Arc<JobQueue> {
        self.inner.lock().unwrap().queue.clone()
    }

    /// True while any worker still sees queued or in-flight work.
    pub fn has_jobs_to_process(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.workers.iter().any(|worker| worker.has_jobs_to_process())
    }

    pub fn number_of_busy_threads(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .workers
            .iter()
            .filter(|worker| worker.is_processing_job())
            .count()
    }

    pub fn are_all_threads_busy(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.workers.iter().all(|worker| worker.is_processing_job())
    }

    /// Cancels every worker. Each returns once its thread has exited; jobs
    /// left on the queue stay there.
    pub fn cancel(&self) {
        let inner = self.inner.lock().unwrap();
        for worker in &inner.workers {
            worker.cancel();
        }
    }

    /// Parks the caller until every worker thread has exited. Usually
    /// preceded by [`cancel`](WorkerPool::cancel).
    pub fn wait_for_completion(&self) {
        let inner = self.inner.lock().unwrap();
        for worker in &inner.workers {
            worker.wait_for_completion();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel();
        self.wait_for_completion();
        self.inner.lock().unwrap().workers.clear();
    }
}

#[cfg(test)]
fn sleeping_job(millis: u64) -> Arc<Job> {
    Job::new(move |_job: &Arc<Job>| {
        std::thread::sleep(std::time::Duration::from_millis(millis));
    })
}

#[test]
fn worker_processes_queued_jobs() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let queue = JobQueue::new();
    let ran = Arc::new(AtomicU32::new(0));
    let worker = QueueWorker::new(Some(queue.clone()));

    for _ in 0..3 {
        let ran = Arc::clone(&ran);
        queue.add(
            Job::new(move |_job: &Arc<Job>| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) < 3 {
        assert!(std::time::Instant::now() < deadline, "jobs never drained");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    worker.cancel();
    worker.wait_for_completion();
}

#[test]
fn worker_survives_a_panicking_job() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let queue = JobQueue::new();
    let worker = QueueWorker::new(Some(queue.clone()));

    queue.add(
        Job::new(|_job: &Arc<Job>| {
            panic!("job body failure");
        }),
        true,
    );
    let ran = Arc::new(AtomicU32::new(0));
    {
        let ran = Arc::clone(&ran);
        queue.add(
            Job::new(move |_job: &Arc<Job>| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "worker died with the job");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    while worker.is_processing_job() {
        assert!(std::time::Instant::now() < deadline, "current job never cleared");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    worker.cancel();
}

#[test]
fn worker_rebinds_to_a_new_queue() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let first = JobQueue::new();
    let second = JobQueue::new();
    let mut worker = QueueWorker::new(Some(first.clone()));

    worker.set_job_queue(Some(second.clone()));
    assert!(Arc::ptr_eq(&worker.job_queue().unwrap(), &second));

    let ran = Arc::new(AtomicU32::new(0));
    {
        let ran = Arc::clone(&ran);
        second.add(
            Job::new(move |_job: &Arc<Job>| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "new queue never drained");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    worker.cancel();
}

#[test]
fn canceled_worker_can_be_rearmed() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let queue = JobQueue::new();
    let mut worker = QueueWorker::new(Some(queue.clone()));
    worker.cancel();
    assert!(!worker.is_running());
    assert!(worker.is_done());

    worker.set_done(false);
    let fresh = JobQueue::new();
    worker.set_job_queue(Some(fresh.clone()));
    assert!(worker.is_running());

    let ran = Arc::new(AtomicU32::new(0));
    {
        let ran = Arc::clone(&ran);
        fresh.add(
            Job::new(move |_job: &Arc<Job>| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "re-armed worker never ran");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    worker.cancel();
}

#[test]
fn pool_with_zero_threads_is_inert() {
    let pool = WorkerPool::new(None, 0);
    pool.job_queue().add(sleeping_job(1), true);

    assert_eq!(pool.number_of_threads(), 0);
    assert!(!pool.has_jobs_to_process());
    assert!(pool.are_all_threads_busy());
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(pool.job_queue().size(), 1);
}

#[test]
fn resizing_the_pool_is_idempotent() {
    let pool = WorkerPool::new(None, 4);
    assert_eq!(pool.number_of_threads(), 4);
    pool.set_number_of_threads(4);
    assert_eq!(pool.number_of_threads(), 4);
    pool.set_number_of_threads(2);
    assert_eq!(pool.number_of_threads(), 2);
    pool.set_number_of_threads(2);
    assert_eq!(pool.number_of_threads(), 2);
}

#[test]
fn shrinking_does_not_disturb_survivors() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let pool = WorkerPool::new(None, 3);
    pool.set_number_of_threads(1);

    let ran = Arc::new(AtomicU32::new(0));
    {
        let ran = Arc::clone(&ran);
        pool.job_queue().add(
            Job::new(move |_job: &Arc<Job>| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "survivor stopped polling");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}

#[test]
fn pool_rebinds_all_workers() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let pool = WorkerPool::new(None, 2);
    let fresh = JobQueue::new();
    pool.set_job_queue(fresh.clone());
    assert!(Arc::ptr_eq(&pool.job_queue(), &fresh));

    let ran = Arc::new(AtomicU32::new(0));
    for _ in 0..4 {
        let ran = Arc::clone(&ran);
        fresh.add(
            Job::new(move |_job: &Arc<Job>| {
                ran.fetch_add(1, Ordering::SeqCst);
            }),
            true,
        );
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while ran.load(Ordering::SeqCst) < 4 {
        assert!(std::time::Instant::now() < deadline, "rebound queue never drained");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
}
