//! A small job execution substrate: package units of work as jobs, queue
//! them, and dispatch them across a fixed pool of worker threads.
//!
//! The design goals:
//! - Jobs are shared objects with an observable lifecycle (ready, started,
//!   canceled, finished) that callbacks can hook into.
//! - Workers are plain long-running OS threads polling one shared FIFO
//!   queue. No scheduler, no event loop, no work stealing.
//! - Cancellation is cooperative. Workers poll checkpoints between jobs and
//!   job bodies poll their own cancel flag; nothing is ever preempted.
//! - Blocking is predicate-based. The queue parks idle consumers on a
//!   [`Block`] and the reusable [`Barrier`] doubles as the pause mechanism
//!   of a worker, so a wakeup can never be lost to a race.
//! - User callbacks never run while a library lock is held.
//!
//! The pieces compose bottom-up: [`Block`] and [`Barrier`] are the bare
//! synchronization primitives, [`WorkerThread`] is an interruptible thread
//! around a [`Work`] body, [`Job`] and [`JobQueue`] carry the work, and
//! [`QueueWorker`] plus [`WorkerPool`] bind workers to a shared queue.
//!
//! ```
//! use atelier::{Job, WorkerPool};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! let pool = WorkerPool::new(None, 2);
//! let done = Arc::new(AtomicU32::new(0));
//! for _ in 0..4 {
//!     let done = Arc::clone(&done);
//!     pool.job_queue().add(
//!         Job::new(move |_job: &Arc<Job>| {
//!             done.fetch_add(1, Ordering::SeqCst);
//!         }),
//!         true,
//!     );
//! }
//! while pool.has_jobs_to_process() {
//!     std::thread::yield_now();
//! }
//! ```

mod job;
mod pool;
mod queue;
mod sync;
mod worker;

pub use job::{Job, JobCallback, JobState, JobTask};
pub use pool::{QueueWorker, WorkerPool};
pub use queue::{JobQueue, QueueCallback};
pub use sync::{Barrier, Block};
pub use worker::{Interrupted, Work, WorkerControl, WorkerThread};

#[cfg(test)]
mod scenarios {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    struct CountingCallback {
        started: AtomicU32,
        finished: AtomicU32,
        canceled: AtomicU32,
    }

    impl CountingCallback {
        fn new() -> Arc<CountingCallback> {
            Arc::new(CountingCallback {
                started: AtomicU32::new(0),
                finished: AtomicU32::new(0),
                canceled: AtomicU32::new(0),
            })
        }
    }

    impl JobCallback for CountingCallback {
        fn started(&self, _job: &Arc<Job>) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn finished(&self, _job: &Arc<Job>) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        fn canceled(&self, _job: &Arc<Job>) {
            self.canceled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < deadline, "condition never became true");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn rendezvous_body(
        start: Arc<Barrier>,
        finished: Arc<Barrier>,
        laps: Arc<AtomicU32>,
    ) -> Arc<dyn Work> {
        Arc::new(move |ctrl: &WorkerControl| -> Result<(), Interrupted> {
            start.block();
            for _ in 0..10 {
                std::thread::sleep(Duration::from_millis(10));
                ctrl.checkpoint()?;
            }
            laps.fetch_add(1, Ordering::SeqCst);
            finished.block();
            Ok(())
        })
    }

    // Two workers rendezvous on a start barrier, run, then meet main on a
    // finished barrier; after a reset the same threads and barriers run an
    // identical second round.
    #[test]
    fn barrier_rendezvous_and_reuse() {
        let start = Arc::new(Barrier::new(2));
        let finished = Arc::new(Barrier::new(3));
        let laps = Arc::new(AtomicU32::new(0));

        let mut workers: Vec<WorkerThread> = (0..2)
            .map(|_| {
                WorkerThread::new(rendezvous_body(
                    Arc::clone(&start),
                    Arc::clone(&finished),
                    Arc::clone(&laps),
                ))
            })
            .collect();

        for worker in &mut workers {
            worker.start();
        }
        finished.block();
        assert_eq!(laps.load(Ordering::SeqCst), 2);

        for worker in &workers {
            worker.wait_for_completion();
        }
        finished.reset();
        start.reset();

        for worker in &mut workers {
            worker.start();
        }
        finished.block();
        assert_eq!(laps.load(Ordering::SeqCst), 4);

        for worker in &workers {
            worker.wait_for_completion();
        }
    }

    // A pool of five drains ten sleeping jobs in two batches; every job
    // reports started and finished exactly once.
    #[test]
    fn pool_drains_queued_jobs() {
        let pool = WorkerPool::new(None, 5);
        let callback = CountingCallback::new();

        for _ in 0..10 {
            let job = Job::new(|_job: &Arc<Job>| {
                std::thread::sleep(Duration::from_millis(100));
            });
            job.set_callback(Some(callback.clone()));
            pool.job_queue().add(job, true);
        }

        wait_until(Duration::from_secs(10), || {
            callback.finished.load(Ordering::SeqCst) == 10
        });
        wait_until(Duration::from_secs(10), || !pool.has_jobs_to_process());

        assert_eq!(callback.started.load(Ordering::SeqCst), 10);
        assert_eq!(callback.finished.load(Ordering::SeqCst), 10);
        assert_eq!(callback.canceled.load(Ordering::SeqCst), 0);
    }

    // Canceling the pool while a job runs: the body finishes its current
    // chunk, notices the cancel flag, and the workers wind down promptly.
    #[test]
    fn cancellation_while_processing() {
        let pool = WorkerPool::new(None, 2);
        let callback = CountingCallback::new();

        let job = Job::new(|job: &Arc<Job>| {
            for _ in 0..200 {
                if job.is_canceled() {
                    return;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        });
        job.set_callback(Some(callback.clone()));
        pool.job_queue().add(job.clone(), true);

        wait_until(Duration::from_secs(5), || {
            callback.started.load(Ordering::SeqCst) == 1
        });
        std::thread::sleep(Duration::from_millis(50));

        let shutdown_started = Instant::now();
        pool.cancel();
        pool.wait_for_completion();

        // Far below the two seconds the body would need to run its course.
        assert!(shutdown_started.elapsed() < Duration::from_secs(1));
        assert!(job.is_canceled());
        assert!(!job.is_finished());
        assert_eq!(callback.finished.load(Ordering::SeqCst), 0);
    }

    // A job canceled while still queued is discarded by the dequeue: the
    // next survivor comes out, and the canceled job retires with a single
    // finished notification.
    #[test]
    fn canceled_job_is_discarded_at_the_head() {
        let queue = JobQueue::new();
        let callback = CountingCallback::new();

        let doomed = Job::new(|_job: &Arc<Job>| {});
        let survivor = Job::new(|_job: &Arc<Job>| {});
        doomed.set_callback(Some(callback.clone()));
        queue.add(doomed.clone(), true);
        queue.add(survivor.clone(), true);
        doomed.cancel();

        let pool = WorkerPool::new(Some(queue.clone()), 1);
        wait_until(Duration::from_secs(5), || doomed.is_finished());
        wait_until(Duration::from_secs(5), || survivor.is_finished());

        assert_eq!(callback.finished.load(Ordering::SeqCst), 1);
        assert_eq!(callback.started.load(Ordering::SeqCst), 0);
        drop(pool);
    }

    // Workers pick up jobs added long after the pool went idle; the queue
    // block parks them in between without busy-waiting.
    #[test]
    fn idle_pool_wakes_for_late_jobs() {
        let pool = WorkerPool::new(None, 2);
        let callback = CountingCallback::new();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.number_of_busy_threads(), 0);

        let job = Job::new(|_job: &Arc<Job>| {});
        job.set_callback(Some(callback.clone()));
        pool.job_queue().add(job, true);

        wait_until(Duration::from_secs(5), || {
            callback.finished.load(Ordering::SeqCst) == 1
        });
    }
}
