use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::sync::Barrier;

/// Signal returned by [`WorkerControl::checkpoint`] once the worker has been
/// canceled. Bodies propagate it with `?`; the thread wrapper traps it, so
/// it never escapes to callers of the public API.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Interrupted;

/// The body a worker thread executes.
///
/// Cancellation is cooperative: the body is expected to call
/// [`WorkerControl::checkpoint`] wherever it can be safely interrupted and
/// forward the result with `?`. A body that never checkpoints can only be
/// stopped by running to completion.
pub trait Work: Send + Sync + 'static {
    fn run(&self, ctrl: &WorkerControl) -> Result<(), Interrupted>;
}

impl<F> Work for F
where
    F: Fn(&WorkerControl) -> Result<(), Interrupted> + Send + Sync + 'static,
{
    fn run(&self, ctrl: &WorkerControl) -> Result<(), Interrupted> {
        self(ctrl)
    }
}

/// Shared control state of one worker thread: the interrupt flag, the pause
/// barrier and the completion condition.
///
/// The pause barrier has capacity 1 while the worker runs freely, so
/// checkpoints pass straight through it. `pause` widens it to 2, which makes
/// the next checkpoint park until `resume` narrows it back.
pub struct WorkerControl {
    interrupt: AtomicBool,
    running: Mutex<bool>,
    completion_cond: Condvar,
    pause_barrier: Barrier,
}

impl WorkerControl {
    fn new() -> Self {
        WorkerControl {
            interrupt: AtomicBool::new(false),
            running: Mutex::new(false),
            completion_cond: Condvar::new(),
            pause_barrier: Barrier::new(1),
        }
    }

    /// Cancellation and pause point. Returns `Err(Interrupted)` when the
    /// worker has been canceled; otherwise parks while the worker is paused
    /// and then returns `Ok`.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            return Err(Interrupted);
        }
        self.pause_barrier.block();
        Ok(())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Sets or clears the interrupt flag. Setting it also resumes a paused
    /// worker so the cancellation can be observed at the pause point itself.
    pub fn set_cancel(&self, flag: bool) {
        self.interrupt.store(flag, Ordering::Relaxed);
        if flag {
            self.resume();
        }
    }

    /// Requests cooperative cancellation. The worker exits at its next
    /// checkpoint.
    pub fn cancel(&self) {
        self.set_cancel(true);
    }

    /// Makes the next checkpoint park until `resume` is called.
    pub fn pause(&self) {
        self.pause_barrier.reset_to(2);
    }

    /// Releases a paused worker; subsequent checkpoints pass through.
    pub fn resume(&self) {
        self.pause_barrier.reset_to(1);
    }

    /// True while a pause is requested and the worker is parked at a
    /// checkpoint.
    pub fn is_paused(&self) -> bool {
        self.pause_barrier.max_count() == 2 && self.pause_barrier.blocked_count() > 0
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    /// Parks the caller until the worker's body has returned.
    pub fn wait_for_completion(&self) {
        let mut running = self.running.lock().unwrap();
        while *running {
            running = self.completion_cond.wait(running).unwrap();
        }
    }

    fn set_running(&self, value: bool) {
        let mut running = self.running.lock().unwrap();
        *running = value;
        if !value {
            self.completion_cond.notify_all();
        }
    }
}

/// An interruptible, pausable OS thread around a [`Work`] body.
///
/// The thread is not spawned until [`start`](WorkerThread::start) is called,
/// and the same instance can be started again after a run completes. Dropping
/// the handle joins the thread; it does not cancel it.
pub struct WorkerThread {
    work: Arc<dyn Work>,
    control: Arc<WorkerControl>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn new(work: Arc<dyn Work>) -> Self {
        WorkerThread {
            work,
            control: Arc::new(WorkerControl::new()),
            handle: None,
        }
    }

    /// Spawns the thread. No-op while the thread is running or while the
    /// interrupt flag is still set from an earlier `cancel`.
    pub fn start(&mut self) {
        if self.control.is_interrupted() || self.control.is_running() {
            return;
        }
        self.control.set_running(true);

        // A previous round may have finished without being joined yet; join
        // it before handing the slot to a fresh thread.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }

        let work = Arc::clone(&self.work);
        let control = Arc::clone(&self.control);
        self.handle = Some(std::thread::spawn(move || {
            run_internal(&*work, &control);
        }));
    }

    pub fn control(&self) -> &Arc<WorkerControl> {
        &self.control
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn wait_for_completion(&self) {
        self.control.wait_for_completion();
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        // `take` makes a double join impossible.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_internal(work: &dyn Work, control: &WorkerControl) {
    profiling::register_thread!("atelier worker");

    // Clears the running flag and wakes completion waiters no matter how the
    // body exits, a panicking body included.
    struct CompletionGuard<'a>(&'a WorkerControl);
    impl Drop for CompletionGuard<'_> {
        fn drop(&mut self) {
            self.0.set_running(false);
        }
    }
    let _guard = CompletionGuard(control);

    if !control.is_interrupted() {
        // Err(Interrupted) is the cooperative cancellation exit; it stops
        // here and nowhere else.
        let _ = work.run(control);
    }
}

#[cfg(test)]
fn counting_work(counter: std::sync::Arc<std::sync::atomic::AtomicU32>) -> Arc<dyn Work> {
    Arc::new(move |_ctrl: &WorkerControl| -> Result<(), Interrupted> {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn worker_runs_to_completion() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let counter = Arc::new(AtomicU32::new(0));
    let mut worker = WorkerThread::new(counting_work(Arc::clone(&counter)));
    worker.start();
    worker.wait_for_completion();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(!worker.is_running());
}

#[test]
fn worker_restarts_after_completion() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let counter = Arc::new(AtomicU32::new(0));
    let mut worker = WorkerThread::new(counting_work(Arc::clone(&counter)));
    worker.start();
    worker.wait_for_completion();
    worker.start();
    worker.wait_for_completion();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[test]
fn start_is_a_no_op_while_running() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::sync::Block;

    let gate = Arc::new(Block::new(false));
    let entered = Arc::new(AtomicU32::new(0));

    let work = {
        let gate = Arc::clone(&gate);
        let entered = Arc::clone(&entered);
        Arc::new(move |_ctrl: &WorkerControl| -> Result<(), Interrupted> {
            entered.fetch_add(1, Ordering::SeqCst);
            gate.block();
            Ok(())
        }) as Arc<dyn Work>
    };

    let mut worker = WorkerThread::new(work);
    worker.start();
    worker.start();
    worker.start();
    gate.release();
    worker.wait_for_completion();
    assert_eq!(entered.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_before_start_blocks_start() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let counter = Arc::new(AtomicU32::new(0));
    let mut worker = WorkerThread::new(counting_work(Arc::clone(&counter)));
    worker.cancel();
    worker.start();
    assert!(!worker.is_running());
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Clearing the flag makes the worker startable again.
    worker.control().set_cancel(false);
    worker.start();
    worker.wait_for_completion();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_interrupts_at_checkpoint() {
    use std::sync::atomic::{AtomicU32, Ordering};

    let laps = Arc::new(AtomicU32::new(0));
    let work = {
        let laps = Arc::clone(&laps);
        Arc::new(move |ctrl: &WorkerControl| -> Result<(), Interrupted> {
            loop {
                ctrl.checkpoint()?;
                laps.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }) as Arc<dyn Work>
    };

    let mut worker = WorkerThread::new(work);
    worker.start();
    while laps.load(Ordering::SeqCst) < 3 {
        std::thread::yield_now();
    }
    worker.cancel();
    worker.wait_for_completion();
    assert!(worker.control().is_interrupted());
}

#[test]
fn pause_parks_the_worker_at_its_checkpoint() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    let laps = Arc::new(AtomicU32::new(0));
    let work = {
        let laps = Arc::clone(&laps);
        Arc::new(move |ctrl: &WorkerControl| -> Result<(), Interrupted> {
            loop {
                ctrl.checkpoint()?;
                laps.fetch_add(1, Ordering::SeqCst);
            }
        }) as Arc<dyn Work>
    };

    let mut worker = WorkerThread::new(work);
    worker.start();
    while laps.load(Ordering::SeqCst) == 0 {
        std::thread::yield_now();
    }

    worker.pause();
    while !worker.is_paused() {
        std::thread::yield_now();
    }
    let parked_at = laps.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(laps.load(Ordering::SeqCst), parked_at);

    worker.resume();
    while laps.load(Ordering::SeqCst) == parked_at {
        std::thread::yield_now();
    }

    worker.cancel();
    worker.wait_for_completion();
}

#[test]
fn panicking_body_still_clears_running() {
    let work = Arc::new(|_ctrl: &WorkerControl| -> Result<(), Interrupted> {
        panic!("body failure");
    }) as Arc<dyn Work>;

    let mut worker = WorkerThread::new(work);
    worker.start();
    worker.wait_for_completion();
    assert!(!worker.is_running());
}
