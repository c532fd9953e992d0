use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A gate that parks calling threads until a boolean flag flips.
///
/// `block` parks the caller while the flag is false and returns as soon as it
/// is true; `release` flips the flag and wakes every parked thread at once.
/// The flag is a predicate rather than a raw signal so that a release can
/// never be lost: waiters re-check it on every wakeup.
///
/// The job queue embeds one of these to park consumers while the queue is
/// empty.
pub struct Block {
    state: Mutex<BlockState>,
    // Waiters park here until `released` becomes true.
    released_cond: Condvar,
    // Signaled whenever `wait_count` drops, so the destructor can drain.
    drained_cond: Condvar,
}

struct BlockState {
    released: bool,
    wait_count: u32,
}

impl Block {
    pub fn new(released: bool) -> Self {
        Block {
            state: Mutex::new(BlockState {
                released,
                wait_count: 0,
            }),
            released_cond: Condvar::new(),
            drained_cond: Condvar::new(),
        }
    }

    /// Parks the calling thread until the gate is released. Returns
    /// immediately if it already is.
    pub fn block(&self) {
        profiling::scope!("Block::block");
        let mut state = self.state.lock().unwrap();
        if !state.released {
            state.wait_count += 1;
            while !state.released {
                state = self.released_cond.wait(state).unwrap();
            }
            state.wait_count -= 1;
        }
        self.released_cond.notify_all();
        self.drained_cond.notify_all();
    }

    /// Like `block`, but gives up after `timeout` and returns normally.
    /// Callers that care can inspect `is_released` afterwards.
    pub fn block_timeout(&self, timeout: Duration) {
        profiling::scope!("Block::block_timeout");
        let mut state = self.state.lock().unwrap();
        if !state.released {
            state.wait_count += 1;
            let (guard, _timed_out) = self
                .released_cond
                .wait_timeout_while(state, timeout, |state| !state.released)
                .unwrap();
            state = guard;
            state.wait_count -= 1;
        }
        self.released_cond.notify_all();
        self.drained_cond.notify_all();
    }

    /// Updates the release flag and wakes all waiters so they re-check it.
    pub fn set(&self, released: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.released = released;
        }
        self.released_cond.notify_all();
    }

    /// Releases the gate: all parked threads resume and later callers pass
    /// straight through.
    pub fn release(&self) {
        self.set(true);
    }

    /// Re-arms the gate without touching parked threads. Only meaningful
    /// when no thread is currently parked.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.released = false;
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().released
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // Release everyone, then wait until the last waiter is out of the
        // wait loop. Freeing the condvar while a waiter is mid-wakeup would
        // be a use-after-free.
        self.release();
        let mut state = self.state.lock().unwrap();
        while state.wait_count > 0 {
            state = self.drained_cond.wait(state).unwrap();
        }
    }
}

/// A reusable N-party rendezvous.
///
/// Threads park in `block` until `max_count` of them have arrived; the last
/// arrival wakes the rest. `reset` releases any stragglers, waits for them
/// to drain out, and re-arms the barrier for another round.
pub struct Barrier {
    state: Mutex<BarrierState>,
    // Arrivals park here until the rendezvous count is reached.
    blocked_cond: Condvar,
    // Signaled on every departure so `reset` can observe the drain.
    drained_cond: Condvar,
}

struct BarrierState {
    max_count: u32,
    blocked_count: u32,
    wait_count: u32,
}

impl Barrier {
    /// `max_count` is the number of arrivals that completes a rendezvous
    /// and must be at least 1.
    pub fn new(max_count: u32) -> Self {
        assert!(max_count > 0, "barrier requires a positive arrival count");
        Barrier {
            state: Mutex::new(BarrierState {
                max_count,
                blocked_count: 0,
                wait_count: 0,
            }),
            blocked_cond: Condvar::new(),
            drained_cond: Condvar::new(),
        }
    }

    /// Parks the calling thread until `max_count` threads have arrived.
    pub fn block(&self) {
        profiling::scope!("Barrier::block");
        let mut state = self.state.lock().unwrap();
        state.blocked_count += 1;
        if state.blocked_count < state.max_count {
            state.wait_count += 1;
            while state.blocked_count < state.max_count {
                state = self.blocked_cond.wait(state).unwrap();
            }
            state.wait_count -= 1;
        } else {
            // Arrivals past the rendezvous pass straight through; keep the
            // count clamped so `blocked_count <= max_count` stays true.
            state.blocked_count = state.max_count;
            self.blocked_cond.notify_all();
        }
        self.drained_cond.notify_all();
    }

    /// Releases any parked threads, waits for them to leave, then re-arms
    /// the barrier for a fresh round.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        // Force the wait predicate true for every parked thread.
        state.blocked_count = state.max_count;
        if state.wait_count > 0 {
            self.blocked_cond.notify_all();
            while state.wait_count > 0 {
                state = self.drained_cond.wait(state).unwrap();
            }
        }
        state.blocked_count = 0;
    }

    /// Like `reset`, but re-arms the barrier with a new rendezvous count.
    ///
    /// One critical section: while the drain is in progress the forced
    /// predicate keeps new arrivals passing through, and the counts are only
    /// zeroed once the new capacity is in place, so no arrival can park
    /// against a half-updated barrier.
    pub fn reset_to(&self, max_count: u32) {
        assert!(max_count > 0, "barrier requires a positive arrival count");
        let mut state = self.state.lock().unwrap();
        state.blocked_count = state.max_count;
        if state.wait_count > 0 {
            self.blocked_cond.notify_all();
            while state.wait_count > 0 {
                state = self.drained_cond.wait(state).unwrap();
            }
        }
        state.max_count = max_count;
        state.blocked_count = 0;
    }

    pub fn max_count(&self) -> u32 {
        self.state.lock().unwrap().max_count
    }

    pub fn blocked_count(&self) -> u32 {
        self.state.lock().unwrap().blocked_count
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        self.reset();
    }
}

#[test]
fn block_release_wakes_waiters() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let block = Arc::new(Block::new(false));
    let woken = Arc::new(AtomicU32::new(0));

    let mut threads = Vec::new();
    for _ in 0..3 {
        let block = Arc::clone(&block);
        let woken = Arc::clone(&woken);
        threads.push(std::thread::spawn(move || {
            block.block();
            woken.fetch_add(1, Ordering::SeqCst);
        }));
    }

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(woken.load(Ordering::SeqCst), 0);

    block.release();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 3);
}

#[test]
fn block_after_release_does_not_park() {
    let block = Block::new(false);
    block.release();
    // Must return immediately.
    block.block();
    assert!(block.is_released());
}

#[test]
fn block_timeout_expires() {
    let block = Block::new(false);
    let start = std::time::Instant::now();
    block.block_timeout(Duration::from_millis(50));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(!block.is_released());
}

#[test]
fn block_reset_rearms() {
    let block = Block::new(false);
    block.release();
    block.block();
    block.reset();
    assert!(!block.is_released());
    let start = std::time::Instant::now();
    block.block_timeout(Duration::from_millis(50));
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn barrier_rendezvous() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    let barrier = Arc::new(Barrier::new(4));
    let arrived = Arc::new(AtomicU32::new(0));

    let mut threads = Vec::new();
    for _ in 0..3 {
        let barrier = Arc::clone(&barrier);
        let arrived = Arc::clone(&arrived);
        threads.push(std::thread::spawn(move || {
            barrier.block();
            arrived.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while barrier.blocked_count() < 3 {
        assert!(std::time::Instant::now() < deadline);
        std::thread::yield_now();
    }
    assert_eq!(arrived.load(Ordering::SeqCst), 0);

    // The fourth arrival releases everyone.
    barrier.block();
    for thread in threads {
        thread.join().unwrap();
    }
    assert_eq!(arrived.load(Ordering::SeqCst), 3);
}

#[test]
fn barrier_of_one_passes_through() {
    let barrier = Barrier::new(1);
    barrier.block();
    barrier.block();
    // Repeated pass-throughs never push the count past the target.
    assert_eq!(barrier.blocked_count(), 1);
}

#[test]
fn barrier_reset_releases_and_rearms() {
    use std::sync::Arc;

    let barrier = Arc::new(Barrier::new(3));

    let waiter = {
        let barrier = Arc::clone(&barrier);
        std::thread::spawn(move || barrier.block())
    };
    std::thread::sleep(Duration::from_millis(50));
    barrier.reset();
    waiter.join().unwrap();
    assert_eq!(barrier.blocked_count(), 0);

    // A full round still works after the reset.
    let mut threads = Vec::new();
    for _ in 0..2 {
        let barrier = Arc::clone(&barrier);
        threads.push(std::thread::spawn(move || barrier.block()));
    }
    std::thread::sleep(Duration::from_millis(20));
    barrier.block();
    for thread in threads {
        thread.join().unwrap();
    }
}

#[test]
fn barrier_reset_to_changes_capacity() {
    let barrier = Barrier::new(2);
    barrier.reset_to(1);
    assert_eq!(barrier.max_count(), 1);
    // Capacity one means no parking at all.
    barrier.block();
}

#[test]
#[should_panic]
fn barrier_rejects_zero_capacity() {
    let _ = Barrier::new(0);
}
