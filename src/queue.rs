use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use crate::job::Job;
use crate::sync::Block;

/// Observer of queue membership changes.
///
/// `adding` fires just before a job lands on the queue, `added` just after,
/// `removed` after a job left it by any path except a dequeue. Hooks run
/// outside the queue lock and may be called from any thread.
pub trait QueueCallback: Send + Sync {
    fn adding(&self, _queue: &Arc<JobQueue>, _job: &Arc<Job>) {}
    fn added(&self, _queue: &Arc<JobQueue>, _job: &Arc<Job>) {}
    fn removed(&self, _queue: &Arc<JobQueue>, _job: &Arc<Job>) {}
}

struct QueueInner {
    jobs: VecDeque<Arc<Job>>,
    callback: Option<Arc<dyn QueueCallback>>,
}

/// A thread-safe FIFO of shared jobs.
///
/// Consumers pull with [`next_job`](JobQueue::next_job), optionally parking
/// on the embedded [`Block`] while the queue is empty. Any number of
/// producers and consumers can share one queue.
pub struct JobQueue {
    me: Weak<JobQueue>,
    inner: Mutex<QueueInner>,
    block: Block,
}

impl JobQueue {
    pub fn new() -> Arc<JobQueue> {
        Arc::new_cyclic(|me| JobQueue {
            me: me.clone(),
            inner: Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                callback: None,
            }),
            block: Block::new(false),
        })
    }

    fn shared(&self) -> Arc<JobQueue> {
        self.me.upgrade().unwrap()
    }

    /// Appends a job and wakes a parked consumer. With `unique` set, a job
    /// already present (by identity) is not enqueued a second time; the
    /// block is still released so consumers re-examine the queue.
    pub fn add(&self, job: Arc<Job>, unique: bool) {
        let callback = {
            let inner = self.inner.lock().unwrap();
            if unique && inner.jobs.iter().any(|queued| Arc::ptr_eq(queued, &job)) {
                drop(inner);
                self.block.set(true);
                return;
            }
            inner.callback.clone()
        };

        if let Some(callback) = &callback {
            callback.adding(&self.shared(), &job);
        }
        job.ready();
        self.inner.lock().unwrap().jobs.push_back(job.clone());
        if let Some(callback) = &callback {
            callback.added(&self.shared(), &job);
        }
        self.block.set(true);
    }

    /// Removes the first job with this name. Empty names never match.
    pub fn remove_by_name(&self, name: &str) -> Option<Arc<Job>> {
        if name.is_empty() {
            return None;
        }
        self.remove_first(|job| job.name() == name)
    }

    /// Removes the first job with this id. Empty ids never match.
    pub fn remove_by_id(&self, id: &str) -> Option<Arc<Job>> {
        if id.is_empty() {
            return None;
        }
        self.remove_first(|job| job.id() == id)
    }

    /// Removes this job, by identity.
    pub fn remove(&self, job: &Arc<Job>) {
        self.remove_first(|queued| Arc::ptr_eq(queued, job));
    }

    fn remove_first(&self, pred: impl Fn(&Arc<Job>) -> bool) -> Option<Arc<Job>> {
        let (removed, callback, empty) = {
            let mut inner = self.inner.lock().unwrap();
            let index = inner.jobs.iter().position(pred);
            let removed = index.and_then(|index| inner.jobs.remove(index));
            (removed, inner.callback.clone(), inner.jobs.is_empty())
        };
        self.block.set(!empty);
        if let (Some(callback), Some(job)) = (&callback, &removed) {
            callback.removed(&self.shared(), job);
        }
        removed
    }

    /// Drops every job that has stopped, firing `removed` for each.
    pub fn remove_stopped_jobs(&self) {
        let (removed, callback) = {
            let mut inner = self.inner.lock().unwrap();
            let mut removed = Vec::new();
            inner.jobs.retain(|job| {
                if job.is_stopped() {
                    removed.push(job.clone());
                    false
                } else {
                    true
                }
            });
            (removed, inner.callback.clone())
        };
        if let Some(callback) = &callback {
            for job in &removed {
                callback.removed(&self.shared(), job);
            }
        }
    }

    /// Empties the queue, firing `removed` for every prior member.
    pub fn clear(&self) {
        let (removed, callback) = {
            let mut inner = self.inner.lock().unwrap();
            (std::mem::take(&mut inner.jobs), inner.callback.clone())
        };
        if let Some(callback) = &callback {
            for job in &removed {
                callback.removed(&self.shared(), job);
            }
        }
    }

    /// Pops the next runnable job in FIFO order.
    ///
    /// Canceled jobs at the head are discarded on the way, each transitioned
    /// to `FINISHED` so observers see them stop. With `block_if_empty` the
    /// caller parks on the embedded block until a producer releases it;
    /// otherwise an empty queue returns `None` right away.
    pub fn next_job(&self, block_if_empty: bool) -> Option<Arc<Job>> {
        profiling::scope!("JobQueue::next_job");
        if block_if_empty && self.is_empty() {
            self.block.block();
        }

        let (result, discarded, empty) = {
            let mut inner = self.inner.lock().unwrap();
            let mut discarded = Vec::new();
            while inner
                .jobs
                .front()
                .map_or(false, |front| front.is_canceled())
            {
                discarded.push(inner.jobs.pop_front().unwrap());
            }
            let result = inner.jobs.pop_front();
            (result, discarded, inner.jobs.is_empty())
        };

        // Retire the canceled jobs outside the lock; their `finished` hooks
        // are user code.
        for job in &discarded {
            job.finished();
        }
        self.block.set(!empty);
        result
    }

    /// Force-wakes consumers parked on an empty queue. Used during shutdown
    /// and queue reassignment.
    pub fn release_block(&self) {
        self.block.release();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().jobs.is_empty()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    pub fn has_job(&self, job: &Arc<Job>) -> bool {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .any(|queued| Arc::ptr_eq(queued, job))
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn QueueCallback>>) {
        self.inner.lock().unwrap().callback = callback;
    }

    pub fn callback(&self) -> Option<Arc<dyn QueueCallback>> {
        self.inner.lock().unwrap().callback.clone()
    }
}

#[cfg(test)]
pub(crate) struct RecordingQueueCallback {
    events: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingQueueCallback {
    pub fn new() -> Arc<RecordingQueueCallback> {
        Arc::new(RecordingQueueCallback {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl QueueCallback for RecordingQueueCallback {
    fn adding(&self, _queue: &Arc<JobQueue>, job: &Arc<Job>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("adding:{}", job.name()));
    }
    fn added(&self, _queue: &Arc<JobQueue>, job: &Arc<Job>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("added:{}", job.name()));
    }
    fn removed(&self, _queue: &Arc<JobQueue>, job: &Arc<Job>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("removed:{}", job.name()));
    }
}

#[cfg(test)]
fn named_job(name: &str) -> Arc<Job> {
    Job::with_name(name, |_job: &Arc<Job>| {})
}

#[test]
fn jobs_come_out_in_fifo_order() {
    let queue = JobQueue::new();
    let a = named_job("a");
    let b = named_job("b");
    let c = named_job("c");
    queue.add(a.clone(), true);
    queue.add(b.clone(), true);
    queue.add(c.clone(), true);

    assert!(Arc::ptr_eq(&queue.next_job(false).unwrap(), &a));
    assert!(Arc::ptr_eq(&queue.next_job(false).unwrap(), &b));
    assert!(Arc::ptr_eq(&queue.next_job(false).unwrap(), &c));
    assert!(queue.next_job(false).is_none());
}

#[test]
fn unique_add_suppresses_duplicates() {
    let queue = JobQueue::new();
    let callback = RecordingQueueCallback::new();
    queue.set_callback(Some(callback.clone()));

    let job = named_job("dup");
    queue.add(job.clone(), true);
    queue.add(job.clone(), true);

    assert_eq!(queue.size(), 1);
    assert_eq!(callback.events(), vec!["adding:dup", "added:dup"]);
}

#[test]
fn non_unique_add_allows_duplicates() {
    let queue = JobQueue::new();
    let job = named_job("dup");
    queue.add(job.clone(), false);
    queue.add(job.clone(), false);
    assert_eq!(queue.size(), 2);
}

#[test]
fn adding_precedes_added() {
    let queue = JobQueue::new();
    let callback = RecordingQueueCallback::new();
    queue.set_callback(Some(callback.clone()));
    queue.add(named_job("j"), true);
    assert_eq!(callback.events(), vec!["adding:j", "added:j"]);
}

#[test]
fn remove_by_name_and_id() {
    let queue = JobQueue::new();
    let callback = RecordingQueueCallback::new();
    queue.set_callback(Some(callback.clone()));

    let a = named_job("a");
    let b = named_job("b");
    b.set_id("b-id");
    queue.add(a.clone(), true);
    queue.add(b.clone(), true);

    let removed = queue.remove_by_name("a").unwrap();
    assert!(Arc::ptr_eq(&removed, &a));
    let removed = queue.remove_by_id("b-id").unwrap();
    assert!(Arc::ptr_eq(&removed, &b));
    assert!(queue.remove_by_name("a").is_none());
    assert!(queue.remove_by_name("").is_none());
    assert!(queue.is_empty());
    assert_eq!(callback.events(), vec!["adding:a", "added:a", "adding:b", "added:b", "removed:a", "removed:b"]);
}

#[test]
fn remove_by_handle() {
    let queue = JobQueue::new();
    let a = named_job("a");
    let b = named_job("b");
    queue.add(a.clone(), true);
    queue.add(b.clone(), true);
    queue.remove(&a);
    assert!(!queue.has_job(&a));
    assert!(queue.has_job(&b));
    assert_eq!(queue.size(), 1);
}

#[test]
fn remove_stopped_jobs_only_drops_finished_ones() {
    let queue = JobQueue::new();
    let done = named_job("done");
    let pending = named_job("pending");
    queue.add(done.clone(), true);
    queue.add(pending.clone(), true);
    done.finished();

    queue.remove_stopped_jobs();
    assert!(!queue.has_job(&done));
    assert!(queue.has_job(&pending));
}

#[test]
fn clear_fires_removed_for_every_member() {
    let queue = JobQueue::new();
    let callback = RecordingQueueCallback::new();
    queue.set_callback(Some(callback.clone()));
    queue.add(named_job("a"), true);
    queue.add(named_job("b"), true);
    queue.clear();
    assert!(queue.is_empty());
    assert_eq!(
        callback.events(),
        vec!["adding:a", "added:a", "adding:b", "added:b", "removed:a", "removed:b"]
    );
}

#[test]
fn canceled_head_jobs_are_discarded_and_finished() {
    use crate::job::RecordingCallback;

    let queue = JobQueue::new();
    let a = named_job("a");
    let b = named_job("b");
    let c = named_job("c");
    let observer = RecordingCallback::new();
    a.set_callback(Some(observer.clone()));

    queue.add(a.clone(), true);
    queue.add(b.clone(), true);
    queue.add(c.clone(), true);
    a.cancel();

    let next = queue.next_job(false).unwrap();
    assert!(Arc::ptr_eq(&next, &b));
    assert!(a.is_finished());
    assert!(a.is_canceled());
    assert_eq!(
        observer.events().iter().filter(|e| *e == "finished").count(),
        1
    );
    assert_eq!(queue.size(), 1);
}

#[test]
fn blocking_next_job_wakes_on_add() {
    let queue = JobQueue::new();
    let consumer = {
        let queue = queue.clone();
        std::thread::spawn(move || queue.next_job(true))
    };
    std::thread::sleep(std::time::Duration::from_millis(50));
    queue.add(named_job("late"), true);
    let job = consumer.join().unwrap();
    assert_eq!(job.unwrap().name(), "late");
}

#[test]
fn release_block_unparks_an_empty_wait() {
    let queue = JobQueue::new();
    let consumer = {
        let queue = queue.clone();
        std::thread::spawn(move || queue.next_job(true))
    };
    std::thread::sleep(std::time::Duration::from_millis(50));
    queue.release_block();
    assert!(consumer.join().unwrap().is_none());
}

#[test]
fn requeueing_a_finished_job_fires_ready() {
    use crate::job::RecordingCallback;

    let queue = JobQueue::new();
    let job = named_job("again");
    let observer = RecordingCallback::new();
    job.set_callback(Some(observer.clone()));

    job.finished();
    queue.add(job.clone(), true);
    assert!(job.is_ready());
    assert_eq!(observer.events(), vec!["finished", "ready"]);
}
