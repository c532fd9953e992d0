use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;

bitflags! {
    /// Lifecycle bit vector of a job.
    ///
    /// `READY`, `RUNNING` and `FINISHED` are mutually exclusive at rest;
    /// `CANCEL` can ride along with any of them. A canceled job that is
    /// still executing is `CANCEL | RUNNING`, and once retired by the queue
    /// it rests at `CANCEL | FINISHED`.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct JobState: u8 {
        const READY    = 1 << 0;
        const RUNNING  = 1 << 1;
        const CANCEL   = 1 << 2;
        const FINISHED = 1 << 3;
    }
}

/// The user-provided body of a job.
pub trait JobTask: Send + Sync + 'static {
    /// The work itself. Long bodies should poll `job.is_canceled()` and
    /// return early when it turns true; nothing preempts them otherwise.
    fn run(&self, job: &Arc<Job>);

    /// Hook invoked when a shutting-down worker is still holding this job,
    /// so bodies blocked on their own gates can be let go.
    fn release(&self) {}
}

impl<F> JobTask for F
where
    F: Fn(&Arc<Job>) + Send + Sync + 'static,
{
    fn run(&self, job: &Arc<Job>) {
        self(job)
    }
}

/// Observer of a job's lifecycle.
///
/// Callbacks form a forward chain: every default method hands the event to
/// [`next`](JobCallback::next), so an implementation can override a hook,
/// act, and still call the default to keep the chain going. Chains must not
/// form a cycle.
///
/// Hooks are called from whichever thread triggered the transition, never
/// while a library mutex is held. They must not block indefinitely.
pub trait JobCallback: Send + Sync {
    /// The next link of the chain, if any.
    fn next(&self) -> Option<Arc<dyn JobCallback>> {
        None
    }

    fn ready(&self, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.ready(job);
        }
    }

    fn started(&self, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.started(job);
        }
    }

    fn finished(&self, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.finished(job);
        }
    }

    fn canceled(&self, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.canceled(job);
        }
    }

    fn name_changed(&self, name: &str, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.name_changed(name, job);
        }
    }

    fn id_changed(&self, id: &str, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.id_changed(id, job);
        }
    }

    fn description_changed(&self, description: &str, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.description_changed(description, job);
        }
    }

    fn percent_complete_changed(&self, percent: f64, job: &Arc<Job>) {
        if let Some(next) = self.next() {
            next.percent_complete_changed(percent, job);
        }
    }
}

struct JobData {
    state: JobState,
    name: String,
    id: String,
    description: String,
    priority: f64,
    callback: Option<Arc<dyn JobCallback>>,
}

/// A unit of user-defined work plus its lifecycle state and metadata.
///
/// Jobs are shared: the queue, the worker processing the job and any number
/// of producers can hold the same `Arc<Job>`. All mutators take `&self` and
/// synchronize internally; callback dispatch always happens after the
/// internal lock has been dropped.
pub struct Job {
    me: Weak<Job>,
    data: Mutex<JobData>,
    task: Box<dyn JobTask>,
}

impl Job {
    /// Creates a job in the `READY` state.
    pub fn new<T: JobTask>(task: T) -> Arc<Job> {
        Self::build(String::new(), task)
    }

    /// Creates a named job. The name is set before the job is shared, so no
    /// `name_changed` notification fires.
    pub fn with_name<T: JobTask>(name: &str, task: T) -> Arc<Job> {
        Self::build(name.to_string(), task)
    }

    fn build<T: JobTask>(name: String, task: T) -> Arc<Job> {
        Arc::new_cyclic(|me| Job {
            me: me.clone(),
            data: Mutex::new(JobData {
                state: JobState::READY,
                name,
                id: String::new(),
                description: String::new(),
                priority: 0.0,
                callback: None,
            }),
            task: Box::new(task),
        })
    }

    // The `Arc` every callback receives. Infallible while any strong handle
    // exists, and all paths leading here come through one.
    fn shared(&self) -> Arc<Job> {
        self.me.upgrade().unwrap()
    }

    /// Runs the job on the calling thread: `RUNNING`, then the body, then
    /// `FINISHED` unless the job was canceled while it ran. A canceled body
    /// leaves the job without the `FINISHED` bit and no `finished`
    /// notification is delivered.
    pub fn start(&self) {
        profiling::scope!("Job::start");
        self.running();
        let job = self.shared();
        self.task.run(&job);
        if !self.is_canceled() {
            self.finished();
        }
    }

    /// Sets (`on == true`) or clears bits of the state. If the state
    /// changed, one notification fires per rising bit, in the order
    /// `READY`, `RUNNING`, `CANCEL`, `FINISHED`.
    pub fn set_state(&self, value: JobState, on: bool) {
        let old_state;
        let new_state;
        let callback;
        {
            let mut data = self.data.lock().unwrap();
            let next = if on {
                data.state | value
            } else {
                data.state - value
            };
            if next == data.state {
                return;
            }
            old_state = data.state;
            new_state = next;
            data.state = next;
            callback = data.callback.clone();
        }

        if let Some(callback) = callback {
            let job = self.shared();
            let rising = new_state - old_state;
            if rising.contains(JobState::READY) {
                callback.ready(&job);
            }
            if rising.contains(JobState::RUNNING) {
                callback.started(&job);
            }
            if rising.contains(JobState::CANCEL) {
                callback.canceled(&job);
            }
            if rising.contains(JobState::FINISHED) {
                callback.finished(&job);
            }
        }
    }

    /// Clears the state and re-derives it as `value`, firing the rising-edge
    /// notifications of the new value. Re-asserting the current state is a
    /// no-op and does not re-notify.
    pub fn reset_state(&self, value: JobState) {
        {
            let mut data = self.data.lock().unwrap();
            if value == data.state {
                return;
            }
            data.state = JobState::empty();
        }
        self.set_state(value, true);
    }

    /// Marks the job canceled. Sticky until the next state reset; the body
    /// must poll `is_canceled` for the cancellation to take effect.
    pub fn cancel(&self) {
        self.set_state(JobState::CANCEL, true);
    }

    pub fn ready(&self) {
        self.reset_state(JobState::READY);
    }

    pub fn running(&self) {
        self.reset_state(JobState::RUNNING);
    }

    /// Retires the job, preserving a `CANCEL` bit so a canceled job rests at
    /// `CANCEL | FINISHED`.
    pub fn finished(&self) {
        let new_state = {
            let data = self.data.lock().unwrap();
            (data.state & JobState::CANCEL) | JobState::FINISHED
        };
        self.reset_state(new_state);
    }

    pub fn state(&self) -> JobState {
        self.data.lock().unwrap().state
    }

    pub fn is_ready(&self) -> bool {
        self.state().contains(JobState::READY)
    }

    pub fn is_running(&self) -> bool {
        self.state().contains(JobState::RUNNING)
    }

    pub fn is_canceled(&self) -> bool {
        self.state().contains(JobState::CANCEL)
    }

    pub fn is_finished(&self) -> bool {
        self.state().contains(JobState::FINISHED)
    }

    /// True once the job has stopped for good.
    pub fn is_stopped(&self) -> bool {
        self.state().contains(JobState::FINISHED)
    }

    /// Forwards to the task's `release` hook.
    pub fn release(&self) {
        self.task.release();
    }

    pub fn set_name(&self, value: &str) {
        let callback = {
            let mut data = self.data.lock().unwrap();
            if data.name == value {
                return;
            }
            data.name = value.to_string();
            data.callback.clone()
        };
        if let Some(callback) = callback {
            callback.name_changed(value, &self.shared());
        }
    }

    pub fn name(&self) -> String {
        self.data.lock().unwrap().name.clone()
    }

    pub fn set_id(&self, value: &str) {
        let callback = {
            let mut data = self.data.lock().unwrap();
            if data.id == value {
                return;
            }
            data.id = value.to_string();
            data.callback.clone()
        };
        if let Some(callback) = callback {
            callback.id_changed(value, &self.shared());
        }
    }

    pub fn id(&self) -> String {
        self.data.lock().unwrap().id.clone()
    }

    pub fn set_description(&self, value: &str) {
        let callback = {
            let mut data = self.data.lock().unwrap();
            if data.description == value {
                return;
            }
            data.description = value.to_string();
            data.callback.clone()
        };
        if let Some(callback) = callback {
            callback.description_changed(value, &self.shared());
        }
    }

    pub fn description(&self) -> String {
        self.data.lock().unwrap().description.clone()
    }

    /// Advisory only; nothing in the queue orders by it.
    pub fn set_priority(&self, value: f64) {
        self.data.lock().unwrap().priority = value;
    }

    pub fn priority(&self) -> f64 {
        self.data.lock().unwrap().priority
    }

    /// Progress report. Unlike the metadata setters this notifies on every
    /// call; the callback is snapshotted first so user code never runs under
    /// the job lock.
    pub fn set_percent_complete(&self, value: f64) {
        let callback = self.data.lock().unwrap().callback.clone();
        if let Some(callback) = callback {
            callback.percent_complete_changed(value, &self.shared());
        }
    }

    pub fn set_callback(&self, callback: Option<Arc<dyn JobCallback>>) {
        self.data.lock().unwrap().callback = callback;
    }

    pub fn callback(&self) -> Option<Arc<dyn JobCallback>> {
        self.data.lock().unwrap().callback.clone()
    }
}

#[cfg(test)]
pub(crate) struct RecordingCallback {
    pub events: Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingCallback {
    pub fn new() -> Arc<RecordingCallback> {
        Arc::new(RecordingCallback {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

#[cfg(test)]
impl JobCallback for RecordingCallback {
    fn ready(&self, _job: &Arc<Job>) {
        self.push("ready");
    }
    fn started(&self, _job: &Arc<Job>) {
        self.push("started");
    }
    fn finished(&self, _job: &Arc<Job>) {
        self.push("finished");
    }
    fn canceled(&self, _job: &Arc<Job>) {
        self.push("canceled");
    }
    fn name_changed(&self, name: &str, _job: &Arc<Job>) {
        self.push(&format!("name:{name}"));
    }
    fn id_changed(&self, id: &str, _job: &Arc<Job>) {
        self.push(&format!("id:{id}"));
    }
    fn description_changed(&self, description: &str, _job: &Arc<Job>) {
        self.push(&format!("description:{description}"));
    }
    fn percent_complete_changed(&self, percent: f64, _job: &Arc<Job>) {
        self.push(&format!("percent:{percent}"));
    }
}

#[cfg(test)]
fn noop_job() -> Arc<Job> {
    Job::new(|_job: &Arc<Job>| {})
}

#[test]
fn jobs_are_created_ready() {
    let job = noop_job();
    assert_eq!(job.state(), JobState::READY);
    assert!(job.is_ready());
    assert!(!job.is_running());
    assert!(!job.is_finished());
}

#[test]
fn start_fires_started_then_finished() {
    let job = noop_job();
    let callback = RecordingCallback::new();
    job.set_callback(Some(callback.clone()));
    job.start();
    assert_eq!(callback.events(), vec!["started", "finished"]);
    assert_eq!(job.state(), JobState::FINISHED);
}

#[test]
fn cancel_during_body_skips_finished() {
    let job = Job::new(|job: &Arc<Job>| {
        job.cancel();
    });
    let callback = RecordingCallback::new();
    job.set_callback(Some(callback.clone()));
    job.start();
    assert_eq!(callback.events(), vec!["started", "canceled"]);
    assert!(job.is_canceled());
    assert!(!job.is_finished());
}

#[test]
fn finishing_a_canceled_job_keeps_the_cancel_bit() {
    let job = noop_job();
    let callback = RecordingCallback::new();
    job.set_callback(Some(callback.clone()));
    job.cancel();
    job.finished();
    assert_eq!(job.state(), JobState::CANCEL | JobState::FINISHED);
    // The second `canceled` is the cancel bit rising again out of the state
    // reset; `finished` is delivered exactly once.
    assert_eq!(callback.events(), vec!["canceled", "canceled", "finished"]);
}

#[test]
fn reset_to_current_state_does_not_renotify() {
    let job = noop_job();
    let callback = RecordingCallback::new();
    job.set_callback(Some(callback.clone()));
    job.ready();
    assert!(callback.events().is_empty());
}

#[test]
fn set_state_only_fires_rising_edges() {
    let job = noop_job();
    let callback = RecordingCallback::new();
    job.set_callback(Some(callback.clone()));
    job.set_state(JobState::READY, true);
    assert!(callback.events().is_empty());
    job.set_state(JobState::READY, false);
    assert!(callback.events().is_empty());
    job.set_state(JobState::RUNNING, true);
    assert_eq!(callback.events(), vec!["started"]);
}

#[test]
fn metadata_setters_fire_only_on_change() {
    let job = noop_job();
    let callback = RecordingCallback::new();
    job.set_callback(Some(callback.clone()));

    job.set_name("tile 4/9");
    job.set_name("tile 4/9");
    job.set_id("0042");
    job.set_description("north-west quadrant");
    job.set_description("north-west quadrant");

    assert_eq!(
        callback.events(),
        vec!["name:tile 4/9", "id:0042", "description:north-west quadrant"]
    );
    assert_eq!(job.name(), "tile 4/9");
    assert_eq!(job.id(), "0042");
    assert_eq!(job.description(), "north-west quadrant");
}

#[test]
fn percent_complete_fires_every_call() {
    let job = noop_job();
    let callback = RecordingCallback::new();
    job.set_callback(Some(callback.clone()));
    job.set_percent_complete(50.0);
    job.set_percent_complete(50.0);
    assert_eq!(callback.events(), vec!["percent:50", "percent:50"]);
}

#[test]
fn callback_chain_forwards_to_next_link() {
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FrontLink {
        next: Arc<dyn JobCallback>,
        seen: AtomicU32,
    }
    impl JobCallback for FrontLink {
        fn next(&self) -> Option<Arc<dyn JobCallback>> {
            Some(self.next.clone())
        }
        fn started(&self, job: &Arc<Job>) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if let Some(next) = self.next() {
                next.started(job);
            }
        }
    }

    let tail = RecordingCallback::new();
    let front = Arc::new(FrontLink {
        next: tail.clone(),
        seen: AtomicU32::new(0),
    });

    let job = noop_job();
    job.set_callback(Some(front.clone()));
    job.start();

    // `started` was handled by the front link and forwarded; `finished` fell
    // through the default method straight to the tail.
    assert_eq!(front.seen.load(Ordering::SeqCst), 1);
    assert_eq!(tail.events(), vec!["started", "finished"]);
}

#[test]
fn priority_is_carried_but_inert() {
    let job = noop_job();
    job.set_priority(7.5);
    assert_eq!(job.priority(), 7.5);
    assert_eq!(job.state(), JobState::READY);
}
