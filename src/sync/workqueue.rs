//! Deferred work execution.
//!
//! A [`WorkQueue`] owns a fixed set of worker threads. One-shot jobs are submitted with
//! [`WorkQueue::queue`]; re-armable items are [`DelayedWork`] handles bound to one queue.
//! An ordered queue (one worker) executes items strictly in due-time order, ties broken by
//! submission order.
//!
//! A delayed item is never executed concurrently with itself, but it may requeue itself
//! while it runs.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error};

type WorkFn = Arc<dyn Fn() + Send + Sync>;
type JobFn = Box<dyn FnOnce() + Send>;

struct DelayedSlot {
    func: WorkFn,
    /// Due time and submission sequence of the pending instance.
    due: Option<(Instant, u64)>,
    running: bool,
    canceling: bool,
    started: u64,
    completed: u64,
}

struct OneShot {
    queued_at: Instant,
    seq: u64,
    job: JobFn,
}

#[derive(Default)]
struct QueueState {
    oneshots: VecDeque<OneShot>,
    slots: HashMap<u64, DelayedSlot>,
    next_id: u64,
    next_seq: u64,
    active_oneshots: usize,
    shutdown: bool,
}

enum Next {
    OneShot(JobFn),
    Delayed(u64, WorkFn),
    WaitUntil(Instant),
    Idle,
}

impl QueueState {
    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn next_runnable(&mut self, now: Instant) -> Next {
        let oneshot_key = self.oneshots.front().map(|o| (o.queued_at, o.seq));

        let mut best: Option<(u64, (Instant, u64))> = None;
        for (&id, slot) in &self.slots {
            if slot.running {
                continue;
            }
            if let Some(due) = slot.due {
                if best.is_none_or(|(_, b)| due < b) {
                    best = Some((id, due));
                }
            }
        }

        let delayed_first = match (oneshot_key, best) {
            (Some(o), Some((_, d))) => d < o,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => return Next::Idle,
        };

        if !delayed_first {
            let Some(job) = self.oneshots.pop_front() else {
                return Next::Idle;
            };
            self.active_oneshots += 1;
            return Next::OneShot(job.job);
        }

        let Some((id, (due, _))) = best else {
            return Next::Idle;
        };
        if due > now {
            return Next::WaitUntil(due);
        }
        let Some(slot) = self.slots.get_mut(&id) else {
            return Next::Idle;
        };
        slot.due = None;
        slot.running = true;
        slot.started += 1;
        Next::Delayed(id, slot.func.clone())
    }
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    work_ready: Condvar,
    work_done: Condvar,
}

/// A pool of worker threads executing deferred work.
pub struct WorkQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("workers", &self.worker_ids.len())
            .finish()
    }
}

impl WorkQueue {
    /// General-purpose queue with `workers` threads (at least one).
    ///
    /// # Errors
    /// Returns an `io::Error` if a worker thread cannot be spawned.
    pub fn new(name: &str, workers: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            work_done: Condvar::new(),
        });

        let mut handles = Vec::new();
        let mut worker_ids = Vec::new();
        for i in 0..workers.max(1) {
            let s = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}/{i}"))
                .spawn(move || worker_loop(&s));
            let handle = match spawned {
                Ok(h) => h,
                Err(e) => {
                    shutdown_shared(&shared);
                    for h in handles {
                        let _ = JoinHandle::join(h);
                    }
                    return Err(e);
                }
            };
            worker_ids.push(handle.thread().id());
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            worker_ids,
        })
    }

    /// Single-worker queue: items never overlap and run in due order.
    ///
    /// # Errors
    /// Returns an `io::Error` if the worker thread cannot be spawned.
    pub fn ordered(name: &str) -> std::io::Result<Self> {
        Self::new(name, 1)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submits a one-shot job. Returns `false` once the queue is shut down.
    pub fn queue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        let seq = state.bump_seq();
        state.oneshots.push_back(OneShot {
            queued_at: Instant::now(),
            seq,
            job: Box::new(job),
        });
        drop(state);
        self.shared.work_ready.notify_all();
        true
    }

    /// Waits until no one-shot job is queued or running and no delayed item is running.
    /// Pending delayed items whose due time lies in the future are not waited for.
    pub fn drain(&self) {
        let mut state = self.shared.state.lock();
        loop {
            let now = Instant::now();
            let busy = !state.oneshots.is_empty()
                || state.active_oneshots > 0
                || state
                    .slots
                    .values()
                    .any(|s| s.running || s.due.is_some_and(|(due, _)| due <= now));
            if !busy || state.shutdown {
                return;
            }
            self.shared
                .work_done
                .wait_for(&mut state, Duration::from_millis(10));
        }
    }

    /// Stops the workers. Pending delayed work is discarded; running work completes.
    pub fn shutdown(&self) {
        shutdown_shared(&self.shared);

        let current = thread::current().id();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                // Dropped from one of our own jobs; the loop exits after the job returns.
                continue;
            }
            if handle.join().is_err() {
                error!(queue = %self.shared.name, "worker thread panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn shutdown_shared(shared: &Shared) {
    let mut state = shared.state.lock();
    state.shutdown = true;
    // Discarded jobs may queue again from their destructors; drop them unlocked.
    let discarded = std::mem::take(&mut state.oneshots);
    for slot in state.slots.values_mut() {
        slot.due = None;
    }
    drop(state);
    drop(discarded);
    shared.work_ready.notify_all();
    shared.work_done.notify_all();
}

fn run_guarded(queue: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(queue, "work item panicked");
    }
}

fn worker_loop(shared: &Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        match state.next_runnable(Instant::now()) {
            Next::OneShot(job) => {
                MutexGuard::unlocked(&mut state, || run_guarded(&shared.name, job));
                state.active_oneshots -= 1;
                shared.work_done.notify_all();
            }
            Next::Delayed(id, func) => {
                MutexGuard::unlocked(&mut state, || run_guarded(&shared.name, || func()));
                if let Some(slot) = state.slots.get_mut(&id) {
                    slot.running = false;
                    slot.completed += 1;
                }
                shared.work_done.notify_all();
                // A requeue issued while running was skipped by the other workers.
                shared.work_ready.notify_all();
            }
            Next::WaitUntil(due) => {
                shared.work_ready.wait_until(&mut state, due);
            }
            Next::Idle => {
                shared.work_ready.wait(&mut state);
            }
        }
    }
    debug!(queue = %shared.name, "worker exiting");
}

/// A re-armable work item bound to one [`WorkQueue`].
pub struct DelayedWork {
    id: u64,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DelayedWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedWork")
            .field("queue", &self.shared.name)
            .field("id", &self.id)
            .finish()
    }
}

impl DelayedWork {
    pub fn new<F>(queue: &WorkQueue, func: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut state = queue.shared.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.slots.insert(
            id,
            DelayedSlot {
                func: Arc::new(func),
                due: None,
                running: false,
                canceling: false,
                started: 0,
                completed: 0,
            },
        );
        drop(state);

        Self {
            id,
            shared: queue.shared.clone(),
        }
    }

    /// Arms the item to run after `delay`. Returns `false` if it is already pending, is
    /// being cancelled, or the queue is shut down.
    pub fn queue_delayed(&self, delay: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        let seq = state.bump_seq();
        let Some(slot) = state.slots.get_mut(&self.id) else {
            return false;
        };
        if slot.canceling || slot.due.is_some() {
            return false;
        }
        slot.due = Some((Instant::now() + delay, seq));
        drop(state);
        self.shared.work_ready.notify_all();
        true
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared
            .state
            .lock()
            .slots
            .get(&self.id)
            .is_some_and(|s| s.due.is_some())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .slots
            .get(&self.id)
            .is_some_and(|s| s.running)
    }

    /// Runs a pending instance immediately and waits for it, and for any instance already
    /// running, to finish. Later requeues are not waited for. Returns `true` if an
    /// instance was pending.
    pub fn flush(&self) -> bool {
        let mut state = self.shared.state.lock();
        let seq = state.bump_seq();
        let Some(slot) = state.slots.get_mut(&self.id) else {
            return false;
        };

        let was_pending = slot.due.is_some();
        let target = match (was_pending, slot.running) {
            (true, true) => slot.started + 1,
            (true, false) => {
                slot.due = Some((Instant::now(), seq));
                slot.started + 1
            }
            (false, true) => slot.started,
            (false, false) => return false,
        };
        self.shared.work_ready.notify_all();

        loop {
            if state.shutdown {
                break;
            }
            let Some(slot) = state.slots.get_mut(&self.id) else {
                break;
            };
            if slot.completed >= target || (slot.due.is_none() && !slot.running) {
                break;
            }
            if slot.due.is_some() && !slot.running {
                // Pull a re-armed pending instance forward as well.
                slot.due = Some((Instant::now(), seq));
                self.shared.work_ready.notify_all();
            }
            self.shared.work_done.wait(&mut state);
        }
        was_pending
    }

    /// Removes a pending instance and waits for a running one to return. Requeues issued
    /// by the running instance during the wait are refused. Returns `true` if an instance
    /// was pending.
    pub fn cancel_sync(&self) -> bool {
        let mut state = self.shared.state.lock();
        let Some(slot) = state.slots.get_mut(&self.id) else {
            return false;
        };
        slot.canceling = true;
        let was_pending = slot.due.take().is_some();

        while state.slots.get(&self.id).is_some_and(|s| s.running) && !state.shutdown {
            self.shared.work_done.wait(&mut state);
        }

        if let Some(slot) = state.slots.get_mut(&self.id) {
            slot.due = None;
            slot.canceling = false;
        }
        was_pending
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        self.shared.state.lock().slots.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn oneshot_jobs_run() {
        let wq = WorkQueue::new("test_wq", 2).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let h = hits.clone();
            assert!(wq.queue(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        wq.drain();
        assert_eq!(hits.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn pending_item_is_not_queued_twice() {
        let wq = WorkQueue::ordered("test_ordered").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let work = DelayedWork::new(&wq, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(work.queue_delayed(Duration::from_secs(60)));
        assert!(!work.queue_delayed(Duration::ZERO));
        assert!(work.is_pending());

        assert!(work.flush());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!work.is_pending());
    }

    #[test]
    fn cancel_sync_drops_pending_instance() {
        let wq = WorkQueue::new("test_cancel", 1).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let work = DelayedWork::new(&wq, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(work.queue_delayed(Duration::from_millis(200)));
        assert!(work.cancel_sync());
        assert!(!work.cancel_sync());
        thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // The item can be armed again after cancellation.
        assert!(work.queue_delayed(Duration::ZERO));
        work.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_sync_waits_for_running_instance() {
        let wq = WorkQueue::new("test_cancel_running", 1).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        let work = DelayedWork::new(&wq, move || {
            thread::sleep(Duration::from_millis(100));
            f.fetch_add(1, Ordering::SeqCst);
        });

        work.queue_delayed(Duration::ZERO);
        while !work.is_running() {
            thread::yield_now();
        }
        work.cancel_sync();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_does_not_chase_self_requeue() {
        let wq = WorkQueue::ordered("test_requeue").unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Arc<DelayedWork>>>> = Arc::new(Mutex::new(None));

        let r = runs.clone();
        let s = slot.clone();
        let work = Arc::new(DelayedWork::new(&wq, move || {
            r.fetch_add(1, Ordering::SeqCst);
            if let Some(w) = s.lock().as_ref() {
                w.queue_delayed(Duration::from_secs(3600));
            }
        }));
        *slot.lock() = Some(work.clone());

        work.queue_delayed(Duration::ZERO);
        work.flush();
        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert!(work.cancel_sync());
        slot.lock().take();
    }

    #[test]
    fn ordered_queue_runs_in_due_order() {
        let wq = WorkQueue::ordered("test_order").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut items = Vec::new();
        for (i, delay) in [(0u32, 40u64), (1, 10), (2, 25)] {
            let l = log.clone();
            let w = DelayedWork::new(&wq, move || l.lock().push(i));
            w.queue_delayed(Duration::from_millis(delay));
            items.push(w);
        }
        thread::sleep(Duration::from_millis(150));
        wq.drain();
        assert_eq!(*log.lock(), vec![1, 2, 0]);
    }
}
