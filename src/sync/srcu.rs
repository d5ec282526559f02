//! Sleepable read-side sections with deferred reclamation.
//!
//! Readers hold an [`SrcuReadGuard`] for the duration of a lookup. An updater that has
//! unpublished an object calls [`Srcu::synchronize`], which returns only once every guard
//! taken before the call has been dropped. Guards taken afterwards are not waited for.

use super::workqueue::WorkQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct SrcuState {
    generation: u64,
    /// Live readers keyed by the generation they entered in.
    readers: BTreeMap<u64, usize>,
}

#[derive(Debug, Default)]
pub struct Srcu {
    state: Mutex<SrcuState>,
    drained: Condvar,
}

#[must_use = "the read section ends when the guard is dropped"]
pub struct SrcuReadGuard<'a> {
    srcu: &'a Srcu,
    generation: u64,
}

impl Srcu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_lock(&self) -> SrcuReadGuard<'_> {
        let mut state = self.state.lock();
        let generation = state.generation;
        *state.readers.entry(generation).or_insert(0) += 1;
        SrcuReadGuard {
            srcu: self,
            generation,
        }
    }

    /// Waits for all read sections that began before this call.
    pub fn synchronize(&self) {
        let mut state = self.state.lock();
        let boundary = state.generation;
        state.generation += 1;
        while state.readers.range(..=boundary).next().is_some() {
            self.drained.wait(&mut state);
        }
    }

    /// Runs `f` on `queue` once a grace period has elapsed. Returns `false` if the queue
    /// refused the job.
    pub fn call_srcu<F>(self: &Arc<Self>, queue: &WorkQueue, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let srcu = self.clone();
        queue.queue(move || {
            srcu.synchronize();
            f();
        })
    }

    #[must_use]
    pub fn active_readers(&self) -> usize {
        self.state.lock().readers.values().sum()
    }
}

impl Drop for SrcuReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.srcu.state.lock();
        if let Some(count) = state.readers.get_mut(&self.generation) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&self.generation);
                self.srcu.drained.notify_all();
            }
        }
    }
}
