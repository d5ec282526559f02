use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_SEQNO: AtomicU64 = AtomicU64::new(1);

/// One-shot completion fence.
///
/// The eviction fence of a process is signaled once none of its user-mode queues can touch
/// its buffers any more; buffer validators wait on it before reusing memory.
#[derive(Debug)]
pub struct DmaFence {
    context: u64,
    seqno: u64,
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl DmaFence {
    #[must_use]
    pub fn new(context: u64) -> Arc<Self> {
        Arc::new(Self {
            context,
            seqno: NEXT_SEQNO.fetch_add(1, Ordering::Relaxed),
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    #[must_use]
    pub const fn context(&self) -> u64 {
        self.context
    }

    #[must_use]
    pub const fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Signals the fence and wakes all waiters. Returns `false` if it was already signaled.
    pub fn signal(&self) -> bool {
        let mut signaled = self.signaled.lock();
        if *signaled {
            return false;
        }
        *signaled = true;
        self.cond.notify_all();
        true
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Returns `true` if the fence signaled before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cond.wait_while_for(&mut signaled, |s| !*s, timeout);
        }
        *signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signal_wakes_waiter_once() {
        let fence = DmaFence::new(7);
        assert_eq!(fence.context(), 7);
        assert!(!fence.wait_timeout(Duration::from_millis(5)));

        let f = fence.clone();
        let waiter = thread::spawn(move || f.wait_timeout(Duration::from_secs(5)));
        assert!(fence.signal());
        assert!(!fence.signal());
        assert!(waiter.join().unwrap());
        assert!(fence.is_signaled());
    }

    #[test]
    fn seqnos_are_unique() {
        assert_ne!(DmaFence::new(1).seqno(), DmaFence::new(1).seqno());
    }
}
