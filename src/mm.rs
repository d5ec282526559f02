//! Tasks, memory contexts and exit notifiers.
//!
//! A [`MmStruct`] stands for one user address space. Compute processes are keyed by it and
//! learn about its teardown through a registered [`MmuNotifier`].

use crate::error::{KfdError, KfdResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub type MmId = u64;
pub type Pid = i32;

const MMAP_BASE: u64 = 0x7f00_0000_0000;
const PAGE_MASK: u64 = 4096 - 1;

static NEXT_MM_ID: AtomicU64 = AtomicU64::new(1);

/// Capability handed to notifier callbacks.
///
/// Only [`MmStruct::exit`] can create one. Code holding it may unpublish objects, cancel
/// work, signal already-allocated primitives and hand work off to a queue; resource
/// freeing requires a scope that only the release work item can build.
pub struct NotifierScope {
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for NotifierScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NotifierScope")
    }
}

pub trait MmuNotifier: Send + Sync {
    /// Called once when the address space is torn down.
    fn release(&self, mm: &MmStruct, scope: &NotifierScope);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierHandle(u64);

pub struct MmStruct {
    id: MmId,
    notifiers: Mutex<Vec<(NotifierHandle, Arc<dyn MmuNotifier>)>>,
    next_notifier: AtomicU64,
    exited: AtomicBool,
    /// Held for writing while user mappings are changed.
    pub mmap_lock: RwLock<()>,
    memory: Mutex<HashMap<u64, u64>>,
    next_mmap: AtomicU64,
}

impl fmt::Debug for MmStruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmStruct")
            .field("id", &self.id)
            .field("exited", &self.exited.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MmStruct {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MM_ID.fetch_add(1, Ordering::Relaxed),
            notifiers: Mutex::new(Vec::new()),
            next_notifier: AtomicU64::new(1),
            exited: AtomicBool::new(false),
            mmap_lock: RwLock::new(()),
            memory: Mutex::new(HashMap::new()),
            next_mmap: AtomicU64::new(MMAP_BASE),
        })
    }

    #[must_use]
    pub const fn id(&self) -> MmId {
        self.id
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// # Errors
    /// Returns `InvalidArgument` once the address space has exited.
    pub fn register_notifier(&self, notifier: Arc<dyn MmuNotifier>) -> KfdResult<NotifierHandle> {
        let mut list = self.notifiers.lock();
        if self.has_exited() {
            return Err(KfdError::invalid("address space is exiting"));
        }
        let handle = NotifierHandle(self.next_notifier.fetch_add(1, Ordering::Relaxed));
        list.push((handle, notifier));
        Ok(handle)
    }

    /// Removes a notifier without invoking its release callback.
    pub fn unregister_notifier_no_release(&self, handle: NotifierHandle) {
        self.notifiers.lock().retain(|(h, _)| *h != handle);
    }

    #[must_use]
    pub fn notifier_count(&self) -> usize {
        self.notifiers.lock().len()
    }

    /// Tears the address space down, invoking every registered release callback once.
    pub fn exit(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        let snapshot: Vec<_> = self
            .notifiers
            .lock()
            .iter()
            .map(|(_, n)| n.clone())
            .collect();

        let scope = NotifierScope {
            _not_send: PhantomData,
        };
        for notifier in snapshot {
            notifier.release(self, &scope);
        }
    }

    /// Reserves a page-aligned user mapping of `len` bytes and returns its address.
    pub fn vm_mmap(&self, len: u64) -> u64 {
        let len = (len + PAGE_MASK) & !PAGE_MASK;
        self.next_mmap.fetch_add(len.max(PAGE_MASK + 1), Ordering::Relaxed)
    }

    pub fn write_u64(&self, addr: u64, value: u64) {
        self.memory.lock().insert(addr, value);
    }

    /// # Errors
    /// Returns an `EFAULT` I/O error for an address that was never written.
    pub fn read_u64(&self, addr: u64) -> KfdResult<u64> {
        self.memory
            .lock()
            .get(&addr)
            .copied()
            .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EFAULT).into())
    }
}

/// A thread of a user process.
#[derive(Debug)]
pub struct Task {
    pid: Pid,
    mm: Option<Arc<MmStruct>>,
    group_leader: Option<Arc<Task>>,
}

impl Task {
    /// A thread-group leader.
    #[must_use]
    pub fn leader(pid: Pid, mm: Option<Arc<MmStruct>>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            mm,
            group_leader: None,
        })
    }

    /// A further thread of this task's group, sharing the leader's address space.
    #[must_use]
    pub fn spawn_thread(self: &Arc<Self>, pid: Pid) -> Arc<Self> {
        let leader = self.group_leader();
        Arc::new(Self {
            pid,
            mm: leader.mm.clone(),
            group_leader: Some(leader),
        })
    }

    /// A thread of `leader`'s group running on a different address space.
    #[must_use]
    pub fn with_mm(leader: &Arc<Self>, pid: Pid, mm: Option<Arc<MmStruct>>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            mm,
            group_leader: Some(leader.group_leader()),
        })
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn tgid(&self) -> Pid {
        self.group_leader.as_ref().map_or(self.pid, |l| l.pid)
    }

    #[must_use]
    pub const fn mm(&self) -> Option<&Arc<MmStruct>> {
        self.mm.as_ref()
    }

    #[must_use]
    pub fn group_leader(self: &Arc<Self>) -> Arc<Self> {
        self.group_leader.clone().unwrap_or_else(|| self.clone())
    }

    /// `true` when the group leader runs on the same address space as this thread.
    #[must_use]
    pub fn shares_leader_mm(self: &Arc<Self>) -> bool {
        let leader = self.group_leader();
        match (self.mm(), leader.mm()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
