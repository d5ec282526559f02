//! The process object and its lifetime.
//!
//! A [`KfdProcess`] is created the first time a thread of an address space opens the
//! driver and is keyed by that address space for the rest of its life. Three parties keep
//! it alive: the exit notifier registered on the address space (the initial reference),
//! every open [`ProcessRef`], and the debug-trap attach references held by its devices.
//!
//! Teardown runs in two halves. The exit notifier unpublishes the process, stops its
//! deferred work and its queues, and hands the initial reference to the process
//! workqueue after a grace period. Dropping the last reference then queues the release
//! job, which is the only place device resources are returned.

use super::KfdShared;
use super::bo_index::BoIndex;
use super::device_data::ProcessDevice;
use super::eviction;
use super::events::EventTable;
use super::queue_manager::ProcessQueueManager;
use crate::error::KfdResult;
use crate::kfd::device::{GpuId, ProcessVmInfo};
use crate::kfd::pasid::Pasid;
use crate::mm::{MmId, MmStruct, MmuNotifier, NotifierHandle, NotifierScope, Pid, Task};
use crate::sync::{DelayedWork, DmaFence};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

// ===============================================================================================
// Lifecycle
// ===============================================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessPhase {
    /// Under construction, not yet published.
    Uninitialized = 0,
    Active = 1,
    /// The address space is gone; queues are stopped and the process is unpublished.
    ExitNotified = 2,
    /// The last reference is gone and the release job is queued.
    PendingDestroy = 3,
    Destroyed = 4,
}

impl ProcessPhase {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Active,
            2 => Self::ExitNotified,
            3 => Self::PendingDestroy,
            _ => Self::Destroyed,
        }
    }
}

/// Capability to free device resources. Only the release job and creation rollback
/// construct one.
pub struct ReleaseScope {
    _private: (),
}

impl ReleaseScope {
    const fn new() -> Self {
        Self { _private: () }
    }
}

// ===============================================================================================
// Mutable State
// ===============================================================================================

/// Everything guarded by the per-process mutex.
#[derive(Debug)]
pub struct ProcessState {
    pub(crate) pasid: Pasid,
    pub(crate) mm: Option<Weak<MmStruct>>,
    /// Process-device data in attach order.
    pub(crate) pdds: Vec<ProcessDevice>,
    pub(crate) bos: BoIndex,
    pub(crate) ef: Option<Arc<DmaFence>>,
    pub(crate) process_info: Option<ProcessVmInfo>,
    pub(crate) pqm: ProcessQueueManager,
    pub(crate) events: EventTable,
    pub(crate) has_cwsr: bool,
    /// Evicted with doorbells unmapped because every queue was idle.
    pub(crate) idle_evicted: bool,
}

impl ProcessState {
    fn new(pasid: Pasid, mm: &Arc<MmStruct>) -> Self {
        Self {
            pasid,
            mm: Some(Arc::downgrade(mm)),
            pdds: Vec::new(),
            bos: BoIndex::new(),
            ef: None,
            process_info: None,
            pqm: ProcessQueueManager::new(),
            events: EventTable::new(),
            has_cwsr: false,
            idle_evicted: false,
        }
    }

    #[must_use]
    pub const fn pasid(&self) -> Pasid {
        self.pasid
    }

    /// The address space, while it is still alive and not yet torn down.
    #[must_use]
    pub fn mm(&self) -> Option<Arc<MmStruct>> {
        self.mm.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn pdd_index(&self, gpu_id: GpuId) -> Option<usize> {
        self.pdds.iter().position(|pdd| pdd.gpu_id() == gpu_id)
    }

    #[must_use]
    pub fn pdd(&self, gpu_id: GpuId) -> Option<&ProcessDevice> {
        self.pdds.iter().find(|pdd| pdd.gpu_id() == gpu_id)
    }

    pub(crate) fn pdd_mut(&mut self, gpu_id: GpuId) -> Option<&mut ProcessDevice> {
        self.pdds.iter_mut().find(|pdd| pdd.gpu_id() == gpu_id)
    }

    #[must_use]
    pub fn pdds(&self) -> &[ProcessDevice] {
        &self.pdds
    }

    #[must_use]
    pub const fn bos(&self) -> &BoIndex {
        &self.bos
    }

    pub fn events_mut(&mut self) -> &mut EventTable {
        &mut self.events
    }

    #[must_use]
    pub const fn eviction_fence(&self) -> Option<&Arc<DmaFence>> {
        self.ef.as_ref()
    }

    #[must_use]
    pub const fn process_info(&self) -> Option<ProcessVmInfo> {
        self.process_info
    }

    #[must_use]
    pub const fn has_cwsr(&self) -> bool {
        self.has_cwsr
    }

    #[must_use]
    pub const fn is_idle_evicted(&self) -> bool {
        self.idle_evicted
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.pqm.queue_count()
    }
}

/// Locked view of a process. Device, memory and queue operations are methods on it.
pub struct ProcessGuard<'a> {
    pub(crate) process: &'a KfdProcess,
    pub(crate) state: MutexGuard<'a, ProcessState>,
}

impl ProcessGuard<'_> {
    #[must_use]
    pub const fn process(&self) -> &KfdProcess {
        self.process
    }
}

impl Deref for ProcessGuard<'_> {
    type Target = ProcessState;

    fn deref(&self) -> &ProcessState {
        &self.state
    }
}

impl DerefMut for ProcessGuard<'_> {
    fn deref_mut(&mut self) -> &mut ProcessState {
        &mut self.state
    }
}

// ===============================================================================================
// Process
// ===============================================================================================

pub struct KfdProcess {
    pub(crate) kfd: Arc<KfdShared>,
    pasid: Pasid,
    mm_id: MmId,
    lead_pid: Pid,
    lead_thread: Mutex<Option<Arc<Task>>>,
    kref: AtomicUsize,
    phase: AtomicU8,
    state: Mutex<ProcessState>,
    pub(crate) eviction_work: DelayedWork,
    pub(crate) restore_work: DelayedWork,
    last_evict_timestamp: Mutex<Instant>,
    last_restore_timestamp: Mutex<Instant>,
    last_eviction_seqno: AtomicU64,
    notifier: Mutex<Option<NotifierHandle>>,
}

impl fmt::Debug for KfdProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KfdProcess")
            .field("pasid", &self.pasid)
            .field("lead_pid", &self.lead_pid)
            .field("mm_id", &self.mm_id)
            .field("refs", &self.ref_count())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl KfdProcess {
    /// Builds, sets up and publishes a process for `thread`'s address space. The caller
    /// holds the table's creation lock.
    pub(crate) fn create(
        kfd: &Arc<KfdShared>,
        thread: &Arc<Task>,
        mm: &Arc<MmStruct>,
    ) -> KfdResult<Arc<Self>> {
        let pasid = kfd.pasids.alloc()?;
        let now = Instant::now();

        let process = Arc::new_cyclic(|weak: &Weak<Self>| {
            let evict = weak.clone();
            let restore = weak.clone();
            Self {
                kfd: kfd.clone(),
                pasid,
                mm_id: mm.id(),
                lead_pid: thread.tgid(),
                lead_thread: Mutex::new(Some(thread.group_leader())),
                kref: AtomicUsize::new(1),
                phase: AtomicU8::new(ProcessPhase::Uninitialized as u8),
                state: Mutex::new(ProcessState::new(pasid, mm)),
                eviction_work: DelayedWork::new(&kfd.process_wq, move || {
                    if let Some(p) = evict.upgrade() {
                        eviction::evict_process_worker(&p);
                    }
                }),
                restore_work: DelayedWork::new(&kfd.restore_wq, move || {
                    if let Some(p) = restore.upgrade() {
                        eviction::restore_process_worker(&p);
                    }
                }),
                last_evict_timestamp: Mutex::new(now),
                last_restore_timestamp: Mutex::new(now),
                last_eviction_seqno: AtomicU64::new(0),
                notifier: Mutex::new(None),
            }
        });

        if let Err(e) = process.lock().init_apertures(&kfd.devices) {
            process.unwind_creation();
            return Err(e);
        }

        let notifier = Arc::new(ProcessNotifier {
            process: Arc::downgrade(&process),
            initial: Mutex::new(Some(ProcessRef::adopt(process.clone()))),
        });
        match mm.register_notifier(notifier.clone()) {
            Ok(handle) => *process.notifier.lock() = Some(handle),
            Err(e) => {
                if let Some(initial) = notifier.initial.lock().take() {
                    initial.disarm();
                }
                process.unwind_creation();
                return Err(e);
            }
        }

        kfd.table.insert(mm.id(), process.clone());
        process.advance(ProcessPhase::Uninitialized, ProcessPhase::Active);
        debug!(pasid, lead_pid = process.lead_pid, "created process");
        Ok(process)
    }

    fn unwind_creation(&self) {
        let scope = ReleaseScope::new();
        let mut st = self.lock();
        st.free_outstanding_bos(&scope);
        st.destroy_pdds(&scope);
        drop(st);
        self.kfd.pasids.free(self.pasid);
        self.lead_thread.lock().take();
    }

    /// Takes a counted reference, unless the last one is already gone and the
    /// process is on its way to release.
    #[must_use]
    pub fn get_ref(self: &Arc<Self>) -> Option<ProcessRef> {
        self.kref
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                (refs != 0).then_some(refs + 1)
            })
            .ok()?;
        Some(ProcessRef {
            process: self.clone(),
            armed: true,
        })
    }

    pub fn lock(&self) -> ProcessGuard<'_> {
        ProcessGuard {
            process: self,
            state: self.state.lock(),
        }
    }

    #[must_use]
    pub const fn pasid(&self) -> Pasid {
        self.pasid
    }

    #[must_use]
    pub const fn mm_id(&self) -> MmId {
        self.mm_id
    }

    #[must_use]
    pub const fn lead_pid(&self) -> Pid {
        self.lead_pid
    }

    /// The thread-group leader, until the process is released.
    #[must_use]
    pub fn lead_thread(&self) -> Option<Arc<Task>> {
        self.lead_thread.lock().clone()
    }

    #[must_use]
    pub fn is_lead_thread(&self, task: &Task) -> bool {
        task.pid() == self.lead_pid
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.kref.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn phase(&self) -> ProcessPhase {
        ProcessPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to`. A process found in any other phase is left alone.
    fn advance(&self, from: ProcessPhase, to: ProcessPhase) -> bool {
        match self
            .phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(actual) => {
                warn!(
                    pasid = self.pasid,
                    from = ?from,
                    to = ?to,
                    actual = ?ProcessPhase::from_raw(actual),
                    "refusing process phase transition"
                );
                false
            }
        }
    }

    #[must_use]
    pub fn last_evict_timestamp(&self) -> Instant {
        *self.last_evict_timestamp.lock()
    }

    pub(crate) fn set_last_evict_timestamp(&self, at: Instant) {
        *self.last_evict_timestamp.lock() = at;
    }

    #[must_use]
    pub fn last_restore_timestamp(&self) -> Instant {
        *self.last_restore_timestamp.lock()
    }

    pub(crate) fn set_last_restore_timestamp(&self, at: Instant) {
        *self.last_restore_timestamp.lock() = at;
    }

    #[must_use]
    pub fn last_eviction_seqno(&self) -> u64 {
        self.last_eviction_seqno.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_eviction_seqno(&self, seqno: u64) {
        self.last_eviction_seqno.store(seqno, Ordering::Release);
    }

    /// Clone of the current eviction fence, if any.
    #[must_use]
    pub fn eviction_fence(&self) -> Option<Arc<DmaFence>> {
        self.lock().ef.clone()
    }

    #[must_use]
    pub fn eviction_pending(&self) -> bool {
        self.eviction_work.is_pending()
    }

    #[must_use]
    pub fn restore_pending(&self) -> bool {
        self.restore_work.is_pending()
    }

    // -------------------------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------------------------

    /// First half of teardown, run from the address-space exit notifier.
    fn exit_notified(&self, mm: &MmStruct, scope: &NotifierScope) {
        self.kfd.table.remove(self.mm_id, self);
        self.kfd.srcu.synchronize();

        self.eviction_work.cancel_sync();
        self.restore_work.cancel_sync();

        let mut st = self.lock();
        let attach_refs = st.detach_debug_traps(scope);
        st.dequeue_from_all_devices(scope);
        st.pqm_uninit(scope);

        // No further buffer validation can happen for this process.
        st.mm = None;
        if let Some(ef) = &st.ef {
            ef.signal();
        }
        drop(st);
        drop(attach_refs);

        self.advance(ProcessPhase::Active, ProcessPhase::ExitNotified);
        if let Some(handle) = self.notifier.lock().take() {
            mm.unregister_notifier_no_release(handle);
        }
        debug!(pasid = self.pasid, "process exit handled");
    }
}

/// Second half of teardown. Runs on the process workqueue once the last reference is
/// gone.
fn release(process: &KfdProcess) {
    let scope = ReleaseScope::new();
    let kfd = &process.kfd;

    kfd.procfs.remove_process(process.lead_pid);

    let mut st = process.lock();
    st.iommu_unbind_all(&scope);
    st.free_outstanding_bos(&scope);
    st.destroy_pdds(&scope);
    st.ef = None;
    st.events.free_all();
    drop(st);

    kfd.pasids.free(process.pasid);
    process.lead_thread.lock().take();
    process.advance(ProcessPhase::PendingDestroy, ProcessPhase::Destroyed);
    debug!(pasid = process.pasid, "process released");
}

// ===============================================================================================
// References
// ===============================================================================================

/// A counted reference to a process. Dropping the last one queues the release job.
pub struct ProcessRef {
    process: Arc<KfdProcess>,
    armed: bool,
}

impl ProcessRef {
    /// Wraps the reference that `kref` was initialised with.
    const fn adopt(process: Arc<KfdProcess>) -> Self {
        Self {
            process,
            armed: true,
        }
    }

    /// Gives the count back without releasing. Only for rollback before publication.
    fn disarm(mut self) {
        self.armed = false;
        self.process.kref.fetch_sub(1, Ordering::AcqRel);
    }

    #[must_use]
    pub const fn arc(&self) -> &Arc<KfdProcess> {
        &self.process
    }
}

impl Clone for ProcessRef {
    fn clone(&self) -> Self {
        // The count cannot be zero while `self` holds one.
        self.process.kref.fetch_add(1, Ordering::AcqRel);
        Self {
            process: self.process.clone(),
            armed: true,
        }
    }
}

impl Deref for ProcessRef {
    type Target = KfdProcess;

    fn deref(&self) -> &KfdProcess {
        &self.process
    }
}

impl fmt::Debug for ProcessRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProcessRef").field(&self.process.pasid).finish()
    }
}

impl Drop for ProcessRef {
    fn drop(&mut self) {
        if !self.armed || self.process.kref.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let process = self.process.clone();
        process.advance(ProcessPhase::ExitNotified, ProcessPhase::PendingDestroy);

        let kfd = process.kfd.clone();
        let job = process.clone();
        if !kfd.process_wq.queue(move || release(&job)) {
            warn!(pasid = process.pasid, "process workqueue is gone, releasing inline");
            release(&process);
        }
    }
}

// ===============================================================================================
// Exit Notifier
// ===============================================================================================

struct ProcessNotifier {
    process: Weak<KfdProcess>,
    /// The initial reference, handed off once the exit has been processed.
    initial: Mutex<Option<ProcessRef>>,
}

impl MmuNotifier for ProcessNotifier {
    fn release(&self, mm: &MmStruct, scope: &NotifierScope) {
        let Some(process) = self.process.upgrade() else {
            return;
        };
        if process.mm_id != mm.id() {
            warn!(pasid = process.pasid, "exit notifier fired for a foreign address space");
            return;
        }

        process.exit_notified(mm, scope);

        if let Some(initial) = self.initial.lock().take() {
            let kfd = process.kfd.clone();
            if !kfd.srcu.call_srcu(&kfd.process_wq, move || drop(initial)) {
                warn!(
                    pasid = process.pasid,
                    "process workqueue is gone, final unref ran synchronously"
                );
            }
        }
    }
}
