//! Compute process lifecycle: creation, lookup, eviction and teardown.

pub mod bo_index;
pub mod cwsr;
pub mod device_data;
pub mod eviction;
pub mod events;
mod interval_tree;
pub mod object;
pub mod queue_manager;
mod table;

pub use device_data::{DebugTrapState, EvictionStats, PddBound, ProcessDevice};
pub use object::{KfdProcess, ProcessGuard, ProcessPhase, ProcessRef, ProcessState};

use crate::config::{MAX_PASID_BITS, ProcessConfig};
use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{GpuId, GpuVmBackend, IommuBinder, KfdDevice};
use crate::kfd::pasid::{Pasid, PasidAllocator};
use crate::kfd::sysfs::Procfs;
use crate::mm::{MmStruct, Task};
use crate::sync::{DmaFence, Srcu, WorkQueue};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use table::ProcessTable;
use tracing::{debug, info};

/// Driver-wide state every process points back to.
pub(crate) struct KfdShared {
    pub(crate) config: ProcessConfig,
    pub(crate) devices: Vec<Arc<KfdDevice>>,
    pub(crate) table: ProcessTable,
    pub(crate) pasids: PasidAllocator,
    pub(crate) srcu: Arc<Srcu>,
    pub(crate) process_wq: WorkQueue,
    /// Ordered: restores run one at a time across all processes.
    pub(crate) restore_wq: WorkQueue,
    pub(crate) procfs: Procfs,
    pub(crate) gpuvm: Arc<dyn GpuVmBackend>,
    pub(crate) iommu: Arc<dyn IommuBinder>,
}

/// Entry point of the process manager.
pub struct Kfd {
    shared: Arc<KfdShared>,
}

impl fmt::Debug for Kfd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kfd")
            .field("config", &self.shared.config)
            .field("devices", &self.shared.devices.len())
            .field("processes", &self.shared.table.len())
            .finish_non_exhaustive()
    }
}

impl Kfd {
    /// # Errors
    /// Returns `InvalidArgument` for duplicate GPU ids or an out-of-range PASID width,
    /// or an I/O error if the worker threads cannot be spawned.
    pub fn new(
        config: ProcessConfig,
        devices: Vec<Arc<KfdDevice>>,
        gpuvm: Arc<dyn GpuVmBackend>,
        iommu: Arc<dyn IommuBinder>,
    ) -> KfdResult<Self> {
        if !(1..=MAX_PASID_BITS).contains(&config.pasid_bits) {
            return Err(KfdError::invalid(format!(
                "pasid_bits must be within 1..={MAX_PASID_BITS}, got {}",
                config.pasid_bits
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = devices.iter().find(|d| !seen.insert(d.gpu_id())) {
            return Err(KfdError::invalid(format!("duplicate gpu id {}", dup.gpu_id())));
        }

        let srcu = Arc::new(Srcu::new());
        let process_wq = WorkQueue::new("kfd_process_wq", config.process_wq_workers.max(1))?;
        let restore_wq = WorkQueue::ordered("kfd_restore_wq")?;

        info!(devices = devices.len(), ?config, "process manager started");
        Ok(Self {
            shared: Arc::new(KfdShared {
                config,
                devices,
                table: ProcessTable::new(srcu.clone()),
                pasids: PasidAllocator::new(config.pasid_bits),
                srcu,
                process_wq,
                restore_wq,
                procfs: Procfs::new(),
                gpuvm,
                iommu,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ProcessConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn devices(&self) -> &[Arc<KfdDevice>] {
        &self.shared.devices
    }

    #[must_use]
    pub fn device(&self, gpu_id: GpuId) -> Option<&Arc<KfdDevice>> {
        self.shared.devices.iter().find(|d| d.gpu_id() == gpu_id)
    }

    #[must_use]
    pub fn procfs(&self) -> &Procfs {
        &self.shared.procfs
    }

    #[must_use]
    pub fn pasid_allocator(&self) -> &PasidAllocator {
        &self.shared.pasids
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Returns the process of `thread`'s address space, creating it on first use, and
    /// takes a reference on it.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the thread has no live address space or does not
    /// share its group leader's, or the creation failure.
    pub fn create_process(&self, thread: &Arc<Task>) -> KfdResult<ProcessRef> {
        let mm = usable_mm(thread)?;

        let _creation = self.shared.table.creation_lock();
        if let Some(reference) = self.shared.table.find_by_mm_ref(mm.id()) {
            debug!(pasid = reference.pasid(), "process already found");
            return Ok(reference);
        }
        let process = KfdProcess::create(&self.shared, thread, &mm)?;
        self.shared.procfs.add_process(&process);
        // Still holds its initial reference; only the exit notifier drops that.
        process
            .get_ref()
            .ok_or_else(|| KfdError::invalid("process exited during creation"))
    }

    /// The process of `thread`'s address space, without taking a reference.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the thread has no usable address space or no process
    /// exists for it.
    pub fn get_process(&self, thread: &Arc<Task>) -> KfdResult<Arc<KfdProcess>> {
        let mm = usable_mm(thread)?;
        self.shared
            .table
            .find_by_mm(mm.id())
            .ok_or_else(|| KfdError::invalid("no process for this address space"))
    }

    #[must_use]
    pub fn lookup_by_mm(&self, mm: &MmStruct) -> Option<ProcessRef> {
        self.shared.table.find_by_mm_ref(mm.id())
    }

    #[must_use]
    pub fn lookup_by_pasid(&self, pasid: Pasid) -> Option<ProcessRef> {
        self.shared.table.find_by_pasid_ref(pasid)
    }

    #[must_use]
    pub fn lookup_by_task(&self, task: &Task) -> Option<ProcessRef> {
        task.mm().and_then(|mm| self.lookup_by_mm(mm))
    }

    /// Called by the memory manager when the buffers fenced by `fence` are about to move.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if no process exists for `mm`.
    pub fn schedule_evict_and_restore(&self, mm: &MmStruct, fence: &DmaFence) -> KfdResult<()> {
        let process = self
            .shared
            .table
            .find_by_mm(mm.id())
            .ok_or_else(|| KfdError::invalid("no process for this address space"))?;
        process.schedule_eviction(fence);
        Ok(())
    }

    /// Evicts every process ahead of a system suspend.
    pub fn suspend_all_processes(&self) {
        eviction::suspend_all(&self.shared);
    }

    /// Queues an immediate restore of every process.
    ///
    /// # Errors
    /// Returns an `EFAULT` I/O error if any restore could not be queued.
    pub fn resume_all_processes(&self) -> KfdResult<()> {
        eviction::resume_all(&self.shared)
    }

    /// Waits until all queued teardown work has run.
    pub fn drain(&self) {
        self.shared.process_wq.drain();
    }
}

impl Drop for Kfd {
    fn drop(&mut self) {
        self.shared.process_wq.shutdown();
        self.shared.restore_wq.shutdown();
        self.shared.table.clear();
    }
}

fn usable_mm(thread: &Arc<Task>) -> KfdResult<Arc<MmStruct>> {
    let mm = thread
        .mm()
        .filter(|mm| !mm.has_exited())
        .ok_or_else(|| KfdError::invalid("thread has no address space"))?;
    // Only the pthreads threading model is supported.
    if !thread.shares_leader_mm() {
        return Err(KfdError::invalid("thread does not share its group leader's address space"));
    }
    Ok(mm.clone())
}
