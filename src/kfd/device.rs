//! Accelerator devices and the collaborators the process manager drives.
//!
//! Hardware queue programming, GPU virtual memory and IOMMU binding live outside this
//! crate; they are reached through the traits below.

use crate::error::{KfdError, KfdResult};
use crate::kfd::doorbell::DoorbellPool;
use crate::kfd::pasid::Pasid;
use crate::kfd::qcm::{QcmProcessDevice, QueueProperties};
use crate::sync::DmaFence;
use parking_lot::Mutex;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

pub type GpuId = u32;

// ===============================================================================================
// Opaque Backend Handles
// ===============================================================================================

/// A GPU virtual address space owned by the GPU-VM backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmHandle(pub u64);

/// Backend bookkeeping shared by all VMs of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessVmInfo(pub u64);

/// A buffer object allocated by the GPU-VM backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u64);

/// An open DRM render node whose VM is adopted by a process-device.
#[derive(Debug, PartialEq, Eq)]
pub struct DrmFile {
    fd: RawFd,
}

impl DrmFile {
    #[must_use]
    pub const fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    #[must_use]
    pub const fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Result of creating or acquiring a process VM.
#[derive(Debug, Clone)]
pub struct VmAttachment {
    pub vm: VmHandle,
    pub process_info: ProcessVmInfo,
    /// Set when the backend created the process info, and with it a fresh eviction fence.
    pub fence: Option<Arc<DmaFence>>,
}

// ===============================================================================================
// Collaborator Traits
// ===============================================================================================

/// Hardware queue scheduling for one device.
///
/// Eviction is reference counted inside the queue manager: nested evictions of the same
/// process-device need a matching number of restores.
pub trait DeviceQueueManager: Send + Sync {
    fn evict_process_queues(&self, qpd: &QcmProcessDevice) -> KfdResult<()>;
    fn restore_process_queues(&self, qpd: &QcmProcessDevice) -> KfdResult<()>;
    fn check_queues_active(&self, qpd: &QcmProcessDevice) -> bool;
    /// Destroys every queue of the process on this device.
    fn process_termination(&self, qpd: &QcmProcessDevice) -> KfdResult<()>;
    /// Returns the VMID the process runs under, or 0 when firmware assigns it.
    fn create_queue(&self, qpd: &QcmProcessDevice, queue: &QueueProperties) -> KfdResult<u32>;
    fn destroy_queue(&self, qpd: &QcmProcessDevice, queue: &QueueProperties) -> KfdResult<()>;
}

/// GPU virtual memory and buffer objects.
pub trait GpuVmBackend: Send + Sync {
    fn create_process_vm(
        &self,
        gpu_id: GpuId,
        pasid: Pasid,
        info: Option<ProcessVmInfo>,
    ) -> KfdResult<VmAttachment>;

    fn acquire_process_vm(
        &self,
        gpu_id: GpuId,
        file: &DrmFile,
        pasid: Pasid,
        info: Option<ProcessVmInfo>,
    ) -> KfdResult<VmAttachment>;

    fn destroy_process_vm(&self, gpu_id: GpuId, vm: VmHandle);

    /// Releases a VM acquired from `file` and closes the file.
    fn release_process_vm(&self, gpu_id: GpuId, vm: VmHandle, file: DrmFile);

    fn alloc_memory_of_gpu(
        &self,
        gpu_id: GpuId,
        vm: VmHandle,
        va: u64,
        size: u64,
        flags: u32,
    ) -> KfdResult<MemHandle>;

    fn free_memory_of_gpu(&self, gpu_id: GpuId, mem: MemHandle) -> KfdResult<()>;
    fn map_memory_to_gpu(&self, gpu_id: GpuId, mem: MemHandle, vm: VmHandle) -> KfdResult<()>;
    fn unmap_memory_from_gpu(&self, gpu_id: GpuId, mem: MemHandle, vm: VmHandle)
    -> KfdResult<()>;
    fn sync_memory(&self, gpu_id: GpuId, mem: MemHandle, intr: bool) -> KfdResult<()>;

    /// Maps a GTT buffer for kernel access and returns the kernel address.
    fn map_gtt_bo_to_kernel(&self, gpu_id: GpuId, mem: MemHandle) -> KfdResult<u64>;

    /// Copies `data` to a kernel mapping obtained from [`GpuVmBackend::map_gtt_bo_to_kernel`].
    fn write_kernel(&self, kaddr: u64, data: &[u8]);

    /// Revalidates every buffer of the process and returns the new eviction fence.
    fn restore_process_bos(&self, info: ProcessVmInfo) -> KfdResult<Arc<DmaFence>>;
}

pub trait IommuBinder: Send + Sync {
    fn bind_pasid(&self, gpu_id: GpuId, pasid: Pasid) -> KfdResult<()>;
    fn unbind_pasid(&self, gpu_id: GpuId, pasid: Pasid);
}

/// Miscellaneous hardware hooks. All default to no-ops.
pub trait Kfd2Kgd: Send + Sync {
    fn disable_debug_trap(&self, _vmid: u32) {}
    fn set_wave_launch_mode(&self, _mode: u32, _vmid: u32) {}
    fn release_debug_watch_points(&self, _mask: u32) {}
    fn release_debug_trap_vmid(&self) {}

    fn supports_cu_occupancy(&self) -> bool {
        false
    }

    /// Waves in flight for `pasid` and the per-CU wave limit.
    fn cu_occupancy(&self, _pasid: Pasid) -> Option<(u32, u32)> {
        None
    }

    fn flush_gpu_tlb_vmid(&self, _vmid: u32) {}
    fn flush_gpu_tlb_pasid(&self, _pasid: Pasid) {}
}

#[derive(Debug, Default)]
pub struct NoopKfd2Kgd;

impl Kfd2Kgd for NoopKfd2Kgd {}

// ===============================================================================================
// Device Properties
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedPolicy {
    #[default]
    Hws,
    HwsNoOversubscription,
    NoHws,
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone)]
pub struct DeviceProperties {
    pub soc15: bool,
    pub dgpu: bool,
    pub needs_iommu_device: bool,
    pub cwsr_enabled: bool,
    /// Trap handler copied to the start of every context save area.
    pub cwsr_isa: Vec<u8>,
    pub non_cp_doorbells_start: u32,
    pub non_cp_doorbells_end: u32,
    /// Number of per-process doorbell slices.
    pub doorbell_slices: usize,
    pub gpuvm_size: u64,
    pub sched_policy: SchedPolicy,
    pub last_vmid_kfd: u32,
}

impl Default for DeviceProperties {
    fn default() -> Self {
        Self {
            soc15: true,
            dgpu: true,
            needs_iommu_device: false,
            cwsr_enabled: false,
            cwsr_isa: Vec::new(),
            non_cp_doorbells_start: 0,
            non_cp_doorbells_end: 0,
            doorbell_slices: 1024,
            gpuvm_size: 1 << 47,
            sched_policy: SchedPolicy::Hws,
            last_vmid_kfd: 15,
        }
    }
}

// ===============================================================================================
// Runtime Power Management
// ===============================================================================================

type ResumeHook = Arc<dyn Fn() -> KfdResult<()> + Send + Sync>;

/// Runtime power usage counter of one device.
pub struct RuntimePm {
    usage: AtomicI64,
    last_busy: Mutex<Option<Instant>>,
    resume: Option<ResumeHook>,
}

impl fmt::Debug for RuntimePm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimePm")
            .field("usage", &self.usage_count())
            .finish_non_exhaustive()
    }
}

impl RuntimePm {
    fn new(resume: Option<ResumeHook>) -> Self {
        Self {
            usage: AtomicI64::new(0),
            last_busy: Mutex::new(None),
            resume,
        }
    }

    /// Takes a usage reference and resumes the device. The reference is taken even when
    /// resuming fails; the caller drops it with [`RuntimePm::put_autosuspend`].
    ///
    /// # Errors
    /// Propagates the resume failure.
    pub fn get_sync(&self) -> KfdResult<()> {
        self.usage.fetch_add(1, Ordering::AcqRel);
        match &self.resume {
            Some(resume) => resume(),
            None => Ok(()),
        }
    }

    pub fn put_autosuspend(&self) {
        self.usage.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mark_last_busy(&self) {
        *self.last_busy.lock() = Some(Instant::now());
    }

    #[must_use]
    pub fn last_busy(&self) -> Option<Instant> {
        *self.last_busy.lock()
    }

    #[must_use]
    pub fn usage_count(&self) -> i64 {
        self.usage.load(Ordering::Acquire)
    }
}

// ===============================================================================================
// Device
// ===============================================================================================

/// One accelerator known to the driver.
pub struct KfdDevice {
    gpu_id: GpuId,
    props: DeviceProperties,
    dqm: Arc<dyn DeviceQueueManager>,
    kfd2kgd: Arc<dyn Kfd2Kgd>,
    doorbells: DoorbellPool,
    runtime_pm: RuntimePm,
}

impl fmt::Debug for KfdDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KfdDevice")
            .field("gpu_id", &self.gpu_id)
            .field("props", &self.props)
            .field("doorbells", &self.doorbells)
            .field("runtime_pm", &self.runtime_pm)
            .finish_non_exhaustive()
    }
}

impl KfdDevice {
    #[must_use]
    pub fn builder(gpu_id: GpuId, dqm: Arc<dyn DeviceQueueManager>) -> KfdDeviceBuilder {
        KfdDeviceBuilder {
            gpu_id,
            props: DeviceProperties::default(),
            dqm,
            kfd2kgd: Arc::new(NoopKfd2Kgd),
            resume: None,
        }
    }

    #[must_use]
    pub const fn gpu_id(&self) -> GpuId {
        self.gpu_id
    }

    #[must_use]
    pub const fn props(&self) -> &DeviceProperties {
        &self.props
    }

    #[must_use]
    pub fn dqm(&self) -> &dyn DeviceQueueManager {
        self.dqm.as_ref()
    }

    #[must_use]
    pub fn kfd2kgd(&self) -> &dyn Kfd2Kgd {
        self.kfd2kgd.as_ref()
    }

    #[must_use]
    pub const fn doorbells(&self) -> &DoorbellPool {
        &self.doorbells
    }

    #[must_use]
    pub const fn runtime_pm(&self) -> &RuntimePm {
        &self.runtime_pm
    }
}

pub struct KfdDeviceBuilder {
    gpu_id: GpuId,
    props: DeviceProperties,
    dqm: Arc<dyn DeviceQueueManager>,
    kfd2kgd: Arc<dyn Kfd2Kgd>,
    resume: Option<ResumeHook>,
}

impl KfdDeviceBuilder {
    #[must_use]
    pub fn properties(mut self, props: DeviceProperties) -> Self {
        self.props = props;
        self
    }

    #[must_use]
    pub fn kfd2kgd(mut self, hooks: Arc<dyn Kfd2Kgd>) -> Self {
        self.kfd2kgd = hooks;
        self
    }

    /// Hook run by [`RuntimePm::get_sync`] to power the device up.
    #[must_use]
    pub fn runtime_resume<F>(mut self, resume: F) -> Self
    where
        F: Fn() -> KfdResult<()> + Send + Sync + 'static,
    {
        self.resume = Some(Arc::new(resume));
        self
    }

    /// # Errors
    /// Returns `InvalidArgument` for a zero GPU id or an inverted reserved doorbell range.
    pub fn build(self) -> KfdResult<Arc<KfdDevice>> {
        if self.gpu_id == 0 {
            return Err(KfdError::invalid("gpu_id 0 is reserved"));
        }
        if self.props.non_cp_doorbells_start > self.props.non_cp_doorbells_end {
            return Err(KfdError::invalid(format!(
                "reserved doorbell range 0x{:x}-0x{:x} is inverted",
                self.props.non_cp_doorbells_start, self.props.non_cp_doorbells_end
            )));
        }

        Ok(Arc::new(KfdDevice {
            gpu_id: self.gpu_id,
            doorbells: DoorbellPool::new(self.props.doorbell_slices),
            props: self.props,
            dqm: self.dqm,
            kfd2kgd: self.kfd2kgd,
            runtime_pm: RuntimePm::new(self.resume),
        }))
    }
}
