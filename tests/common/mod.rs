#![allow(dead_code)]

use kfd_process::kfd::device::{
    DeviceProperties, DeviceQueueManager, DrmFile, GpuId, GpuVmBackend, IommuBinder, Kfd2Kgd,
    KfdDevice, MemHandle, ProcessVmInfo, VmAttachment, VmHandle,
};
use kfd_process::kfd::pasid::Pasid;
use kfd_process::kfd::qcm::{QcmProcessDevice, QueueProperties};
use kfd_process::mm::{MmStruct, Task};
use kfd_process::sync::DmaFence;
use kfd_process::{Kfd, KfdError, KfdResult, ProcessConfig};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub const GPU0: GpuId = 0x1001;
pub const GPU1: GpuId = 0x1002;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Extra context appended to a log entry at the moment it is recorded.
pub type Probe = Box<dyn Fn() -> String + Send + Sync>;

/// Ordered record of collaborator calls shared by all stubs of one harness.
#[derive(Default)]
pub struct CallLog {
    entries: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e.starts_with(prefix))
    }

    pub fn find(&self, prefix: &str) -> Option<String> {
        self.entries.lock().iter().find(|e| e.starts_with(prefix)).cloned()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Time span of one collaborator call.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub start: Instant,
    pub end: Instant,
}

impl Span {
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ===============================================================================================
// Device Queue Manager
// ===============================================================================================

pub struct StubDqm {
    gpu_id: GpuId,
    log: Arc<CallLog>,
    /// Eviction nesting depth per PASID.
    depth: Mutex<HashMap<Pasid, i32>>,
    pub fail_evict: AtomicBool,
    pub fail_restore: AtomicBool,
    pub queues_active: AtomicBool,
    pub vmid: AtomicU32,
    pub op_delay: Mutex<Duration>,
    in_op: AtomicUsize,
    pub overlaps: AtomicUsize,
    pub evict_spans: Mutex<Vec<Span>>,
    pub probe: Mutex<Option<Probe>>,
}

impl StubDqm {
    pub fn new(gpu_id: GpuId, log: Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self {
            gpu_id,
            log,
            depth: Mutex::new(HashMap::new()),
            fail_evict: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            queues_active: AtomicBool::new(true),
            vmid: AtomicU32::new(8),
            op_delay: Mutex::new(Duration::ZERO),
            in_op: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
            evict_spans: Mutex::new(Vec::new()),
            probe: Mutex::new(None),
        })
    }

    pub fn depth(&self, pasid: Pasid) -> i32 {
        self.depth.lock().get(&pasid).copied().unwrap_or(0)
    }

    fn record(&self, what: &str, pasid: Pasid) {
        let extra = self.probe.lock().as_ref().map(|p| p()).unwrap_or_default();
        self.log.push(format!("{what}:{}:{pasid} {extra}", self.gpu_id));
    }

    fn timed<T>(&self, f: impl FnOnce() -> T) -> (T, Span) {
        if self.in_op.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let start = Instant::now();
        let delay = *self.op_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let out = f();
        self.in_op.fetch_sub(1, Ordering::SeqCst);
        (out, Span { start, end: Instant::now() })
    }
}

impl DeviceQueueManager for StubDqm {
    fn evict_process_queues(&self, qpd: &QcmProcessDevice) -> KfdResult<()> {
        let (result, span) = self.timed(|| {
            if self.fail_evict.load(Ordering::SeqCst) {
                return Err(KfdError::backend(-libc::EIO, "evict failed"));
            }
            *self.depth.lock().entry(qpd.pasid).or_insert(0) += 1;
            Ok(())
        });
        self.evict_spans.lock().push(span);
        self.record("evict", qpd.pasid);
        result
    }

    fn restore_process_queues(&self, qpd: &QcmProcessDevice) -> KfdResult<()> {
        let (result, _) = self.timed(|| {
            if self.fail_restore.load(Ordering::SeqCst) {
                return Err(KfdError::backend(-libc::EIO, "restore failed"));
            }
            let mut depth = self.depth.lock();
            let d = depth.entry(qpd.pasid).or_insert(0);
            *d = (*d - 1).max(0);
            Ok(())
        });
        self.record("restore", qpd.pasid);
        result
    }

    fn check_queues_active(&self, qpd: &QcmProcessDevice) -> bool {
        self.record("check_active", qpd.pasid);
        self.queues_active.load(Ordering::SeqCst)
    }

    fn process_termination(&self, qpd: &QcmProcessDevice) -> KfdResult<()> {
        self.record("terminate", qpd.pasid);
        Ok(())
    }

    fn create_queue(&self, qpd: &QcmProcessDevice, queue: &QueueProperties) -> KfdResult<u32> {
        self.log.push(format!("create_queue:{}:{}", self.gpu_id, queue.queue_id));
        let _ = qpd;
        Ok(self.vmid.load(Ordering::SeqCst))
    }

    fn destroy_queue(&self, _qpd: &QcmProcessDevice, queue: &QueueProperties) -> KfdResult<()> {
        self.log.push(format!("destroy_queue:{}:{}", self.gpu_id, queue.queue_id));
        Ok(())
    }
}

// ===============================================================================================
// GPU-VM Backend
// ===============================================================================================

pub struct StubGpuVm {
    log: Arc<CallLog>,
    next_handle: AtomicU64,
    pub live_vms: Mutex<HashSet<u64>>,
    pub live_mems: Mutex<HashSet<u64>>,
    pub kernel_writes: Mutex<Vec<(u64, Vec<u8>)>>,
    pub alloc_flags: Mutex<Vec<(u64, u32)>>,
    /// Number of upcoming `restore_process_bos` calls that fail.
    pub restore_failures: AtomicUsize,
    pub restore_delay: Mutex<Duration>,
    pub restore_spans: Mutex<Vec<Span>>,
    restore_in_flight: AtomicUsize,
    pub restore_max_in_flight: AtomicUsize,
    pub fail_map_kernel: AtomicBool,
    pub fail_create_vm: AtomicBool,
    pub probe: Mutex<Option<Probe>>,
}

impl StubGpuVm {
    pub fn new(log: Arc<CallLog>) -> Arc<Self> {
        Arc::new(Self {
            log,
            next_handle: AtomicU64::new(1),
            live_vms: Mutex::new(HashSet::new()),
            live_mems: Mutex::new(HashSet::new()),
            kernel_writes: Mutex::new(Vec::new()),
            alloc_flags: Mutex::new(Vec::new()),
            restore_failures: AtomicUsize::new(0),
            restore_delay: Mutex::new(Duration::ZERO),
            restore_spans: Mutex::new(Vec::new()),
            restore_in_flight: AtomicUsize::new(0),
            restore_max_in_flight: AtomicUsize::new(0),
            fail_map_kernel: AtomicBool::new(false),
            fail_create_vm: AtomicBool::new(false),
            probe: Mutex::new(None),
        })
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn attach(&self, info: Option<ProcessVmInfo>) -> VmAttachment {
        let vm = self.next();
        self.live_vms.lock().insert(vm);
        let (process_info, fence) = match info {
            Some(info) => (info, None),
            None => (ProcessVmInfo(self.next()), Some(DmaFence::new(vm))),
        };
        VmAttachment {
            vm: VmHandle(vm),
            process_info,
            fence,
        }
    }

    /// Completed `restore_process_bos` calls.
    pub fn restore_calls(&self) -> usize {
        self.restore_spans.lock().len()
    }

    pub fn restore_in_flight(&self) -> usize {
        self.restore_in_flight.load(Ordering::SeqCst)
    }
}

impl GpuVmBackend for StubGpuVm {
    fn create_process_vm(
        &self,
        gpu_id: GpuId,
        _pasid: Pasid,
        info: Option<ProcessVmInfo>,
    ) -> KfdResult<VmAttachment> {
        if self.fail_create_vm.load(Ordering::SeqCst) {
            return Err(KfdError::ResourceExhausted("vm"));
        }
        self.log.push(format!("create_vm:{gpu_id}"));
        Ok(self.attach(info))
    }

    fn acquire_process_vm(
        &self,
        gpu_id: GpuId,
        file: &DrmFile,
        _pasid: Pasid,
        info: Option<ProcessVmInfo>,
    ) -> KfdResult<VmAttachment> {
        self.log.push(format!("acquire_vm:{gpu_id}:{}", file.fd()));
        Ok(self.attach(info))
    }

    fn destroy_process_vm(&self, gpu_id: GpuId, vm: VmHandle) {
        let extra = self.probe.lock().as_ref().map(|p| p()).unwrap_or_default();
        self.log.push(format!("destroy_vm:{gpu_id} {extra}"));
        self.live_vms.lock().remove(&vm.0);
    }

    fn release_process_vm(&self, gpu_id: GpuId, vm: VmHandle, file: DrmFile) {
        self.log.push(format!("release_vm:{gpu_id}:{}", file.fd()));
        self.live_vms.lock().remove(&vm.0);
    }

    fn alloc_memory_of_gpu(
        &self,
        gpu_id: GpuId,
        _vm: VmHandle,
        va: u64,
        size: u64,
        flags: u32,
    ) -> KfdResult<MemHandle> {
        let mem = self.next();
        self.log.push(format!("alloc:{gpu_id}:0x{va:x}:0x{size:x}"));
        self.live_mems.lock().insert(mem);
        self.alloc_flags.lock().push((va, flags));
        Ok(MemHandle(mem))
    }

    fn free_memory_of_gpu(&self, gpu_id: GpuId, mem: MemHandle) -> KfdResult<()> {
        self.log.push(format!("free:{gpu_id}"));
        if self.live_mems.lock().remove(&mem.0) {
            Ok(())
        } else {
            Err(KfdError::backend(-libc::ENOENT, "unknown BO"))
        }
    }

    fn map_memory_to_gpu(&self, gpu_id: GpuId, _mem: MemHandle, _vm: VmHandle) -> KfdResult<()> {
        self.log.push(format!("map:{gpu_id}"));
        Ok(())
    }

    fn unmap_memory_from_gpu(&self, gpu_id: GpuId, _mem: MemHandle, _vm: VmHandle) -> KfdResult<()> {
        self.log.push(format!("unmap:{gpu_id}"));
        Ok(())
    }

    fn sync_memory(&self, _gpu_id: GpuId, _mem: MemHandle, _intr: bool) -> KfdResult<()> {
        Ok(())
    }

    fn map_gtt_bo_to_kernel(&self, _gpu_id: GpuId, mem: MemHandle) -> KfdResult<u64> {
        if self.fail_map_kernel.load(Ordering::SeqCst) {
            return Err(KfdError::ResourceExhausted("kernel mapping"));
        }
        Ok(0xffff_8000_0000_0000 | (mem.0 << 16))
    }

    fn write_kernel(&self, kaddr: u64, data: &[u8]) {
        self.kernel_writes.lock().push((kaddr, data.to_vec()));
    }

    fn restore_process_bos(&self, _info: ProcessVmInfo) -> KfdResult<Arc<DmaFence>> {
        let now = self.restore_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.restore_max_in_flight.fetch_max(now, Ordering::SeqCst);
        let start = Instant::now();
        let extra = self.probe.lock().as_ref().map(|p| p()).unwrap_or_default();

        let delay = *self.restore_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let fail = self
            .restore_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.restore_in_flight.fetch_sub(1, Ordering::SeqCst);
        self.restore_spans.lock().push(Span {
            start,
            end: Instant::now(),
        });
        self.log.push(format!("restore_bos fail={fail} {extra}"));

        if fail {
            Err(KfdError::backend(-libc::EBUSY, "BOs still reserved"))
        } else {
            Ok(DmaFence::new(0))
        }
    }
}

// ===============================================================================================
// IOMMU and KGD hooks
// ===============================================================================================

pub struct StubIommu {
    log: Arc<CallLog>,
    pub fail_bind: AtomicBool,
}

impl IommuBinder for StubIommu {
    fn bind_pasid(&self, gpu_id: GpuId, pasid: Pasid) -> KfdResult<()> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(KfdError::backend(-libc::EINVAL, "bind failed"));
        }
        self.log.push(format!("iommu_bind:{gpu_id}:{pasid}"));
        Ok(())
    }

    fn unbind_pasid(&self, gpu_id: GpuId, pasid: Pasid) {
        self.log.push(format!("iommu_unbind:{gpu_id}:{pasid}"));
    }
}

pub struct StubKgd {
    log: Arc<CallLog>,
    pub occupancy: Mutex<Option<(u32, u32)>>,
}

impl Kfd2Kgd for StubKgd {
    fn disable_debug_trap(&self, vmid: u32) {
        self.log.push(format!("disable_debug_trap:{vmid}"));
    }

    fn set_wave_launch_mode(&self, mode: u32, vmid: u32) {
        self.log.push(format!("wave_launch_mode:{mode}:{vmid}"));
    }

    fn release_debug_watch_points(&self, mask: u32) {
        self.log.push(format!("release_watch_points:{mask:#x}"));
    }

    fn release_debug_trap_vmid(&self) {
        self.log.push("release_debug_trap_vmid");
    }

    fn supports_cu_occupancy(&self) -> bool {
        self.occupancy.lock().is_some()
    }

    fn cu_occupancy(&self, _pasid: Pasid) -> Option<(u32, u32)> {
        *self.occupancy.lock()
    }

    fn flush_gpu_tlb_vmid(&self, vmid: u32) {
        self.log.push(format!("flush_vmid:{vmid}"));
    }

    fn flush_gpu_tlb_pasid(&self, pasid: Pasid) {
        self.log.push(format!("flush_pasid:{pasid}"));
    }
}

// ===============================================================================================
// Harness
// ===============================================================================================

pub struct Harness {
    pub kfd: Kfd,
    pub log: Arc<CallLog>,
    pub gpuvm: Arc<StubGpuVm>,
    pub iommu: Arc<StubIommu>,
    pub dqms: Vec<Arc<StubDqm>>,
    pub kgds: Vec<Arc<StubKgd>>,
}

impl Harness {
    /// One device per entry of `props`, with GPU ids `GPU0`, `GPU1`, ...
    pub fn new(config: ProcessConfig, props: Vec<DeviceProperties>) -> Self {
        init_tracing();
        let log = Arc::new(CallLog::default());
        let gpuvm = StubGpuVm::new(log.clone());
        let iommu = Arc::new(StubIommu {
            log: log.clone(),
            fail_bind: AtomicBool::new(false),
        });

        let mut dqms = Vec::new();
        let mut kgds = Vec::new();
        let mut devices = Vec::new();
        for (i, p) in props.into_iter().enumerate() {
            let gpu_id = GPU0 + u32::try_from(i).unwrap();
            let dqm = StubDqm::new(gpu_id, log.clone());
            let kgd = Arc::new(StubKgd {
                log: log.clone(),
                occupancy: Mutex::new(None),
            });
            devices.push(
                KfdDevice::builder(gpu_id, dqm.clone())
                    .properties(p)
                    .kfd2kgd(kgd.clone())
                    .build()
                    .unwrap(),
            );
            dqms.push(dqm);
            kgds.push(kgd);
        }

        let kfd = Kfd::new(config, devices, gpuvm.clone(), iommu.clone()).unwrap();
        Self {
            kfd,
            log,
            gpuvm,
            iommu,
            dqms,
            kgds,
        }
    }

    pub fn with_devices(config: ProcessConfig, n: usize) -> Self {
        Self::new(config, vec![DeviceProperties::default(); n])
    }

    pub fn device(&self, gpu_id: GpuId) -> Arc<KfdDevice> {
        self.kfd.device(gpu_id).unwrap().clone()
    }
}

/// A fresh single-threaded user process.
pub fn user_process(pid: i32) -> (Arc<Task>, Arc<MmStruct>) {
    let mm = MmStruct::new();
    (Task::leader(pid, Some(mm.clone())), mm)
}

/// Config with short timings so scheduled work runs promptly.
pub fn fast_config() -> ProcessConfig {
    ProcessConfig::new()
        .restore_time(Duration::from_millis(20))
        .back_off_time(Duration::from_millis(5))
        .active_time(Duration::ZERO)
}
