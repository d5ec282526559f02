use kfd_process::kfd::device::{
    DeviceQueueManager, DrmFile, GpuId, GpuVmBackend, IommuBinder, KfdDevice, MemHandle,
    ProcessVmInfo, VmAttachment, VmHandle,
};
use kfd_process::kfd::ioctl::{KFD_IOC_ALLOC_MEM_FLAGS_VRAM, QueueType};
use kfd_process::kfd::pasid::Pasid;
use kfd_process::kfd::qcm::{QcmProcessDevice, QueueProperties};
use kfd_process::mm::{MmStruct, Task};
use kfd_process::sync::DmaFence;
use kfd_process::{Kfd, KfdResult, ProcessConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Queue manager that only reports what it is asked to do.
struct PrintingDqm;

impl DeviceQueueManager for PrintingDqm {
    fn evict_process_queues(&self, qpd: &QcmProcessDevice) -> KfdResult<()> {
        println!("    [dqm] evict queues of pasid {} on gpu {}", qpd.pasid, qpd.gpu_id);
        Ok(())
    }
    fn restore_process_queues(&self, qpd: &QcmProcessDevice) -> KfdResult<()> {
        println!("    [dqm] restore queues of pasid {} on gpu {}", qpd.pasid, qpd.gpu_id);
        Ok(())
    }
    fn check_queues_active(&self, _qpd: &QcmProcessDevice) -> bool {
        true
    }
    fn process_termination(&self, qpd: &QcmProcessDevice) -> KfdResult<()> {
        println!("    [dqm] terminate pasid {} on gpu {}", qpd.pasid, qpd.gpu_id);
        Ok(())
    }
    fn create_queue(&self, _qpd: &QcmProcessDevice, queue: &QueueProperties) -> KfdResult<u32> {
        println!("    [dqm] create queue {}", queue.queue_id);
        Ok(8)
    }
    fn destroy_queue(&self, _qpd: &QcmProcessDevice, queue: &QueueProperties) -> KfdResult<()> {
        println!("    [dqm] destroy queue {}", queue.queue_id);
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryGpuVm {
    next: AtomicU64,
}

impl InMemoryGpuVm {
    fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl GpuVmBackend for InMemoryGpuVm {
    fn create_process_vm(
        &self,
        _gpu_id: GpuId,
        _pasid: Pasid,
        info: Option<ProcessVmInfo>,
    ) -> KfdResult<VmAttachment> {
        let fence = info.is_none().then(|| DmaFence::new(1));
        Ok(VmAttachment {
            vm: VmHandle(self.next()),
            process_info: info.unwrap_or(ProcessVmInfo(self.next())),
            fence,
        })
    }

    fn acquire_process_vm(
        &self,
        gpu_id: GpuId,
        _file: &DrmFile,
        pasid: Pasid,
        info: Option<ProcessVmInfo>,
    ) -> KfdResult<VmAttachment> {
        self.create_process_vm(gpu_id, pasid, info)
    }

    fn destroy_process_vm(&self, gpu_id: GpuId, vm: VmHandle) {
        println!("    [gpuvm] destroy vm {} on gpu {gpu_id}", vm.0);
    }

    fn release_process_vm(&self, gpu_id: GpuId, vm: VmHandle, _file: DrmFile) {
        self.destroy_process_vm(gpu_id, vm);
    }

    fn alloc_memory_of_gpu(
        &self,
        _gpu_id: GpuId,
        _vm: VmHandle,
        _va: u64,
        _size: u64,
        _flags: u32,
    ) -> KfdResult<MemHandle> {
        Ok(MemHandle(self.next()))
    }

    fn free_memory_of_gpu(&self, _gpu_id: GpuId, _mem: MemHandle) -> KfdResult<()> {
        Ok(())
    }

    fn map_memory_to_gpu(&self, _gpu_id: GpuId, _mem: MemHandle, _vm: VmHandle) -> KfdResult<()> {
        Ok(())
    }

    fn unmap_memory_from_gpu(&self, _gpu_id: GpuId, _mem: MemHandle, _vm: VmHandle) -> KfdResult<()> {
        Ok(())
    }

    fn sync_memory(&self, _gpu_id: GpuId, _mem: MemHandle, _intr: bool) -> KfdResult<()> {
        Ok(())
    }

    fn map_gtt_bo_to_kernel(&self, _gpu_id: GpuId, mem: MemHandle) -> KfdResult<u64> {
        Ok(0xffff_8000_0000_0000 | mem.0 << 12)
    }

    fn write_kernel(&self, _kaddr: u64, _data: &[u8]) {}

    fn restore_process_bos(&self, _info: ProcessVmInfo) -> KfdResult<Arc<DmaFence>> {
        println!("    [gpuvm] buffers revalidated");
        Ok(DmaFence::new(1))
    }
}

struct NoIommu;

impl IommuBinder for NoIommu {
    fn bind_pasid(&self, _gpu_id: GpuId, _pasid: Pasid) -> KfdResult<()> {
        Ok(())
    }
    fn unbind_pasid(&self, _gpu_id: GpuId, _pasid: Pasid) {}
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("============================================================");
    println!("           KFD Process Manager - Lifecycle Walkthrough       ");
    println!("============================================================");

    let config = ProcessConfig::from_env().restore_time(Duration::from_millis(50));
    let gpu_id: GpuId = 0x1001;
    let device = KfdDevice::builder(gpu_id, Arc::new(PrintingDqm)).build()?;
    let kfd = Kfd::new(
        config,
        vec![device],
        Arc::new(InMemoryGpuVm::default()),
        Arc::new(NoIommu),
    )?;

    // 1. Open the driver from a fresh user process
    println!("[+] Creating process...");
    let mm = MmStruct::new();
    let task = Task::leader(1000, Some(mm.clone()));
    let process = kfd.create_process(&task)?;
    println!("    PASID: {}", process.pasid());

    // 2. Bind the GPU and allocate some memory
    println!("[+] Binding GPU {gpu_id}...");
    {
        let mut st = process.lock();
        st.bind_process_to_device(gpu_id, &task)?;
        let handle = st.alloc_memory_of_gpu(gpu_id, 0x10_0000, 0x10_000, KFD_IOC_ALLOC_MEM_FLAGS_VRAM)?;
        st.map_memory_to_gpu(gpu_id, handle, &[gpu_id])?;
        st.create_queue(gpu_id, QueueProperties::new(QueueType::ComputeAql, 0x20_0000, 0x1000))?;
    }
    let vram_path = format!("1000/vram_{gpu_id}");
    println!("    {vram_path}: {}", kfd.procfs().read(&vram_path)?.trim());

    // 3. Let the memory manager evict the process
    println!("[+] Evicting...");
    let fence = process.eviction_fence().ok_or("process has no eviction fence")?;
    kfd.schedule_evict_and_restore(&mm, &fence)?;
    if !fence.wait_timeout(Duration::from_secs(1)) {
        return Err("eviction fence never signaled".into());
    }
    println!("    Eviction fence signaled, waiting for restore...");
    std::thread::sleep(config.restore_time * 3);
    let stats_path = format!("1000/stats_{gpu_id}/evicted_ms");
    println!("    {stats_path}: {}", kfd.procfs().read(&stats_path)?.trim());

    // 4. Exit
    println!("[+] Tearing down...");
    drop(process);
    mm.exit();
    kfd.drain();
    println!("    Live processes: {}", kfd.process_count());
    println!("    PASIDs in use: {}", kfd.pasid_allocator().in_use());

    Ok(())
}
