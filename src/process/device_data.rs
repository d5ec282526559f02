//! Per process-device data: the state one process keeps for one device.

use super::object::{ProcessGuard, ProcessRef, ProcessState, ReleaseScope};
use crate::error::{KfdError, KfdResult};
use crate::kfd::aperture::{PAGE_SIZE, ProcessApertures, SVM_CWSR_BASE, SVM_IB_BASE};
use crate::kfd::device::{DrmFile, GpuId, GpuVmBackend, KfdDevice, MemHandle, SchedPolicy, VmHandle};
use crate::kfd::doorbell::{KFD_DOORBELL_PROCESS_SLICE_SIZE, init_doorbell_bitmap};
use crate::kfd::ioctl::{AllocFlags, MemType};
use crate::kfd::qcm::{CwsrMemory, QcmProcessDevice};
use crate::mm::{NotifierScope, Task};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PddBound {
    Unbound,
    Bound,
}

/// Debugger state of one process-device.
#[derive(Debug, Default)]
pub struct DebugTrapState {
    pub enabled: bool,
    pub watch_points: u32,
    pub wave_launch_mode: u32,
    /// Keeps the process alive while a debugger is attached.
    attach_ref: Option<ProcessRef>,
}

/// Accumulated time the queues of one process-device spent evicted.
///
/// Evictions nest; the clock runs from the outermost eviction to its matching restore.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvictionStats {
    depth: u32,
    since: Option<Instant>,
    total: Duration,
}

impl EvictionStats {
    pub(crate) fn evicted(&mut self) {
        if self.depth == 0 {
            self.since = Some(Instant::now());
        }
        self.depth += 1;
    }

    pub(crate) fn restored(&mut self) {
        match self.depth {
            0 => {}
            1 => {
                self.depth = 0;
                if let Some(since) = self.since.take() {
                    self.total += since.elapsed();
                }
            }
            _ => self.depth -= 1,
        }
    }

    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub fn evicted_duration(&self) -> Duration {
        self.total + self.since.map_or(Duration::ZERO, |s| s.elapsed())
    }

    #[must_use]
    pub fn evicted_ms(&self) -> u64 {
        u64::try_from(self.evicted_duration().as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
pub struct ProcessDevice {
    pub(crate) dev: Arc<KfdDevice>,
    pub(crate) qpd: QcmProcessDevice,
    pub(crate) apertures: ProcessApertures,
    pub(crate) vm: Option<VmHandle>,
    /// Render node the VM was adopted from; closing it releases the VM.
    pub(crate) drm_file: Option<DrmFile>,
    pub(crate) doorbell_index: u32,
    pub(crate) bound: PddBound,
    pub(crate) runtime_inuse: bool,
    pub(crate) already_dequeued: bool,
    pub(crate) debug: DebugTrapState,
    pub(crate) vram_usage: u64,
    pub(crate) sdma_past_activity_counter: u64,
    pub(crate) eviction: EvictionStats,
}

impl ProcessDevice {
    #[must_use]
    pub const fn gpu_id(&self) -> GpuId {
        self.qpd.gpu_id
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<KfdDevice> {
        &self.dev
    }

    #[must_use]
    pub const fn qpd(&self) -> &QcmProcessDevice {
        &self.qpd
    }

    #[must_use]
    pub const fn apertures(&self) -> &ProcessApertures {
        &self.apertures
    }

    #[must_use]
    pub const fn vm(&self) -> Option<VmHandle> {
        self.vm
    }

    #[must_use]
    pub const fn has_drm_file(&self) -> bool {
        self.drm_file.is_some()
    }

    #[must_use]
    pub const fn doorbell_index(&self) -> u32 {
        self.doorbell_index
    }

    /// User-visible offset of this process's doorbell slice.
    #[must_use]
    pub const fn doorbell_offset(&self) -> u64 {
        self.doorbell_index as u64 * KFD_DOORBELL_PROCESS_SLICE_SIZE
    }

    #[must_use]
    pub const fn bound(&self) -> PddBound {
        self.bound
    }

    #[must_use]
    pub const fn runtime_inuse(&self) -> bool {
        self.runtime_inuse
    }

    #[must_use]
    pub const fn already_dequeued(&self) -> bool {
        self.already_dequeued
    }

    #[must_use]
    pub const fn debug_trap(&self) -> &DebugTrapState {
        &self.debug
    }

    #[must_use]
    pub const fn vram_usage(&self) -> u64 {
        self.vram_usage
    }

    #[must_use]
    pub const fn sdma_past_activity_counter(&self) -> u64 {
        self.sdma_past_activity_counter
    }

    #[must_use]
    pub const fn eviction_stats(&self) -> &EvictionStats {
        &self.eviction
    }
}

fn missing_pdd(gpu_id: GpuId) -> KfdError {
    KfdError::invalid(format!("process has no data for gpu {gpu_id}"))
}

/// Unmaps `mem` from the VM it was mapped into and frees it. Failures are logged only.
fn free_gpuvm(gpuvm: &dyn GpuVmBackend, gpu_id: GpuId, mem: MemHandle, vm: VmHandle) {
    if let Err(e) = gpuvm.unmap_memory_from_gpu(gpu_id, mem, vm) {
        debug!(gpu_id, error = %e, "unmap during free failed");
    }
    if let Err(e) = gpuvm.free_memory_of_gpu(gpu_id, mem) {
        warn!(gpu_id, error = %e, "failed to free GPU memory");
    }
}

// ===============================================================================================
// TLB
// ===============================================================================================

impl ProcessState {
    /// Invalidates cached translations of this process on `gpu_id`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the process has no data for the device.
    pub fn flush_tlb(&self, gpu_id: GpuId) -> KfdResult<()> {
        let pdd = self.pdd(gpu_id).ok_or_else(|| missing_pdd(gpu_id))?;
        let dev = &pdd.dev;

        if dev.props().sched_policy == SchedPolicy::NoHws {
            // Nothing to flush until a VMID is assigned.
            if pdd.qpd.vmid != 0 {
                dev.kfd2kgd().flush_gpu_tlb_vmid(pdd.qpd.vmid);
            }
        } else {
            dev.kfd2kgd().flush_gpu_tlb_pasid(self.pasid);
        }
        Ok(())
    }
}

// ===============================================================================================
// Device Attach
// ===============================================================================================

impl ProcessGuard<'_> {
    /// Returns the data for `dev`, creating it on first use.
    ///
    /// # Errors
    /// Returns `ResourceExhausted` when the device has no free doorbell slice.
    pub fn get_or_create_pdd(&mut self, dev: &Arc<KfdDevice>) -> KfdResult<&ProcessDevice> {
        let idx = self.pdd_index_or_create(dev)?;
        Ok(&self.state.pdds[idx])
    }

    pub(crate) fn pdd_index_or_create(&mut self, dev: &Arc<KfdDevice>) -> KfdResult<usize> {
        if let Some(idx) = self.pdd_index(dev.gpu_id()) {
            return Ok(idx);
        }

        let doorbell_index = dev.doorbells().alloc_process_doorbells()?;
        let pasid = self.pasid;
        let qpd = QcmProcessDevice::new(pasid, dev.gpu_id(), init_doorbell_bitmap(dev.props()));

        self.state.pdds.push(ProcessDevice {
            dev: dev.clone(),
            qpd,
            apertures: ProcessApertures::default(),
            vm: None,
            drm_file: None,
            doorbell_index,
            bound: PddBound::Unbound,
            runtime_inuse: false,
            already_dequeued: false,
            debug: DebugTrapState::default(),
            vram_usage: 0,
            sdma_past_activity_counter: 0,
            eviction: EvictionStats::default(),
        });
        debug!(pasid, gpu_id = dev.gpu_id(), doorbell_index, "created process device data");
        Ok(self.state.pdds.len() - 1)
    }

    /// Creates data for every device and lays out its apertures. dGPUs also get the fixed
    /// CWSR and IB addresses below the user part of the GPUVM aperture.
    pub(crate) fn init_apertures(&mut self, devices: &[Arc<KfdDevice>]) -> KfdResult<()> {
        for dev in devices {
            let idx = self.pdd_index_or_create(dev).inspect_err(|e| {
                error!(gpu_id = dev.gpu_id(), error = %e, "failed to create process device data");
            })?;

            let props = dev.props();
            let pdd = &mut self.state.pdds[idx];
            pdd.apertures = ProcessApertures::for_device(props);
            if props.dgpu {
                pdd.qpd.cwsr_base = SVM_CWSR_BASE;
                pdd.qpd.ib_base = SVM_IB_BASE;
            }
            debug!(
                gpu_id = dev.gpu_id(),
                gpuvm_base = format_args!("0x{:x}", pdd.apertures.gpuvm.base),
                gpuvm_limit = format_args!("0x{:x}", pdd.apertures.gpuvm.limit),
                "node apertures"
            );
        }
        Ok(())
    }

    /// Makes the device usable by the process: powers it up, binds the PASID to the IOMMU
    /// when required and, for the lead thread, sets up the VM.
    ///
    /// # Errors
    /// Propagates runtime-resume, IOMMU and VM failures. The power reference is dropped
    /// again on failure unless it was already held.
    pub fn bind_process_to_device(&mut self, gpu_id: GpuId, current: &Task) -> KfdResult<()> {
        let idx = self.pdd_index(gpu_id).ok_or_else(|| {
            error!(gpu_id, "process device data doesn't exist");
            missing_pdd(gpu_id)
        })?;
        let dev = self.state.pdds[idx].dev.clone();
        let pm = dev.runtime_pm();

        // Only the first bind takes a power reference; it is dropped with the PDD.
        if !self.state.pdds[idx].runtime_inuse {
            if let Err(e) = pm.get_sync() {
                pm.put_autosuspend();
                return Err(e);
            }
        }

        let mut result = self.iommu_bind(idx);
        if result.is_ok() && self.process.is_lead_thread(current) {
            result = self.init_vm(gpu_id, None);
        }

        let pdd = &mut self.state.pdds[idx];
        match result {
            Ok(()) => {
                pdd.runtime_inuse = true;
                Ok(())
            }
            Err(e) => {
                if !pdd.runtime_inuse {
                    pm.mark_last_busy();
                    pm.put_autosuspend();
                }
                Err(e)
            }
        }
    }

    fn iommu_bind(&mut self, idx: usize) -> KfdResult<()> {
        let iommu = self.process.kfd.iommu.clone();
        let pasid = self.pasid;
        let pdd = &mut self.state.pdds[idx];
        if !pdd.dev.props().needs_iommu_device || pdd.bound == PddBound::Bound {
            return Ok(());
        }
        iommu.bind_pasid(pdd.gpu_id(), pasid)?;
        pdd.bound = PddBound::Bound;
        Ok(())
    }

    pub(crate) fn iommu_unbind_all(&mut self, _scope: &ReleaseScope) {
        let iommu = self.process.kfd.iommu.clone();
        let pasid = self.pasid;
        for pdd in &mut self.state.pdds {
            if pdd.bound == PddBound::Bound {
                iommu.unbind_pasid(pdd.gpu_id(), pasid);
                pdd.bound = PddBound::Unbound;
            }
        }
    }

    /// Gives the process-device a VM, adopting the one behind `drm_file` if given, and
    /// reserves the kernel IB and, on dGPUs, the CWSR area inside it.
    ///
    /// # Errors
    /// Returns `Busy` if a VM exists and `drm_file` asks for another one. A VM that exists
    /// without `drm_file` is success. Setup failures release everything created here.
    pub fn init_vm(&mut self, gpu_id: GpuId, drm_file: Option<DrmFile>) -> KfdResult<()> {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let idx = self.pdd_index(gpu_id).ok_or_else(|| missing_pdd(gpu_id))?;
        let st = &mut *self.state;

        if st.pdds[idx].vm.is_some() {
            return if drm_file.is_some() {
                Err(KfdError::Busy)
            } else {
                Ok(())
            };
        }

        let attached = match &drm_file {
            Some(file) => gpuvm.acquire_process_vm(gpu_id, file, st.pasid, st.process_info),
            None => gpuvm.create_process_vm(gpu_id, st.pasid, st.process_info),
        };
        let attachment = attached.inspect_err(|e| {
            error!(gpu_id, error = %e, "failed to create process VM object");
        })?;

        st.pdds[idx].vm = Some(attachment.vm);
        st.process_info.get_or_insert(attachment.process_info);
        if let Some(fence) = attachment.fence {
            st.ef = Some(fence);
        }

        let mut result = self.reserve_ib_mem(idx);
        if result.is_ok() {
            result = self.init_cwsr_dgpu(idx);
        }
        if let Err(e) = result {
            self.free_bos(idx);
            if let Some(vm) = self.state.pdds[idx].vm.take() {
                if drm_file.is_none() {
                    gpuvm.destroy_process_vm(gpu_id, vm);
                }
            }
            return Err(e);
        }

        self.state.pdds[idx].drm_file = drm_file;
        Ok(())
    }

    fn reserve_ib_mem(&mut self, idx: usize) -> KfdResult<()> {
        let qpd = &self.state.pdds[idx].qpd;
        if qpd.ib_kaddr.is_some() || qpd.ib_base == 0 {
            return Ok(());
        }

        let base = qpd.ib_base;
        let flags = AllocFlags::new()
            .gtt()
            .no_substitute()
            .executable()
            .to_kfd_ioctl_flags();
        let (_, kaddr) = self.alloc_gpuvm(idx, base, PAGE_SIZE, flags)?;
        self.state.pdds[idx].qpd.ib_kaddr = Some(kaddr);
        Ok(())
    }

    /// Allocates, maps and records a kernel-owned buffer at a fixed GPU address, and maps
    /// it for kernel access. Returns the BO handle and the kernel address.
    pub(crate) fn alloc_gpuvm(
        &mut self,
        idx: usize,
        gpu_va: u64,
        size: u64,
        flags: u32,
    ) -> KfdResult<(u32, u64)> {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let st = &mut *self.state;
        let gpu_id = st.pdds[idx].gpu_id();
        let vm = st.pdds[idx]
            .vm
            .ok_or_else(|| KfdError::invalid(format!("gpu {gpu_id} has no VM")))?;

        let mem = gpuvm.alloc_memory_of_gpu(gpu_id, vm, gpu_va, size, flags)?;

        if let Err(e) = gpuvm.map_memory_to_gpu(gpu_id, mem, vm) {
            if let Err(free) = gpuvm.free_memory_of_gpu(gpu_id, mem) {
                warn!(gpu_id, error = %free, "failed to free GPU memory");
            }
            return Err(e);
        }
        if let Err(e) = gpuvm.sync_memory(gpu_id, mem, true) {
            debug!("sync memory failed, wait interrupted by user signal");
            free_gpuvm(gpuvm.as_ref(), gpu_id, mem, vm);
            return Err(e);
        }

        let handle =
            match st.bos.create_bo_handle(gpu_id, mem, gpu_va, size, 0, MemType::from_flags(flags)) {
                Ok(handle) => handle,
                Err(e) => {
                    free_gpuvm(gpuvm.as_ref(), gpu_id, mem, vm);
                    return Err(e);
                }
            };

        match gpuvm.map_gtt_bo_to_kernel(gpu_id, mem) {
            Ok(kaddr) => Ok((handle, kaddr)),
            Err(e) => {
                debug!("map GTT BO to kernel failed");
                st.bos.remove_bo_handle(gpu_id, handle);
                free_gpuvm(gpuvm.as_ref(), gpu_id, mem, vm);
                Err(e)
            }
        }
    }

    /// Frees every BO allocated on device `idx`, unmapping it from all VMs of the
    /// process first.
    fn free_bos(&mut self, idx: usize) {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let st = &mut *self.state;
        let gpu_id = st.pdds[idx].gpu_id();

        for handle in st.bos.handles_of(gpu_id) {
            let Some(mem) = st.bos.translate_handle(gpu_id, handle) else {
                continue;
            };
            for peer in &st.pdds {
                if let Some(vm) = peer.vm {
                    if let Err(e) = gpuvm.unmap_memory_from_gpu(peer.gpu_id(), mem, vm) {
                        debug!(gpu_id = peer.gpu_id(), handle, error = %e, "unmap before free failed");
                    }
                }
            }
            if let Err(e) = gpuvm.free_memory_of_gpu(gpu_id, mem) {
                warn!(gpu_id, handle, error = %e, "failed to free GPU memory");
            }
            st.bos.remove_bo_handle(gpu_id, handle);
        }

        let pdd = &mut st.pdds[idx];
        pdd.vram_usage = 0;
        pdd.qpd.ib_kaddr = None;
        if matches!(pdd.qpd.cwsr, Some(CwsrMemory::Gpuvm { .. })) {
            pdd.qpd.cwsr = None;
        }
    }

    pub(crate) fn free_outstanding_bos(&mut self, _scope: &ReleaseScope) {
        for idx in 0..self.state.pdds.len() {
            self.free_bos(idx);
        }
    }

    /// Returns every device resource of the process: VMs, CWSR pages, doorbell slices and
    /// power references.
    pub(crate) fn destroy_pdds(&mut self, _scope: &ReleaseScope) {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let pasid = self.pasid;

        for mut pdd in std::mem::take(&mut self.state.pdds) {
            let gpu_id = pdd.gpu_id();
            debug!(gpu_id, pasid, "releasing pdd");

            match (pdd.drm_file.take(), pdd.vm.take()) {
                (Some(file), Some(vm)) => gpuvm.release_process_vm(gpu_id, vm, file),
                (None, Some(vm)) => gpuvm.destroy_process_vm(gpu_id, vm),
                _ => {}
            }

            if matches!(pdd.qpd.cwsr, Some(CwsrMemory::Pages(_))) && pdd.qpd.cwsr_base == 0 {
                pdd.qpd.cwsr = None;
            }
            pdd.qpd.doorbell_bitmap = None;
            self.state.bos.drop_device(gpu_id);
            pdd.dev.doorbells().free_process_doorbells(pdd.doorbell_index);

            // The power reference was taken by the first successful bind.
            if pdd.runtime_inuse {
                let pm = pdd.dev.runtime_pm();
                pm.mark_last_busy();
                pm.put_autosuspend();
                pdd.runtime_inuse = false;
            }
        }
    }

    // -------------------------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------------------------

    /// Allocates user memory at `gpu_va` in the device VM and returns its handle.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the device has no VM yet or the range overlaps a BO
    /// already on the device, or the backend failure.
    pub fn alloc_memory_of_gpu(
        &mut self,
        gpu_id: GpuId,
        gpu_va: u64,
        size: u64,
        flags: u32,
    ) -> KfdResult<u32> {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let st = &mut *self.state;
        let idx = st.pdd_index(gpu_id).ok_or_else(|| missing_pdd(gpu_id))?;
        let vm = st.pdds[idx]
            .vm
            .ok_or_else(|| KfdError::invalid(format!("gpu {gpu_id} has no VM")))?;

        let mem_type = MemType::from_flags(flags);
        let mem = gpuvm.alloc_memory_of_gpu(gpu_id, vm, gpu_va, size, flags)?;
        let handle = match st.bos.create_bo_handle(gpu_id, mem, gpu_va, size, 0, mem_type) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(free) = gpuvm.free_memory_of_gpu(gpu_id, mem) {
                    warn!(gpu_id, error = %free, "failed to free GPU memory");
                }
                return Err(e);
            }
        };

        if mem_type.is_vram() {
            st.pdds[idx].vram_usage += size;
        }
        Ok(handle)
    }

    /// Frees a BO by handle. Mappings on other devices are the caller's to undo first.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown handle. On backend failure the handle
    /// stays valid.
    pub fn free_memory_of_gpu(&mut self, gpu_id: GpuId, handle: u32) -> KfdResult<()> {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let st = &mut *self.state;
        let bo = st
            .bos
            .find_bo(gpu_id, handle)
            .cloned()
            .ok_or_else(|| KfdError::invalid(format!("no BO {handle} on gpu {gpu_id}")))?;

        gpuvm.free_memory_of_gpu(gpu_id, bo.mem)?;
        st.bos.remove_bo_handle(gpu_id, handle);

        if bo.mem_type.is_vram() {
            if let Some(pdd) = st.pdd_mut(gpu_id) {
                pdd.vram_usage = pdd.vram_usage.saturating_sub(bo.size());
            }
        }
        Ok(())
    }

    /// Maps a BO of `gpu_id` into the VMs of `targets`, then flushes their TLBs.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an unknown handle or a target without a VM.
    pub fn map_memory_to_gpu(&mut self, gpu_id: GpuId, handle: u32, targets: &[GpuId]) -> KfdResult<()> {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let st = &*self.state;
        let mem = st
            .bos
            .translate_handle(gpu_id, handle)
            .ok_or_else(|| KfdError::invalid(format!("no BO {handle} on gpu {gpu_id}")))?;

        for &target in targets {
            let peer = st.pdd(target).ok_or_else(|| missing_pdd(target))?;
            let vm = peer
                .vm
                .ok_or_else(|| KfdError::invalid(format!("gpu {target} has no VM")))?;
            gpuvm.map_memory_to_gpu(target, mem, vm).inspect_err(|e| {
                error!(gpu_id = target, error = %e, "failed to map memory to gpu");
            })?;
        }

        gpuvm.sync_memory(gpu_id, mem, true)?;
        for &target in targets {
            st.flush_tlb(target)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns `InvalidArgument` for an unknown handle or a target without a VM.
    pub fn unmap_memory_from_gpu(
        &mut self,
        gpu_id: GpuId,
        handle: u32,
        targets: &[GpuId],
    ) -> KfdResult<()> {
        let gpuvm = self.process.kfd.gpuvm.clone();
        let st = &*self.state;
        let mem = st
            .bos
            .translate_handle(gpu_id, handle)
            .ok_or_else(|| KfdError::invalid(format!("no BO {handle} on gpu {gpu_id}")))?;

        for &target in targets {
            let vm = st
                .pdd(target)
                .and_then(|p| p.vm)
                .ok_or_else(|| KfdError::invalid(format!("gpu {target} has no VM")))?;
            gpuvm.unmap_memory_from_gpu(target, mem, vm)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Debug Trap
    // -------------------------------------------------------------------------------------------

    /// Enables the debug trap on `gpu_id`. `attach` is held until the trap is disabled
    /// at exit.
    ///
    /// # Errors
    /// Returns `Busy` if a debugger is already attached.
    pub fn attach_debug_trap(&mut self, gpu_id: GpuId, attach: ProcessRef) -> KfdResult<()> {
        let pdd = self.pdd_mut(gpu_id).ok_or_else(|| missing_pdd(gpu_id))?;
        if pdd.debug.enabled {
            return Err(KfdError::Busy);
        }
        pdd.debug.enabled = true;
        pdd.debug.attach_ref = Some(attach);
        Ok(())
    }

    /// # Errors
    /// Returns `InvalidArgument` if the debug trap is not enabled.
    pub fn set_wave_launch_mode(&mut self, gpu_id: GpuId, mode: u32) -> KfdResult<()> {
        let pdd = self.pdd_mut(gpu_id).ok_or_else(|| missing_pdd(gpu_id))?;
        if !pdd.debug.enabled {
            return Err(KfdError::invalid("debug trap is not enabled"));
        }
        pdd.dev
            .kfd2kgd()
            .set_wave_launch_mode(mode, pdd.dev.props().last_vmid_kfd);
        pdd.debug.wave_launch_mode = mode;
        Ok(())
    }

    /// # Errors
    /// Returns `InvalidArgument` if the debug trap is not enabled.
    pub fn set_debug_watch_points(&mut self, gpu_id: GpuId, mask: u32) -> KfdResult<()> {
        let pdd = self.pdd_mut(gpu_id).ok_or_else(|| missing_pdd(gpu_id))?;
        if !pdd.debug.enabled {
            return Err(KfdError::invalid("debug trap is not enabled"));
        }
        pdd.debug.watch_points |= mask;
        Ok(())
    }

    /// Disables every enabled debug trap and hands back the attach references. They must
    /// be dropped after the process lock is released.
    #[must_use]
    pub(crate) fn detach_debug_traps(&mut self, _scope: &NotifierScope) -> Vec<ProcessRef> {
        let mut refs = Vec::new();
        for pdd in &mut self.state.pdds {
            if !pdd.debug.enabled {
                continue;
            }
            let hooks = pdd.dev.kfd2kgd();
            let vmid = pdd.dev.props().last_vmid_kfd;

            if pdd.debug.watch_points != 0 {
                hooks.release_debug_watch_points(pdd.debug.watch_points);
                pdd.debug.watch_points = 0;
            }
            pdd.debug.enabled = false;
            hooks.disable_debug_trap(vmid);
            if pdd.debug.wave_launch_mode != 0 {
                hooks.set_wave_launch_mode(0, vmid);
                pdd.debug.wave_launch_mode = 0;
            }
            hooks.release_debug_trap_vmid();
            refs.extend(pdd.debug.attach_ref.take());
        }
        refs
    }

    // -------------------------------------------------------------------------------------------
    // Doorbells
    // -------------------------------------------------------------------------------------------

    /// Maps the process doorbell slice of `gpu_id` into the address space and returns the
    /// user address.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the address space is gone or the device is unknown.
    pub fn mmap_doorbells(&mut self, gpu_id: GpuId) -> KfdResult<u64> {
        let mm = self
            .mm()
            .ok_or_else(|| KfdError::invalid("address space is gone"))?;
        let pdd = self.pdd_mut(gpu_id).ok_or_else(|| missing_pdd(gpu_id))?;

        let _map = mm.mmap_lock.write();
        let addr = mm.vm_mmap(KFD_DOORBELL_PROCESS_SLICE_SIZE);
        pdd.qpd.doorbell_vma = Some(addr);
        pdd.qpd.doorbells_mapped = true;
        debug!(gpu_id, addr = format_args!("0x{addr:x}"), "mapped doorbells");
        Ok(addr)
    }
}
