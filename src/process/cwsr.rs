//! Compute wave save/restore (CWSR) areas.
//!
//! Each process-device with CWSR enabled owns a two-page area: the trap handler (TBA)
//! followed by trap memory (TMA). On dGPUs it is a GTT buffer at a fixed address inside
//! the GPU VM; on APUs it is kernel pages mapped into the user address space.

use super::object::{ProcessGuard, ProcessState};
use crate::error::{KfdError, KfdResult};
use crate::kfd::aperture::{KFD_CWSR_TBA_TMA_SIZE, KFD_CWSR_TMA_OFFSET};
use crate::kfd::device::GpuId;
use crate::kfd::ioctl::AllocFlags;
use crate::kfd::qcm::CwsrMemory;
use tracing::{debug, error};

fn copy_isa(dst: &mut [u8], isa: &[u8]) {
    let n = isa.len().min(dst.len());
    dst[..n].copy_from_slice(&isa[..n]);
}

impl ProcessState {
    /// Backs the reserved-memory mapping of `gpu_id` with fresh kernel pages.
    ///
    /// # Errors
    /// Returns `InvalidArgument` unless `len` is exactly the TBA/TMA size and the process
    /// has data for the device.
    pub fn reserved_mem_mmap(&mut self, gpu_id: GpuId, len: u64) -> KfdResult<()> {
        if len != KFD_CWSR_TBA_TMA_SIZE {
            error!(len, "incorrect CWSR mapping size");
            return Err(KfdError::invalid(format!("CWSR mapping must be {KFD_CWSR_TBA_TMA_SIZE} bytes")));
        }
        let pdd = self
            .pdd_mut(gpu_id)
            .ok_or_else(|| KfdError::invalid(format!("process has no data for gpu {gpu_id}")))?;

        #[allow(clippy::cast_possible_truncation)]
        let pages = vec![0u8; len as usize].into_boxed_slice();
        pdd.qpd.cwsr = Some(CwsrMemory::Pages(pages));
        Ok(())
    }
}

impl ProcessGuard<'_> {
    /// Sets up the CWSR area of a dGPU process-device inside its VM.
    pub(crate) fn init_cwsr_dgpu(&mut self, idx: usize) -> KfdResult<()> {
        let pdd = &self.state.pdds[idx];
        let dev = pdd.dev.clone();
        if !dev.props().cwsr_enabled || pdd.qpd.cwsr.is_some() || pdd.qpd.cwsr_base == 0 {
            return Ok(());
        }

        let base = pdd.qpd.cwsr_base;
        let flags = AllocFlags::new()
            .gtt()
            .no_substitute()
            .executable()
            .read_only()
            .to_kfd_ioctl_flags();
        let (handle, kaddr) = self.alloc_gpuvm(idx, base, KFD_CWSR_TBA_TMA_SIZE, flags)?;

        self.process.kfd.gpuvm.write_kernel(kaddr, &dev.props().cwsr_isa);

        let qpd = &mut self.state.pdds[idx].qpd;
        qpd.cwsr = Some(CwsrMemory::Gpuvm { handle, kaddr });
        qpd.tba_addr = qpd.cwsr_base;
        qpd.tma_addr = qpd.tba_addr + KFD_CWSR_TMA_OFFSET;
        debug!(
            tba = format_args!("0x{:x}", qpd.tba_addr),
            tma = format_args!("0x{:x}", qpd.tma_addr),
            kaddr = format_args!("0x{kaddr:x}"),
            "set up CWSR area"
        );
        Ok(())
    }

    /// Maps a CWSR area into the address space for every APU process-device that needs
    /// one. Runs at most once per process.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the address space is gone or a mapping fails.
    pub fn init_cwsr_apu(&mut self) -> KfdResult<()> {
        if self.has_cwsr {
            return Ok(());
        }
        let mm = self
            .mm()
            .ok_or_else(|| KfdError::invalid("address space is gone"))?;

        for idx in 0..self.state.pdds.len() {
            let pdd = &self.state.pdds[idx];
            if !pdd.dev.props().cwsr_enabled || pdd.qpd.cwsr.is_some() || pdd.qpd.cwsr_base != 0 {
                continue;
            }
            let gpu_id = pdd.gpu_id();
            let dev = pdd.dev.clone();

            let mapped = {
                let _map = mm.mmap_lock.write();
                let addr = mm.vm_mmap(KFD_CWSR_TBA_TMA_SIZE);
                self.state
                    .reserved_mem_mmap(gpu_id, KFD_CWSR_TBA_TMA_SIZE)
                    .map(|()| addr)
            };

            let qpd = &mut self.state.pdds[idx].qpd;
            let tba = match mapped {
                Ok(addr) => addr,
                Err(e) => {
                    error!(gpu_id, error = %e, "failure to set tba address");
                    qpd.cwsr = None;
                    qpd.tba_addr = 0;
                    return Err(e);
                }
            };

            if let Some(CwsrMemory::Pages(pages)) = &mut qpd.cwsr {
                copy_isa(pages, &dev.props().cwsr_isa);
            }
            qpd.tba_addr = tba;
            qpd.tma_addr = tba + KFD_CWSR_TMA_OFFSET;
            debug!(
                gpu_id,
                tba = format_args!("0x{tba:x}"),
                tma = format_args!("0x{:x}", qpd.tma_addr),
                "set up APU CWSR area"
            );
        }

        self.has_cwsr = true;
        Ok(())
    }
}
