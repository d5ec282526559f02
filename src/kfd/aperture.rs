use crate::kfd::device::DeviceProperties;

pub const PAGE_SIZE: u64 = 4096;

/// Size of the trap handler (TBA) plus trap memory (TMA) area.
pub const KFD_CWSR_TBA_TMA_SIZE: u64 = PAGE_SIZE * 2;
pub const KFD_CWSR_TMA_OFFSET: u64 = PAGE_SIZE + 2048;

/// Start of the user part of the GPUVM aperture on dGPUs. The pages below hold the
/// CWSR area and the kernel IB.
pub const SVM_USER_BASE: u64 = KFD_CWSR_TBA_TMA_SIZE + 2 * PAGE_SIZE;
pub const SVM_CWSR_BASE: u64 = SVM_USER_BASE - KFD_CWSR_TBA_TMA_SIZE;
pub const SVM_IB_BASE: u64 = SVM_CWSR_BASE - PAGE_SIZE;

const LDS_APP_BASE_V9: u64 = 0x1 << 48;
const SCRATCH_APP_BASE_V9: u64 = 0x2 << 48;
const APP_LIMIT_MASK: u64 = 0xFFFF_FFFF;

/// An inclusive virtual address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aperture {
    pub base: u64,
    pub limit: u64,
}

impl Aperture {
    #[must_use]
    pub const fn new(base: u64, limit: u64) -> Self {
        Self { base, limit }
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr <= self.limit
    }
}

/// Apertures of one process on one device (GFX9 flat memory layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessApertures {
    pub lds: Aperture,
    pub scratch: Aperture,
    pub gpuvm: Aperture,
}

impl ProcessApertures {
    #[must_use]
    pub const fn for_device(props: &DeviceProperties) -> Self {
        let gpuvm_base = if props.dgpu { SVM_USER_BASE } else { PAGE_SIZE };

        Self {
            lds: Aperture::new(LDS_APP_BASE_V9, LDS_APP_BASE_V9 | APP_LIMIT_MASK),
            scratch: Aperture::new(SCRATCH_APP_BASE_V9, SCRATCH_APP_BASE_V9 | APP_LIMIT_MASK),
            gpuvm: Aperture::new(gpuvm_base, props.gpuvm_size.saturating_sub(1)),
        }
    }
}
