// ===============================================================================================
// Queue Types
// ===============================================================================================

pub const KFD_IOC_QUEUE_TYPE_COMPUTE: u32 = 0x0;
pub const KFD_IOC_QUEUE_TYPE_SDMA: u32 = 0x1;
pub const KFD_IOC_QUEUE_TYPE_COMPUTE_AQL: u32 = 0x2;
pub const KFD_IOC_QUEUE_TYPE_SDMA_XGMI: u32 = 0x3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Compute,
    Sdma,
    ComputeAql,
    SdmaXgmi,
}

impl QueueType {
    #[must_use]
    pub const fn is_sdma(self) -> bool {
        matches!(self, Self::Sdma | Self::SdmaXgmi)
    }

    #[must_use]
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Compute => KFD_IOC_QUEUE_TYPE_COMPUTE,
            Self::Sdma => KFD_IOC_QUEUE_TYPE_SDMA,
            Self::ComputeAql => KFD_IOC_QUEUE_TYPE_COMPUTE_AQL,
            Self::SdmaXgmi => KFD_IOC_QUEUE_TYPE_SDMA_XGMI,
        }
    }
}

// ===============================================================================================
// Memory Allocation Flags
// ===============================================================================================

pub const KFD_IOC_ALLOC_MEM_FLAGS_VRAM: u32 = 1 << 0;
pub const KFD_IOC_ALLOC_MEM_FLAGS_GTT: u32 = 1 << 1;
pub const KFD_IOC_ALLOC_MEM_FLAGS_USERPTR: u32 = 1 << 2;
pub const KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL: u32 = 1 << 3;
pub const KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP: u32 = 1 << 4;
pub const KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE: u32 = 1 << 31;
pub const KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE: u32 = 1 << 30;
pub const KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC: u32 = 1 << 29;
pub const KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE: u32 = 1 << 28;
pub const KFD_IOC_ALLOC_MEM_FLAGS_COHERENT: u32 = 1 << 26;

/// Bits that select the memory domain of an allocation.
pub const KFD_IOC_ALLOC_MEM_TYPE_MASK: u32 = KFD_IOC_ALLOC_MEM_FLAGS_VRAM
    | KFD_IOC_ALLOC_MEM_FLAGS_GTT
    | KFD_IOC_ALLOC_MEM_FLAGS_USERPTR
    | KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL
    | KFD_IOC_ALLOC_MEM_FLAGS_MMIO_REMAP;

/// Memory domain of a buffer object, as recorded in the handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemType(u32);

impl MemType {
    #[must_use]
    pub const fn from_flags(flags: u32) -> Self {
        Self(flags & KFD_IOC_ALLOC_MEM_TYPE_MASK)
    }

    #[must_use]
    pub const fn is_vram(self) -> bool {
        self.0 & KFD_IOC_ALLOC_MEM_FLAGS_VRAM != 0
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Flags controlling memory allocation behavior.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    pub vram: bool,
    pub gtt: bool,
    pub doorbell: bool,
    pub host_access: bool,
    pub read_only: bool,
    pub execute_access: bool,
    pub coherent: bool,
    pub no_substitute: bool,
}

impl AllocFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn vram(mut self) -> Self {
        self.vram = true;
        self
    }

    #[must_use]
    pub const fn gtt(mut self) -> Self {
        self.gtt = true;
        self
    }

    #[must_use]
    pub const fn doorbell(mut self) -> Self {
        self.doorbell = true;
        self
    }

    #[must_use]
    pub const fn host_access(mut self) -> Self {
        self.host_access = true;
        self
    }

    #[must_use]
    pub const fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub const fn executable(mut self) -> Self {
        self.execute_access = true;
        self
    }

    #[must_use]
    pub const fn coherent(mut self) -> Self {
        self.coherent = true;
        self
    }

    #[must_use]
    pub const fn no_substitute(mut self) -> Self {
        self.no_substitute = true;
        self
    }

    /// Converts high-level flags into the raw bitmask understood by the GPU-VM backend.
    #[must_use]
    pub const fn to_kfd_ioctl_flags(self) -> u32 {
        let mut ioc_flags = 0;

        if self.vram {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_VRAM;
        }
        if self.gtt {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_GTT;
        }
        if self.doorbell {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_DOORBELL;
        }
        if self.host_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_PUBLIC;
        }
        // WRITABLE is needed unless ReadOnly is explicit.
        if !self.read_only {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_WRITABLE;
        }
        if self.execute_access {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_EXECUTABLE;
        }
        if self.coherent {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_COHERENT;
        }
        if self.no_substitute {
            ioc_flags |= KFD_IOC_ALLOC_MEM_FLAGS_NO_SUBSTITUTE;
        }

        ioc_flags
    }
}
