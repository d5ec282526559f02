use crate::kfd::device::GpuId;
use crate::kfd::ioctl::QueueType;
use crate::kfd::pasid::Pasid;
use crate::utils::Bitmap;

/// User-mode queue as seen by the queue manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueProperties {
    pub queue_id: u32,
    pub queue_type: QueueType,
    pub queue_address: u64,
    pub queue_size: u64,
    /// User address of the read pointer. SDMA queues keep their activity counter in the
    /// following 64-bit word.
    pub read_ptr: u64,
    pub write_ptr: u64,
}

impl QueueProperties {
    #[must_use]
    pub const fn new(queue_type: QueueType, queue_address: u64, queue_size: u64) -> Self {
        Self {
            queue_id: 0,
            queue_type,
            queue_address,
            queue_size,
            read_ptr: 0,
            write_ptr: 0,
        }
    }

    #[must_use]
    pub const fn read_ptr(mut self, addr: u64) -> Self {
        self.read_ptr = addr;
        self
    }

    #[must_use]
    pub const fn write_ptr(mut self, addr: u64) -> Self {
        self.write_ptr = addr;
        self
    }

    /// Address of the SDMA activity counter.
    #[must_use]
    pub const fn sdma_counter_addr(&self) -> u64 {
        self.read_ptr + 8
    }
}

/// Context-save-area backing of one process-device.
#[derive(Debug)]
pub enum CwsrMemory {
    /// GTT buffer allocated inside the GPU VM and mapped for kernel access.
    Gpuvm { handle: u32, kaddr: u64 },
    /// Kernel pages handed to user space through the reserved-memory mmap.
    Pages(Box<[u8]>),
}

/// Per process-device state shared with the device queue manager.
#[derive(Debug)]
pub struct QcmProcessDevice {
    pub pasid: Pasid,
    pub gpu_id: GpuId,
    pub queues: Vec<QueueProperties>,
    /// `None` on ASICs without reserved doorbell ranges.
    pub doorbell_bitmap: Option<Bitmap>,
    /// Fixed CWSR and IB virtual addresses; zero on APUs.
    pub cwsr_base: u64,
    pub ib_base: u64,
    pub cwsr: Option<CwsrMemory>,
    pub ib_kaddr: Option<u64>,
    pub tba_addr: u64,
    pub tma_addr: u64,
    pub vmid: u32,
    /// User mapping of the doorbell slice, once user space has mapped it.
    pub doorbell_vma: Option<u64>,
    pub doorbells_mapped: bool,
}

impl QcmProcessDevice {
    #[must_use]
    pub const fn new(pasid: Pasid, gpu_id: GpuId, doorbell_bitmap: Option<Bitmap>) -> Self {
        Self {
            pasid,
            gpu_id,
            queues: Vec::new(),
            doorbell_bitmap,
            cwsr_base: 0,
            ib_base: 0,
            cwsr: None,
            ib_kaddr: None,
            tba_addr: 0,
            tma_addr: 0,
            vmid: 0,
            doorbell_vma: None,
            doorbells_mapped: false,
        }
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}
