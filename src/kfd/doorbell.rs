use crate::error::{KfdError, KfdResult};
use crate::kfd::device::DeviceProperties;
use crate::utils::{Bitmap, IdPool};
use parking_lot::Mutex;
use tracing::debug;

pub const KFD_MAX_NUM_OF_QUEUES_PER_PROCESS: usize = 1024;
/// Distance between a doorbell and its mirrored copy in the per-process doorbell page.
pub const KFD_QUEUE_DOORBELL_MIRROR_OFFSET: usize = 512;
/// Bytes of one process doorbell slice (1024 queues x 8-byte doorbells).
pub const KFD_DOORBELL_PROCESS_SLICE_SIZE: u64 = 8 * KFD_MAX_NUM_OF_QUEUES_PER_PROCESS as u64;

/// Doorbell slices of one device, one per attached process.
#[derive(Debug)]
pub struct DoorbellPool {
    slices: Mutex<IdPool>,
}

impl DoorbellPool {
    #[must_use]
    pub fn new(slices: usize) -> Self {
        Self {
            slices: Mutex::new(IdPool::with_capacity(slices)),
        }
    }

    /// Reserves the lowest free doorbell slice.
    ///
    /// # Errors
    /// Returns `ResourceExhausted` when every slice is in use.
    pub fn alloc_process_doorbells(&self) -> KfdResult<u32> {
        let index = self
            .slices
            .lock()
            .acquire(0)
            .ok_or(KfdError::ResourceExhausted("doorbell slices"))?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(index as u32)
    }

    pub fn free_process_doorbells(&self, index: u32) {
        self.slices.lock().release(index as usize);
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.slices.lock().in_use()
    }

    #[must_use]
    pub fn is_allocated(&self, index: u32) -> bool {
        self.slices.lock().is_used(index as usize)
    }
}

/// Builds the per-process doorbell bitmap, masking doorbells reserved for SDMA, IH and
/// VCN. Both a reserved doorbell and its mirror are masked. Returns `None` on ASICs
/// without reserved ranges.
#[must_use]
pub fn init_doorbell_bitmap(props: &DeviceProperties) -> Option<Bitmap> {
    if !props.soc15 {
        return None;
    }

    let start = props.non_cp_doorbells_start as usize;
    let end = props.non_cp_doorbells_end as usize;
    debug!("reserved doorbell 0x{start:03x} - 0x{end:03x}");
    debug!(
        "reserved doorbell 0x{:03x} - 0x{:03x}",
        start + KFD_QUEUE_DOORBELL_MIRROR_OFFSET,
        end + KFD_QUEUE_DOORBELL_MIRROR_OFFSET
    );

    let mut bitmap = Bitmap::new(KFD_MAX_NUM_OF_QUEUES_PER_PROCESS);
    for i in 0..KFD_MAX_NUM_OF_QUEUES_PER_PROCESS / 2 {
        if i >= start && i <= end {
            bitmap.set_bit(i);
            bitmap.set_bit(i + KFD_QUEUE_DOORBELL_MIRROR_OFFSET);
        }
    }
    Some(bitmap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_range_and_mirror_are_masked() {
        let props = DeviceProperties {
            non_cp_doorbells_start: 4,
            non_cp_doorbells_end: 7,
            ..DeviceProperties::default()
        };
        let bitmap = init_doorbell_bitmap(&props).unwrap();

        for i in 4..=7 {
            assert!(bitmap.test_bit(i));
            assert!(bitmap.test_bit(i + KFD_QUEUE_DOORBELL_MIRROR_OFFSET));
        }
        let low_half: Vec<_> = (0..KFD_MAX_NUM_OF_QUEUES_PER_PROCESS / 2)
            .filter(|&i| bitmap.test_bit(i))
            .collect();
        assert_eq!(low_half, vec![4, 5, 6, 7]);
        assert_eq!(bitmap.count_ones(), 8);
    }

    #[test]
    fn pre_soc15_has_no_bitmap() {
        let props = DeviceProperties {
            soc15: false,
            ..DeviceProperties::default()
        };
        assert!(init_doorbell_bitmap(&props).is_none());
    }

    #[test]
    fn pool_hands_out_lowest_slice() {
        let pool = DoorbellPool::new(2);
        assert_eq!(pool.alloc_process_doorbells().unwrap(), 0);
        assert_eq!(pool.alloc_process_doorbells().unwrap(), 1);
        assert!(matches!(
            pool.alloc_process_doorbells(),
            Err(KfdError::ResourceExhausted(_))
        ));
        pool.free_process_doorbells(0);
        assert_eq!(pool.alloc_process_doorbells().unwrap(), 0);
    }
}
