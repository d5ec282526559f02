//! Buffer-object bookkeeping of one process.
//!
//! Every BO lives in two places: the handle table of the device it was allocated on and
//! the process-wide interval tree keyed by its GPU virtual address range. [`BoIndex`] owns
//! both so an entry is added to or removed from both at once.

use super::interval_tree::IntervalTree;
use crate::error::{KfdError, KfdResult};
use crate::kfd::device::{GpuId, MemHandle};
use crate::kfd::ioctl::MemType;
use crate::utils::IdPool;
use std::collections::{BTreeMap, HashMap};
use tracing::error;

const INITIAL_HANDLES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KfdBo {
    pub gpu_id: GpuId,
    pub handle: u32,
    pub mem: MemHandle,
    pub start: u64,
    /// Inclusive end address.
    pub last: u64,
    pub cpuva: u64,
    pub mem_type: MemType,
}

impl KfdBo {
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.last - self.start + 1
    }
}

#[derive(Debug)]
struct HandleTable {
    ids: IdPool,
    bos: BTreeMap<u32, KfdBo>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            ids: IdPool::with_capacity(INITIAL_HANDLES),
            bos: BTreeMap::new(),
        }
    }
}

/// Interval tree entries point back at `(gpu, handle)`.
type TreeRef = (GpuId, u32);

#[derive(Debug, Default)]
pub struct BoIndex {
    tables: HashMap<GpuId, HandleTable>,
    tree: IntervalTree<TreeRef>,
}

const fn tree_key(gpu_id: GpuId, handle: u32) -> u64 {
    ((gpu_id as u64) << 32) | handle as u64
}

impl BoIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a BO covering `[start, start + length)` and returns its handle.
    ///
    /// Each device has its own GPU address space, so two devices may place BOs at the
    /// same address; on one device a range belongs to at most one BO.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty or overflowing range, or one that overlaps
    /// a BO already recorded on `gpu_id`.
    pub fn create_bo_handle(
        &mut self,
        gpu_id: GpuId,
        mem: MemHandle,
        start: u64,
        length: u64,
        cpuva: u64,
        mem_type: MemType,
    ) -> KfdResult<u32> {
        if length == 0 {
            return Err(KfdError::invalid("zero-length buffer object"));
        }
        let last = start
            .checked_add(length - 1)
            .ok_or_else(|| KfdError::invalid(format!("range at 0x{start:x} overflows")))?;
        if self
            .tree
            .overlapping(start, last, usize::MAX)
            .iter()
            .any(|&&(gpu, _)| gpu == gpu_id)
        {
            return Err(KfdError::invalid(format!(
                "0x{start:x}-0x{last:x} overlaps a buffer on gpu {gpu_id}"
            )));
        }

        let table = self.tables.entry(gpu_id).or_default();
        let handle = u32::try_from(table.ids.acquire_growing(0))
            .map_err(|_| KfdError::ResourceExhausted("bo handles"))?;

        table.bos.insert(
            handle,
            KfdBo {
                gpu_id,
                handle,
                mem,
                start,
                last,
                cpuva,
                mem_type,
            },
        );
        self.tree
            .insert(start, last, tree_key(gpu_id, handle), (gpu_id, handle));
        Ok(handle)
    }

    #[must_use]
    pub fn find_bo(&self, gpu_id: GpuId, handle: u32) -> Option<&KfdBo> {
        self.tables.get(&gpu_id)?.bos.get(&handle)
    }

    #[must_use]
    pub fn translate_handle(&self, gpu_id: GpuId, handle: u32) -> Option<MemHandle> {
        self.find_bo(gpu_id, handle).map(|bo| bo.mem)
    }

    /// Drops a handle and its interval. Unknown handles are ignored.
    pub fn remove_bo_handle(&mut self, gpu_id: GpuId, handle: u32) -> Option<KfdBo> {
        let table = self.tables.get_mut(&gpu_id)?;
        let bo = table.bos.remove(&handle)?;
        table.ids.release(handle as usize);
        if self.tree.remove(bo.start, tree_key(gpu_id, handle)).is_none() {
            error!(gpu_id, handle, "interval missing for live BO handle");
        }
        Some(bo)
    }

    /// The single BO overlapping `[start, last]`, which must also contain the whole range.
    ///
    /// A range that only partly overlaps one BO is treated as unknown rather than
    /// resolved to that BO, so callers never act on memory outside the buffer.
    ///
    /// # Errors
    /// `NotFound` if no BO overlaps or the overlapping BO does not cover the range;
    /// `AmbiguousRange` if the range touches more than one BO.
    pub fn find_bo_by_interval(&self, start: u64, last: u64) -> KfdResult<&KfdBo> {
        if start > last {
            return Err(KfdError::invalid(format!(
                "inverted range 0x{start:x}-0x{last:x}"
            )));
        }

        let hits = self.tree.overlapping(start, last, 2);
        let (gpu_id, handle) = match hits.as_slice() {
            [] => {
                error!("0x{start:x}-0x{last:x} does not relate to an existing buffer");
                return Err(KfdError::NotFound);
            }
            [one] => **one,
            _ => {
                error!("0x{start:x}-0x{last:x} spans more than a single BO");
                return Err(KfdError::AmbiguousRange { start, last });
            }
        };

        let bo = self.find_bo(gpu_id, handle).ok_or(KfdError::NotFound)?;
        if bo.start > start || bo.last < last {
            return Err(KfdError::NotFound);
        }
        Ok(bo)
    }

    /// Live handles of one device, ascending.
    #[must_use]
    pub fn handles_of(&self, gpu_id: GpuId) -> Vec<u32> {
        self.tables
            .get(&gpu_id)
            .map(|t| t.bos.keys().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Forgets the handle table of a device once all of its BOs are gone.
    pub fn drop_device(&mut self, gpu_id: GpuId) {
        if self.tables.get(&gpu_id).is_some_and(|t| t.bos.is_empty()) {
            self.tables.remove(&gpu_id);
        }
    }
}
