use crate::config::MAX_PASID_BITS;
use crate::error::{KfdError, KfdResult};
use crate::utils::IdPool;
use parking_lot::Mutex;

pub type Pasid = u32;

/// Process address space IDs. PASID 0 is never handed out.
#[derive(Debug)]
pub struct PasidAllocator {
    pool: Mutex<IdPool>,
}

impl PasidAllocator {
    /// Allocator over `1..2^bits`, with `bits` capped at `MAX_PASID_BITS`.
    #[must_use]
    pub fn new(bits: u32) -> Self {
        Self {
            pool: Mutex::new(IdPool::with_capacity(1usize << bits.min(MAX_PASID_BITS))),
        }
    }

    /// # Errors
    /// Returns `ResourceExhausted` once every PASID is taken.
    pub fn alloc(&self) -> KfdResult<Pasid> {
        let id = self
            .pool
            .lock()
            .acquire(1)
            .ok_or(KfdError::ResourceExhausted("pasid"))?;
        #[allow(clippy::cast_possible_truncation)]
        Ok(id as Pasid)
    }

    pub fn free(&self, pasid: Pasid) {
        self.pool.lock().release(pasid as usize);
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.pool.lock().in_use()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasid_zero_is_reserved() {
        let pasids = PasidAllocator::new(2);
        assert_eq!(pasids.alloc().unwrap(), 1);
        assert_eq!(pasids.alloc().unwrap(), 2);
        assert_eq!(pasids.alloc().unwrap(), 3);
        assert!(pasids.alloc().is_err());
        pasids.free(2);
        assert_eq!(pasids.alloc().unwrap(), 2);
        assert_eq!(pasids.in_use(), 3);
    }
}
