const BITS_PER_WORD: usize = u64::BITS as usize;

/// Fixed-size bit vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    #[must_use]
    pub fn new(nbits: usize) -> Self {
        Self {
            words: vec![0; nbits.div_ceil(BITS_PER_WORD)],
            nbits,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.nbits
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    /// # Panics
    /// Panics if `index` is out of range.
    pub fn set_bit(&mut self, index: usize) {
        assert!(index < self.nbits, "bit {index} out of range");
        self.words[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
    }

    /// # Panics
    /// Panics if `index` is out of range.
    pub fn clear_bit(&mut self, index: usize) {
        assert!(index < self.nbits, "bit {index} out of range");
        self.words[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
    }

    #[must_use]
    pub fn test_bit(&self, index: usize) -> bool {
        index < self.nbits && self.words[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    /// Index of the first set bit at or after `start`.
    #[must_use]
    pub fn next_bit(&self, start: usize) -> Option<usize> {
        (start..self.nbits).find(|&i| self.test_bit(i))
    }

    /// Index of the first clear bit at or after `start`.
    #[must_use]
    pub fn next_zero_bit(&self, start: usize) -> Option<usize> {
        let mut i = start;
        while i < self.nbits {
            let word = self.words[i / BITS_PER_WORD];
            if word == u64::MAX && i % BITS_PER_WORD == 0 {
                i += BITS_PER_WORD;
                continue;
            }
            if word & (1 << (i % BITS_PER_WORD)) == 0 {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Extends the bitmap to `nbits`; new bits start clear. Never shrinks.
    pub fn grow(&mut self, nbits: usize) {
        if nbits <= self.nbits {
            return;
        }
        self.words.resize(nbits.div_ceil(BITS_PER_WORD), 0);
        self.nbits = nbits;
    }
}

/// Lowest-free-id allocator backed by a [`Bitmap`].
#[derive(Debug, Clone)]
pub struct IdPool {
    map: Bitmap,
}

impl IdPool {
    #[must_use]
    pub fn with_capacity(num_ids: usize) -> Self {
        Self {
            map: Bitmap::new(num_ids),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.map.len()
    }

    /// Claims the lowest unused id that is `>= min`.
    pub fn acquire(&mut self, min: usize) -> Option<usize> {
        let id = self.map.next_zero_bit(min)?;
        self.map.set_bit(id);
        Some(id)
    }

    /// Claims a specific id; returns `false` if it is taken or out of range.
    pub fn acquire_exact(&mut self, id: usize) -> bool {
        if id >= self.map.len() || self.map.test_bit(id) {
            return false;
        }
        self.map.set_bit(id);
        true
    }

    /// Like [`IdPool::acquire`], doubling the capacity instead of failing when full.
    pub fn acquire_growing(&mut self, min: usize) -> usize {
        if let Some(id) = self.acquire(min) {
            return id;
        }
        let id = self.map.len().max(min);
        self.map.grow((id + 1).max(self.map.len() * 2));
        self.map.set_bit(id);
        id
    }

    pub fn release(&mut self, id: usize) {
        if id < self.map.len() {
            self.map.clear_bit(id);
        }
    }

    #[must_use]
    pub fn is_used(&self, id: usize) -> bool {
        self.map.test_bit(id)
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.map.count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_zero_bit_skips_full_words() {
        let mut map = Bitmap::new(130);
        for i in 0..129 {
            map.set_bit(i);
        }
        assert_eq!(map.next_zero_bit(0), Some(129));
        assert_eq!(map.count_ones(), 129);
        map.clear_bit(64);
        assert_eq!(map.next_zero_bit(3), Some(64));
        assert_eq!(map.next_bit(64), Some(65));
    }

    #[test]
    fn id_pool_reuses_lowest_released_id() {
        let mut pool = IdPool::with_capacity(4);
        assert_eq!(pool.acquire(1), Some(1));
        assert_eq!(pool.acquire(1), Some(2));
        assert_eq!(pool.acquire(1), Some(3));
        assert_eq!(pool.acquire(1), None);

        pool.release(2);
        assert_eq!(pool.acquire(1), Some(2));
        assert!(!pool.acquire_exact(3));
        assert!(pool.acquire_exact(0));
        assert_eq!(pool.in_use(), 4);
    }

    #[test]
    fn growing_pool_never_runs_out() {
        let mut pool = IdPool::with_capacity(2);
        let ids: Vec<_> = (0..5).map(|_| pool.acquire_growing(0)).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(pool.capacity() >= 5);
        pool.release(1);
        assert_eq!(pool.acquire_growing(0), 1);
    }
}
