//! A circular temporary-buffer allocator: bytes are handed out from `tail` and reclaimed from
//! `head`, strictly in allocation order. One of these backs the global pinned-host slab and one
//! backs each `(gpu driver, device)` pair the progress engine has touched.

pub const DEFAULT_SLAB_SIZE: usize = 16 * 1024 * 1024;

pub struct SlabRing {
    capacity: usize,
    head: usize,
    tail: usize,
    used: usize,
}

impl SlabRing {
    pub fn new(capacity: usize) -> Self {
        SlabRing {
            capacity,
            head: 0,
            tail: 0,
            used: 0,
        }
    }

    /// Hands out the largest contiguous span available right now, capped at `max_len` bytes.
    /// `None` if the ring has no room at all (either genuinely full, or the next contiguous run
    /// is zero-length because `tail` sits at the wrap point — the caller retries next poke once
    /// `retire` has made room).
    pub fn try_alloc(&mut self, max_len: usize) -> Option<(usize, usize)> {
        let len = self.peek_alloc_len(max_len);
        if len == 0 {
            return None;
        }
        let offset = self.tail;
        self.tail = (self.tail + len) % self.capacity;
        self.used += len;
        Some((offset, len))
    }

    /// Computes how many bytes `try_alloc(max_len)` would hand out right now, without mutating
    /// the ring. Lets a caller that needs capacity on more than one ring at once (a device slab
    /// and a host slab for the same chunk) settle on a common element count before committing to
    /// either allocation.
    pub fn peek_alloc_len(&self, max_len: usize) -> usize {
        if self.capacity == 0 || max_len == 0 || self.used == self.capacity {
            return 0;
        }
        let free = self.capacity - self.used;
        let until_wrap = self.capacity - self.tail;
        free.min(until_wrap).min(max_len)
    }

    /// Releases `len` bytes from the head. Callers must retire allocations in the exact order
    /// they were handed out — this is what makes the ring's bookkeeping a plain pair of offsets
    /// instead of a free list.
    ///
    /// When this retirement empties the ring, `head`/`tail` both reset to `0` rather than sitting
    /// wherever they happened to wrap to — spec.md §8 makes this an explicit testable property
    /// ("at any quiescent moment both head_offset == 0 and tail_offset == 0"), and it keeps the
    /// ring's usable contiguous run at its full capacity the instant nothing is in flight, instead
    /// of fragmenting around whatever offset the last chunk ended at.
    pub fn retire(&mut self, len: usize) {
        debug_assert!(len <= self.used);
        self.head = (self.head + len) % self.capacity.max(1);
        self.used -= len;
        if self.used == 0 {
            self.head = 0;
            self.tail = 0;
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.used == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_retire_round_trips_to_quiescent() {
        let mut ring = SlabRing::new(16);
        let (off, len) = ring.try_alloc(10).unwrap();
        assert_eq!((off, len), (0, 10));
        assert!(!ring.is_quiescent());
        ring.retire(10);
        assert!(ring.is_quiescent());
        assert_eq!(ring.head, 0);
        assert_eq!(ring.tail, 0);
    }

    #[test]
    fn allocation_caps_at_contiguous_run_before_wrap() {
        let mut ring = SlabRing::new(16);
        let (first_off, _) = ring.try_alloc(12).unwrap();
        let (second_off, second_len) = ring.try_alloc(10).unwrap();
        // The first allocation's tail sits at 12; only 4 bytes are contiguous before wrapping,
        // even though 10 were requested and the ring has 4 bytes of capacity left overall.
        assert_eq!((first_off, second_off, second_len), (0, 12, 4));
    }

    #[test]
    fn retiring_to_empty_resets_head_and_tail_to_zero() {
        let mut ring = SlabRing::new(16);
        ring.try_alloc(12).unwrap();
        ring.retire(12);
        assert_eq!((ring.head, ring.tail), (0, 0));
        // With the ring reset, the next allocation can use the full capacity again rather than
        // being capped by where the previous tail happened to wrap.
        let (off, len) = ring.try_alloc(16).unwrap();
        assert_eq!((off, len), (0, 16));
    }

    #[test]
    fn peek_does_not_mutate() {
        let mut ring = SlabRing::new(16);
        assert_eq!(ring.peek_alloc_len(10), 10);
        assert_eq!(ring.peek_alloc_len(10), 10);
        assert!(ring.is_quiescent());
    }

    #[test]
    fn full_ring_refuses_allocation() {
        let mut ring = SlabRing::new(8);
        ring.try_alloc(8).unwrap();
        assert!(ring.try_alloc(1).is_none());
    }
}
