//! Block buffer pooling
//!
//! `BlockAllocator` reuses fixed-size block buffers across reads and writes
//! to reduce allocation churn. Every `BlockStore` implementation owns one.
use std::cell::RefCell;
use std::collections::VecDeque;

/// Upper bound on the number of idle buffers kept around; excess releases
/// are simply dropped.
const MAX_POOL_SIZE: usize = 64;

/// Pool of reusable, fixed-size block buffers.
#[derive(Debug)]
pub struct BlockAllocator {
    bytes_per_block: RefCell<Option<u32>>,
    pool: RefCell<VecDeque<Vec<u8>>>,
    nr_cache_hits: RefCell<u64>,
    nr_cache_misses: RefCell<u64>,
}

impl Default for BlockAllocator {
    fn default() -> Self {
        BlockAllocator {
            bytes_per_block: RefCell::new(None),
            pool: RefCell::new(VecDeque::new()),
            nr_cache_hits: RefCell::new(0),
            nr_cache_misses: RefCell::new(0),
        }
    }
}

impl BlockAllocator {
    /// Create an empty allocator. `set_bytes_per_block` must be called
    /// before the first `acquire`.
    pub fn new() -> Self {
        Self::default()
    }

    /// One-time configuration of the buffer size this allocator pools.
    pub fn set_bytes_per_block(&self, n: u32) {
        let mut bpb = self.bytes_per_block.borrow_mut();
        debug_assert!(bpb.is_none() || *bpb == Some(n), "block size changed after first use");
        *bpb = Some(n);
    }

    /// Obtain a buffer of exactly the configured size; contents are
    /// zeroed but otherwise undefined to the caller.
    pub fn acquire(&self) -> Vec<u8> {
        let size = self.bytes_per_block.borrow().unwrap_or(0) as usize;
        if let Some(mut buf) = self.pool.borrow_mut().pop_front() {
            *self.nr_cache_hits.borrow_mut() += 1;
            buf.clear();
            buf.resize(size, 0);
            buf
        } else {
            *self.nr_cache_misses.borrow_mut() += 1;
            vec![0u8; size]
        }
    }

    /// Return a buffer to the pool. Buffers beyond `MAX_POOL_SIZE` are
    /// simply dropped.
    pub fn release(&self, buf: Vec<u8>) {
        let mut pool = self.pool.borrow_mut();
        if pool.len() < MAX_POOL_SIZE {
            pool.push_back(buf);
        }
    }

    /// Number of `acquire` calls satisfied from the pool.
    pub fn nr_cache_hits(&self) -> u64 {
        *self.nr_cache_hits.borrow()
    }

    /// Number of `acquire` calls that allocated a fresh buffer.
    pub fn nr_cache_misses(&self) -> u64 {
        *self.nr_cache_misses.borrow()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffers() {
        let alloc = BlockAllocator::new();
        alloc.set_bytes_per_block(512);

        let buf = alloc.acquire();
        assert_eq!(buf.len(), 512);
        assert_eq!(alloc.nr_cache_misses(), 1);

        alloc.release(buf);

        let buf2 = alloc.acquire();
        assert_eq!(buf2.len(), 512);
        assert_eq!(alloc.nr_cache_hits(), 1);
    }

    #[test]
    fn pool_has_an_upper_bound() {
        let alloc = BlockAllocator::new();
        alloc.set_bytes_per_block(16);

        for _ in 0..(MAX_POOL_SIZE + 10) {
            alloc.release(vec![0u8; 16]);
        }

        assert!(alloc.pool.borrow().len() <= MAX_POOL_SIZE);
    }
}
