//! In-memory `BlockStore`
//!
//! Straightforward vector-of-buffers implementation, used as the reference
//! model that `FileStore` and `CryptStore` are tested against.
use failure::{format_err, Error};
use log::debug;

use super::{check_block_size, BlockAllocator, BlockIndex, BlockStore, WriteBatch};

/// In-memory implementation of [`BlockStore`], for tests and ephemeral use.
#[derive(Debug)]
pub struct MemStore {
    block_size: u32,
    max_nr_blocks: u64,
    blocks: Vec<Vec<u8>>,
    write_open: bool,
    allocator: BlockAllocator,
}

impl MemStore {
    /// Create an empty store with the given block size and block cap.
    pub fn new(block_size: u32, max_nr_blocks: u64) -> Self {
        let allocator = BlockAllocator::new();
        allocator.set_bytes_per_block(block_size);
        MemStore {
            block_size,
            max_nr_blocks,
            blocks: Vec::new(),
            write_open: false,
            allocator,
        }
    }
}

impl BlockStore for MemStore {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn max_nr_blocks(&self) -> u64 {
        self.max_nr_blocks
    }

    fn nr_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }

    fn allocator(&self) -> &BlockAllocator {
        &self.allocator
    }

    fn obtain_block(&self, idx: BlockIndex) -> Result<Vec<u8>, Error> {
        self.blocks
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| format_err!("block index {} invalid (nr_blocks={})", idx, self.nr_blocks()))
    }

    fn begin_journaled_write(&mut self) -> Result<WriteBatch, Error> {
        if self.write_open {
            return Err(format_err!("a journaled write is already open on this store"));
        }
        self.write_open = true;
        Ok(WriteBatch::new(self.nr_blocks()))
    }

    fn abort_journaled_write(&mut self, batch: WriteBatch) {
        debug!("aborting journaled write, discarding {} staged blocks", batch.nr_new_blocks());
        self.write_open = false;
    }

    fn complete_journaled_write(&mut self, batch: WriteBatch) -> Result<Vec<BlockIndex>, Error> {
        if !self.write_open {
            return Err(format_err!("complete_journaled_write called with no write open"));
        }

        if self.blocks.len() as u64 + batch.new_blocks.len() as u64 > self.max_nr_blocks {
            self.write_open = false;
            return Err(format_err!("OutOfSpace"));
        }

        for data in &batch.new_blocks {
            check_block_size(data, self.block_size)?;
        }
        for (idx, data) in &batch.overwrites {
            check_block_size(data, self.block_size)?;
            if *idx >= self.blocks.len() as u64 {
                self.write_open = false;
                return Err(format_err!("block index {} invalid", idx));
            }
        }

        let mut assigned = Vec::with_capacity(batch.new_blocks.len());
        for data in batch.new_blocks {
            assigned.push(self.blocks.len() as BlockIndex);
            self.blocks.push(data);
        }
        for (idx, data) in batch.overwrites {
            self.blocks[idx as usize] = data;
        }

        self.write_open = false;
        Ok(assigned)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn add_new_block_and_read_back() {
        init_logger();
        let mut store = MemStore::new(16, 4);
        let mut batch = store.begin_journaled_write().unwrap();
        let idx = batch.add_new_block(vec![0x42; 16]);
        store.complete_journaled_write(batch).unwrap();

        assert_eq!(idx, 0);
        assert_eq!(store.nr_blocks(), 1);
        assert_eq!(store.obtain_block(0).unwrap(), vec![0x42; 16]);
    }

    #[test]
    fn abort_discards_everything() {
        init_logger();
        let mut store = MemStore::new(16, 4);
        let mut batch = store.begin_journaled_write().unwrap();
        batch.add_new_block(vec![0x42; 16]);
        store.abort_journaled_write(batch);

        assert_eq!(store.nr_blocks(), 0);
    }

    #[test]
    fn second_open_write_is_rejected() {
        init_logger();
        let mut store = MemStore::new(16, 4);
        let _batch = store.begin_journaled_write().unwrap();
        assert!(store.begin_journaled_write().is_err());
    }

    #[test]
    fn out_of_space_is_reported() {
        init_logger();
        let mut store = MemStore::new(16, 1);
        let mut batch = store.begin_journaled_write().unwrap();
        batch.add_new_block(vec![0u8; 16]);
        batch.add_new_block(vec![0u8; 16]);
        assert!(store.complete_journaled_write(batch).is_err());
        assert_eq!(store.nr_blocks(), 0);
    }

    #[test]
    fn overwrite_existing_block() {
        init_logger();
        let mut store = MemStore::new(16, 4);
        let mut batch = store.begin_journaled_write().unwrap();
        batch.add_new_block(vec![0x11; 16]);
        store.complete_journaled_write(batch).unwrap();

        let mut batch = store.begin_journaled_write().unwrap();
        batch.overwrite(0, vec![0x22; 16]);
        store.complete_journaled_write(batch).unwrap();

        assert_eq!(store.obtain_block(0).unwrap(), vec![0x22; 16]);
    }

    #[test]
    fn bad_block_index_fails() {
        init_logger();
        let store = MemStore::new(16, 4);
        assert!(store.obtain_block(0).is_err());
    }
}
