//! Block storage abstraction
//!
//! `BlockStore` is the abstract interface implemented by [`MemStore`](mem::MemStore),
//! [`FileStore`](file::FileStore), and (composing another `BlockStore`) `CryptStore`.
//! It exposes read/write of fixed-size numbered blocks with journaled,
//! all-or-nothing multi-block writes.
pub mod allocator;
pub mod file;
pub mod mem;

pub use allocator::BlockAllocator;
pub use file::{Consistency, FileStore};
pub use mem::MemStore;

use failure::{format_err, Error};
use log::debug;

/// Zero-based index of a block within a store.
pub type BlockIndex = u64;

/// A batch of staged block mutations, opened by `begin_journaled_write` and
/// consumed by `complete_journaled_write`/`abort_journaled_write`.
///
/// This is the Rust realization of the "write-scope handle" suggested by the
/// design notes: a block can only be mutated through the batch that is
/// currently open, and the batch's lifetime *is* the scope. There is no
/// separate weak change-tracker pointer to manage, because the type system
/// already prevents a `WriteBatch` from outliving (or being used outside)
/// the write it belongs to.
#[derive(Debug, Default)]
pub struct WriteBatch {
    base_nr_blocks: BlockIndex,
    new_blocks: Vec<Vec<u8>>,
    overwrites: Vec<(BlockIndex, Vec<u8>)>,
}

impl WriteBatch {
    pub(crate) fn new(base_nr_blocks: BlockIndex) -> Self {
        WriteBatch {
            base_nr_blocks,
            new_blocks: Vec::new(),
            overwrites: Vec::new(),
        }
    }

    /// Stage a new, fully-populated block. Returns the index it will have
    /// once this batch commits.
    pub fn add_new_block(&mut self, contents: Vec<u8>) -> BlockIndex {
        let idx = self.base_nr_blocks + self.new_blocks.len() as BlockIndex;
        debug!("staging new block {}", idx);
        self.new_blocks.push(contents);
        idx
    }

    /// Stage an overwrite of an existing block.
    pub fn overwrite(&mut self, idx: BlockIndex, contents: Vec<u8>) {
        debug!("staging overwrite of block {}", idx);
        self.overwrites.push((idx, contents));
    }

    /// Number of blocks this batch would add if committed.
    pub fn nr_new_blocks(&self) -> usize {
        self.new_blocks.len()
    }
}

/// Abstract persistence layer providing journaled multi-block atomic
/// writes over fixed-size blocks.
pub trait BlockStore {
    /// Constant block size in bytes, for the store's lifetime.
    fn block_size(&self) -> u32;

    /// Hard cap on the number of blocks (may be `u64::max_value()`).
    fn max_nr_blocks(&self) -> u64;

    /// Current number of blocks.
    fn nr_blocks(&self) -> u64;

    /// The store's block buffer allocator.
    fn allocator(&self) -> &BlockAllocator;

    /// Read-access to a block. Fails with a `BlockIndexInvalid`-flavored
    /// error if `idx` is out of range.
    fn obtain_block(&self, idx: BlockIndex) -> Result<Vec<u8>, Error>;

    /// Open a journaled write. Exactly one may be open at a time; opening a
    /// second before the first completes or aborts is a programming error
    /// and returns an error rather than panicking.
    fn begin_journaled_write(&mut self) -> Result<WriteBatch, Error>;

    /// Discard a batch's staged changes. No block in `batch` becomes
    /// visible.
    fn abort_journaled_write(&mut self, batch: WriteBatch);

    /// Atomically publish every staged change in `batch`. Returns the
    /// indices assigned to blocks added via `WriteBatch::add_new_block`, in
    /// the order they were staged.
    fn complete_journaled_write(&mut self, batch: WriteBatch) -> Result<Vec<BlockIndex>, Error>;
}

pub(crate) fn check_block_size(data: &[u8], block_size: u32) -> Result<(), Error> {
    if data.len() != block_size as usize {
        return Err(format_err!(
            "block contents must be exactly {} bytes, got {}",
            block_size,
            data.len()
        ));
    }
    Ok(())
}
