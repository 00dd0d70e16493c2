//! Per-operation block allocation context
//!
//! Every mutating `Afs` operation opens one journaled write and may need to
//! allocate or free several blocks within it (a head node, a chain of
//! directory-entry or file-data blocks, ...). `Alloc` bundles the free
//! list's in-memory state with the open `WriteBatch` so that allocation
//! prefers reusing a freed block over growing the store, exactly as
//! described for the free list in the data model.
use crate::error::AfsResult;
use crate::store::{BlockIndex, BlockStore, WriteBatch};

use super::chain::{decode_next, encode_next};

pub(crate) struct Alloc<'a> {
    max_nr_blocks: u64,
    nr_blocks: u64,
    free_head: Option<BlockIndex>,
    nr_free_blocks: u64,
    batch: &'a mut WriteBatch,
}

impl<'a> Alloc<'a> {
    pub(crate) fn new(
        batch: &'a mut WriteBatch,
        nr_blocks: u64,
        max_nr_blocks: u64,
        free_head: Option<BlockIndex>,
        nr_free_blocks: u64,
    ) -> Self {
        Alloc {
            max_nr_blocks,
            nr_blocks,
            free_head,
            nr_free_blocks,
            batch,
        }
    }

    /// Allocate a block holding `contents`, preferring the free list over
    /// growing the store.
    pub(crate) fn alloc<S: BlockStore>(&mut self, store: &S, contents: Vec<u8>) -> Result<BlockIndex, AfsResult> {
        if let Some(idx) = self.free_head {
            let raw = store.obtain_block(idx).map_err(|_| AfsResult::BlockIndexInvalid)?;
            let next = decode_next(&raw);
            self.batch.overwrite(idx, contents);
            self.free_head = next;
            self.nr_free_blocks -= 1;
            Ok(idx)
        } else if self.nr_blocks < self.max_nr_blocks {
            let idx = self.batch.add_new_block(contents);
            self.nr_blocks += 1;
            Ok(idx)
        } else {
            Err(AfsResult::OutOfSpace)
        }
    }

    /// Overwrite a block already known to exist (reusing part of an old
    /// chain in place), without touching free-list accounting.
    pub(crate) fn overwrite(&mut self, idx: BlockIndex, contents: Vec<u8>) {
        self.batch.overwrite(idx, contents);
    }

    /// Release a block back to the free list.
    pub(crate) fn free(&mut self, idx: BlockIndex, block_size: u32) {
        let mut contents = vec![0u8; block_size as usize];
        contents[..8].copy_from_slice(&encode_next(self.free_head));
        self.batch.overwrite(idx, contents);
        self.free_head = Some(idx);
        self.nr_free_blocks += 1;
    }

    /// Consume this context, returning the free list state to persist into
    /// the master block.
    pub(crate) fn into_free_state(self) -> (Option<BlockIndex>, u64) {
        (self.free_head, self.nr_free_blocks)
    }

    pub(crate) fn nr_blocks(&self) -> u64 {
        self.nr_blocks
    }
}
