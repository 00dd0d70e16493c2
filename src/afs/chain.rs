//! Chained-block byte storage
//!
//! Directory entry lists and file data trees both need to store an
//! arbitrary-length byte buffer across however many blocks it takes. Both
//! use the same representation: a singly-linked chain of blocks where the
//! first 8 bytes of each block are the next-block pointer (0 = none, else
//! index+1) and the remainder holds payload bytes.
//!
//! This mirrors the free list's own "a released block's first word is the
//! next free index" rule (see `freelist.rs`) closely enough that both reuse
//! `encode_next`/`decode_next` here.
use std::convert::TryInto;

use crate::error::AfsResult;
use crate::store::{BlockIndex, BlockStore};

use super::alloc::Alloc;

pub(crate) const NEXT_LEN: usize = 8;

pub(crate) fn encode_next(next: Option<BlockIndex>) -> [u8; NEXT_LEN] {
    match next {
        Some(i) => (i + 1).to_le_bytes(),
        None => 0u64.to_le_bytes(),
    }
}

pub(crate) fn decode_next(bytes: &[u8]) -> Option<BlockIndex> {
    let raw = u64::from_le_bytes(bytes[..NEXT_LEN].try_into().unwrap());
    if raw == 0 {
        None
    } else {
        Some(raw - 1)
    }
}

/// Read back `len` bytes written by `write`, trimming the trailing pad on
/// the chain's last block.
pub(crate) fn read<S: BlockStore>(store: &S, head: BlockIndex, len: usize) -> Result<Vec<u8>, AfsResult> {
    let block_size = store.block_size() as usize;
    let chunk_len = block_size - NEXT_LEN;
    let mut out = Vec::with_capacity(len);
    let mut cur = Some(head);

    while out.len() < len {
        let idx = cur.ok_or(AfsResult::BlockIndexInvalid)?;
        let block = store.obtain_block(idx).map_err(|_| AfsResult::BlockIndexInvalid)?;
        let next = decode_next(&block);
        let take = chunk_len.min(len - out.len());
        out.extend_from_slice(&block[NEXT_LEN..NEXT_LEN + take]);
        cur = next;
    }

    Ok(out)
}

/// Walk an existing chain purely to collect its block indices, without
/// reading payload. Used when freeing or fully replacing a chain.
pub(crate) fn walk<S: BlockStore>(store: &S, head: Option<BlockIndex>) -> Result<Vec<BlockIndex>, AfsResult> {
    let mut indices = Vec::new();
    let mut cur = head;
    while let Some(idx) = cur {
        indices.push(idx);
        let block = store.obtain_block(idx).map_err(|_| AfsResult::BlockIndexInvalid)?;
        cur = decode_next(&block);
    }
    Ok(indices)
}

/// Replace the chain rooted at `old_head` (if any) with one holding
/// `payload`, reusing as many of the old chain's blocks as possible.
/// Returns the new chain's head block index. `payload` may be empty only if
/// the caller intends to represent "no chain" some other way; an empty
/// chain still costs one block here.
pub(crate) fn write<S: BlockStore>(
    store: &S,
    alloc: &mut Alloc,
    old_head: Option<BlockIndex>,
    payload: &[u8],
) -> Result<BlockIndex, AfsResult> {
    let block_size = store.block_size() as usize;
    let chunk_len = block_size - NEXT_LEN;
    let nr_chunks = if payload.is_empty() {
        1
    } else {
        (payload.len() + chunk_len - 1) / chunk_len
    };

    let mut reuse_pool = walk(store, old_head)?;

    let mut next_idx: Option<BlockIndex> = None;
    for chunk_i in (0..nr_chunks).rev() {
        let start = chunk_i * chunk_len;
        let end = (start + chunk_len).min(payload.len());

        let mut content = vec![0u8; block_size];
        content[..NEXT_LEN].copy_from_slice(&encode_next(next_idx));
        content[NEXT_LEN..NEXT_LEN + (end - start)].copy_from_slice(&payload[start..end]);

        let idx = if let Some(reuse_idx) = reuse_pool.pop() {
            alloc.overwrite(reuse_idx, content);
            reuse_idx
        } else {
            alloc.alloc(store, content)?
        };
        next_idx = Some(idx);
    }

    for idx in reuse_pool {
        alloc.free(idx, block_size as u32);
    }

    Ok(next_idx.expect("nr_chunks >= 1"))
}

/// Free every block of a chain, without writing a replacement.
pub(crate) fn free_all<S: BlockStore>(store: &S, alloc: &mut Alloc, head: Option<BlockIndex>) -> Result<(), AfsResult> {
    let block_size = store.block_size();
    for idx in walk(store, head)? {
        alloc.free(idx, block_size);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn round_trips_a_multi_block_payload() {
        let mut store = MemStore::new(32, 64);
        let mut batch = store.begin_journaled_write().unwrap();
        let mut alloc = Alloc::new(&mut batch, store.nr_blocks(), store.max_nr_blocks(), None, 0);

        let payload: Vec<u8> = (0u8..100).collect();
        let head = write(&store, &mut alloc, None, &payload).unwrap();
        let (free_head, nr_free) = alloc.into_free_state();
        store.complete_journaled_write(batch).unwrap();
        assert_eq!(free_head, None);
        assert_eq!(nr_free, 0);

        let back = read(&store, head, payload.len()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn shrinking_a_chain_frees_surplus_blocks() {
        let mut store = MemStore::new(32, 64);
        let mut batch = store.begin_journaled_write().unwrap();
        let mut alloc = Alloc::new(&mut batch, store.nr_blocks(), store.max_nr_blocks(), None, 0);
        let big: Vec<u8> = (0u8..200).collect();
        let head = write(&store, &mut alloc, None, &big).unwrap();
        let (free_head, nr_free) = alloc.into_free_state();
        store.complete_journaled_write(batch).unwrap();
        assert_eq!(free_head, None);
        assert_eq!(nr_free, 0);
        let nr_blocks_big = store.nr_blocks();

        let mut batch = store.begin_journaled_write().unwrap();
        let mut alloc = Alloc::new(&mut batch, store.nr_blocks(), store.max_nr_blocks(), None, 0);
        let small = vec![1u8; 5];
        let new_head = write(&store, &mut alloc, Some(head), &small).unwrap();
        let (free_head, nr_free) = alloc.into_free_state();
        store.complete_journaled_write(batch).unwrap();

        assert!(nr_free > 0);
        assert!(free_head.is_some());
        assert_eq!(store.nr_blocks(), nr_blocks_big);
        assert_eq!(read(&store, new_head, 5).unwrap(), small);
    }
}
