//! Master block: block 0 of the logical Afs view.
use failure::{format_err, Error};
use serde_derive::{Deserialize, Serialize};

use crate::store::BlockIndex;

const MAGIC: &[u8; 4] = b"AfsM";
const VERSION: u32 = 1;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct MasterBlock {
    magic: [u8; 4],
    version: u32,
    pub block_size: u32,
    pub root_head_index: BlockIndex,
    pub free_list_head: Option<BlockIndex>,
    pub nr_free_blocks: u64,
}

impl MasterBlock {
    pub(crate) fn new(block_size: u32, root_head_index: BlockIndex) -> Self {
        MasterBlock {
            magic: *MAGIC,
            version: VERSION,
            block_size,
            root_head_index,
            free_list_head: None,
            nr_free_blocks: 0,
        }
    }

    pub(crate) fn encode(&self, block_size: usize) -> Result<Vec<u8>, Error> {
        let mut buf = bincode::serialize(self)?;
        if buf.len() > block_size {
            return Err(format_err!("master block does not fit in one block"));
        }
        buf.resize(block_size, 0);
        Ok(buf)
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Self, Error> {
        let block: MasterBlock = bincode::deserialize(raw)?;
        if &block.magic != MAGIC {
            return Err(format_err!("bad master block magic"));
        }
        if block.version != VERSION {
            return Err(format_err!("unsupported master block version {}", block.version));
        }
        Ok(block)
    }
}
