//! Head nodes: one per live object (directory or file).
use failure::{format_err, Error};
use serde_derive::{Deserialize, Serialize};

use crate::id::ObjId;
use crate::store::BlockIndex;
use crate::time::AfsTime;

/// Whether an object is a directory or a file.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ObjType {
    Dir,
    File,
}

/// Where a directory's entry list currently lives. Mirrors `FileBody`: small
/// entry lists are serialized directly into the head node; once that no
/// longer fits, they move to an external chain.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) enum DirBody {
    /// Entries serialized inline in the head node.
    Inline(Vec<u8>),
    /// Entries in an external chain; `len` is the exact serialized byte
    /// length, so the last chain block's zero padding can be trimmed on
    /// read.
    Chain { chain_head: BlockIndex, len: u64 },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct DirHead {
    pub body: DirBody,
    pub entry_count: u64,
}

impl Default for DirHead {
    fn default() -> Self {
        DirHead {
            body: DirBody::Inline(Vec::new()),
            entry_count: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) enum FileBody {
    /// Data stored directly in the head node.
    Mini(Vec<u8>),
    /// Data stored in an external chain of blocks, rooted here.
    Tree { chain_head: BlockIndex },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct FileHead {
    pub size: u64,
    pub body: FileBody,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) enum Kind {
    Dir(DirHead),
    File(FileHead),
}

/// An object's metadata and type-specific fields.
///
/// Encoded directly into one block via `bincode`; `metadata` is an opaque
/// caller-supplied blob (AFS does not interpret it), so the head node's
/// capacity for it shrinks as `name` grows.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct HeadNode {
    pub parent: ObjId,
    pub name: String,
    pub metadata: Vec<u8>,
    pub create_time: AfsTime,
    pub modify_time: AfsTime,
    pub kind: Kind,
}

impl HeadNode {
    pub(crate) fn obj_type(&self) -> ObjType {
        match self.kind {
            Kind::Dir(_) => ObjType::Dir,
            Kind::File(_) => ObjType::File,
        }
    }

    pub(crate) fn as_dir(&self) -> Option<&DirHead> {
        match &self.kind {
            Kind::Dir(d) => Some(d),
            Kind::File(_) => None,
        }
    }

    pub(crate) fn as_dir_mut(&mut self) -> Option<&mut DirHead> {
        match &mut self.kind {
            Kind::Dir(d) => Some(d),
            Kind::File(_) => None,
        }
    }

    pub(crate) fn as_file(&self) -> Option<&FileHead> {
        match &self.kind {
            Kind::File(f) => Some(f),
            Kind::Dir(_) => None,
        }
    }

    pub(crate) fn as_file_mut(&mut self) -> Option<&mut FileHead> {
        match &mut self.kind {
            Kind::File(f) => Some(f),
            Kind::Dir(_) => None,
        }
    }

    pub(crate) fn encode(&self, block_size: usize) -> Result<Vec<u8>, Error> {
        let mut buf = bincode::serialize(self)?;
        if buf.len() > block_size {
            return Err(format_err!("head node does not fit in one block ({} > {})", buf.len(), block_size));
        }
        buf.resize(block_size, 0);
        Ok(buf)
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Self, Error> {
        Ok(bincode::deserialize(raw)?)
    }
}
