//! Object identity
//!
//! An [`ObjId`] is a 128-bit token generated fresh when an object is
//! created, plus an advisory block index that hints at where the object's
//! head node currently lives. Equality is by token only: the hint can go
//! stale after a move and must never be consulted for comparison.
use std::hash::{Hash, Hasher};

use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::BlockIndex;

/// The block index at which the root directory's head node always lives.
/// Block 0 is the master block, so the root head node is the first object
/// block allocated by `Init`.
pub const ROOT_HEAD_INDEX: BlockIndex = 1;

/// Globally unique object identity.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ObjId {
    token: u128,
    /// Advisory only; may be stale after a move.
    hint_index: BlockIndex,
}

impl ObjId {
    /// The sentinel identifying the root directory.
    pub fn root() -> Self {
        ObjId {
            token: 0,
            hint_index: ROOT_HEAD_INDEX,
        }
    }

    /// True if this is the root sentinel.
    pub fn is_root(self) -> bool {
        self.token == 0
    }

    /// Generate a fresh token for a newly-created object living at `index`.
    pub(crate) fn new(index: BlockIndex) -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        // Force the high bit so a freshly minted token can never collide
        // with the root sentinel's reserved token of 0.
        let token = Uuid::from_bytes(bytes).as_u128() | (1 << 127);
        ObjId {
            token,
            hint_index: index,
        }
    }

    /// The advisory block index. Always re-resolve via the directory tree
    /// before trusting this across a move.
    pub(crate) fn hint(self) -> BlockIndex {
        self.hint_index
    }

    pub(crate) fn with_hint(self, index: BlockIndex) -> Self {
        ObjId {
            token: self.token,
            hint_index: index,
        }
    }
}

impl PartialEq for ObjId {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for ObjId {}

impl Hash for ObjId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_is_stable() {
        assert_eq!(ObjId::root(), ObjId::root());
    }

    #[test]
    fn fresh_tokens_differ() {
        let a = ObjId::new(10);
        let b = ObjId::new(11);
        assert_ne!(a, b);
    }

    #[test]
    fn equality_ignores_hint() {
        let a = ObjId::new(10);
        let moved = a.with_hint(99);
        assert_eq!(a, moved);
    }
}
