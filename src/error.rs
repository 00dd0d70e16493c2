//! Error types
//!
//! AFS distinguishes two error classes. Operational outcomes (`NameExists`,
//! `OutOfSpace`, ...) are expected in normal use and ride the `Ok` variant of
//! a `Result` as an [`AfsResult`]. Integrity violations (a corrupted key
//! block, a free-list cycle, a MAC mismatch with the correct key) are
//! unrecoverable for the session and propagate as a plain `failure::Error`.
use failure::Fail;
use serde_derive::{Deserialize, Serialize};

/// Outcome of an Afs operation.
///
/// `Ok` means the operation fully succeeded. Every other variant is an
/// expected, recoverable outcome that the caller is meant to branch on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum AfsResult {
    /// The operation succeeded.
    Ok,
    /// A name already exists in the target directory.
    NameExists,
    /// The requested name is not present in the directory.
    NameNotInDir,
    /// The object id does not resolve to a live object.
    ObjNotFound,
    /// The destination of a move is invalid (e.g. a directory moved into its
    /// own descendant).
    MoveDestInvalid,
    /// A block index was out of range for the store.
    BlockIndexInvalid,
    /// The store has no room left to satisfy the request.
    OutOfSpace,
    /// CryptStore: the computed MAC did not match the stored MAC.
    MacMismatch,
    /// CryptStore: the key block signature did not match.
    SignatureMismatch,
    /// CryptStore: the key block prefix/payload version is unsupported.
    VersionMismatch,
}

impl AfsResult {
    /// True for the success variant.
    pub fn is_ok(self) -> bool {
        self == AfsResult::Ok
    }
}

/// Fatal, unrecoverable violations. Once one of these is produced, the
/// owning store or `Afs` must be considered poisoned.
#[derive(Debug, Fail)]
pub enum IntegrityError {
    /// A released block appeared on the free list more than once, or the
    /// list forms a cycle.
    #[fail(display = "free list integrity violation: {}", _0)]
    FreeList(String),
    /// A block index exceeded `NrBlocks()` where the caller believed
    /// otherwise.
    #[fail(display = "block index {} out of range (nr_blocks={})", index, nr_blocks)]
    BlockIndexOutOfRange {
        /// The offending index.
        index: u64,
        /// The store's block count at the time of the violation.
        nr_blocks: u64,
    },
    /// The on-disk key block or head node failed to parse.
    #[fail(display = "corrupt structure: {}", _0)]
    Corrupt(String),
    /// A MAC mismatch occurred while the access MAC key was known to be
    /// correct (i.e. after `Init` already succeeded).
    #[fail(display = "MAC mismatch on block {}", _0)]
    MacMismatch(u64),
}
