//! Error taxonomy shared by all relay components.

use bitcoin::BlockHash;
use thiserror::Error;

/// An error that can occur while validating, storing or querying headers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Malformed header: expected {expected} bytes, got {got}")]
    MalformedHeader { expected: usize, got: usize },
    #[error("Header {0} does not satisfy its claimed proof-of-work target")]
    InvalidPoW(BlockHash),
    #[error("Compact target is invalid or above the pow limit: {0:#010x}")]
    InvalidTarget(u32),
    #[error("Header {0} does not link to the previous header in the batch")]
    BrokenLinkage(BlockHash),
    #[error("Difficulty change outside of a retarget boundary at height {0}")]
    UnexpectedRetarget(u64),
    #[error("Retarget bits mismatch at height {height}: expected {expected:#010x}, got {got:#010x}")]
    RetargetMismatch {
        height: u64,
        expected: u32,
        got: u32,
    },
    #[error("Retarget period spans {0} blocks, expected exactly one epoch")]
    NotExactlyOneEpoch(u64),
    #[error("Parent {0} is not a known chain node")]
    UnknownParent(BlockHash),
    #[error("Block {0} is not a known chain node")]
    UnknownBlock(BlockHash),
    #[error("Ancestor walk from {hash} fell off the stored horizon after {walked} hops")]
    UnknownAncestor { hash: BlockHash, walked: u64 },
    #[error("Fork point at height {fork_height} is below the liveness window (tip {tip_height})")]
    TooOldFork { fork_height: u64, tip_height: u64 },
    #[error("Height {height} is not finalized yet (tip {tip_height})")]
    NotFinalized { height: u64, tip_height: u64 },
    #[error("Height {0} predates the stored horizon")]
    TooOld(u64),
    #[error("Transaction id must not be all-zero")]
    ZeroTxid,
    #[error("Fee {paid} is below the required {required}")]
    InsufficientFee { paid: u64, required: u64 },
    #[error("Relay is paused")]
    Paused,
    #[error("Caller is not authorized for this operation")]
    Unauthorized,
    #[error("Bad genesis bootstrap: {0}")]
    BadGenesis(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
