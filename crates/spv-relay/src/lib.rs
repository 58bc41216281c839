//! Bitcoin header relay and SPV verification core.
//!
//! This crate tracks Bitcoin's best chain from submitted 80-byte headers:
//! proof-of-work and difficulty-retarget validation, multi-branch fork
//! tracking with bounded-depth reorg resolution, confirmation-based
//! finalization with sibling pruning, and merkle-proof transaction
//! inclusion checks gated by a congestion-priced query fee.

pub mod difficulty;
pub mod engine;
pub mod error;
pub mod fees;
pub mod finalize;
pub mod header;
pub mod inclusion;
pub mod params;
pub mod store;

pub use engine::{Authority, Relay, RelayEvent, RelayState};
pub use error::RelayError;
pub use fees::{FeeMeter, FeeParams, NullPayer, RewardPayer};
pub use header::HEADER_SIZE;
pub use params::NetworkParams;
pub use store::{ChainNode, ChainStore};
