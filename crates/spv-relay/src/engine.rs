//! Relay engine: batch header submission, fork policy and admin surface.
//!
//! The engine is a single-writer state machine. Every mutating call either
//! fully validates and commits, or fails before touching any state; a batch
//! is never partially admitted.

use bitcoin::block::Header;
use bitcoin::BlockHash;
use serde::Serialize;
use tracing::{debug, info};

use crate::difficulty::{check_pow, pow_value, validate_retarget};
use crate::error::RelayError;
use crate::fees::{FeeMeter, FeeParams, RewardPayer};
use crate::header::{decode_header, decode_header_batch, header_hash};
use crate::params::NetworkParams;
use crate::store::{ChainNode, ChainStore};

/// Capability token for owner-only entry points.
///
/// The embedding host constructs one only after its own authorization
/// check; the engine trusts possession of the value.
#[derive(Debug)]
pub struct Authority {
    _priv: (),
}

impl Authority {
    /// Assert operator authority. Gate this constructor at the host
    /// boundary; internal relay logic never checks identities itself.
    pub fn assume() -> Self {
        Self { _priv: () }
    }
}

/// Signals emitted by mutating relay calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    HeaderAdded {
        height: u64,
        hash: BlockHash,
        submitter: String,
    },
    BlockFinalized {
        height: u64,
        hash: BlockHash,
        parent: BlockHash,
        submitter: String,
        reward_native: u64,
        reward_secondary: u64,
    },
    SiblingPruned {
        height: u64,
        hash: BlockHash,
    },
    RewardPaymentFailed {
        submitter: String,
        amount: u64,
        reason: String,
    },
}

/// Mutable relay bookkeeping, separate from the header index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayState {
    pub genesis_height: u64,
    pub genesis_hash: BlockHash,
    /// Hash of the first header of the genesis block's difficulty epoch,
    /// needed to validate the first retarget after bootstrap.
    pub period_start_hash: BlockHash,
    pub highest_height: u64,
    /// Confirmation depth before a height is treated as immutable.
    pub finalization_parameter: u64,
    pub last_finalized_height: u64,
    pub paused: bool,
}

/// The header relay: chain index, relay state and fee accounting behind a
/// serialized submission interface.
pub struct Relay {
    pub(crate) params: NetworkParams,
    pub(crate) state: RelayState,
    pub(crate) store: ChainStore,
    pub(crate) fees: FeeMeter,
    pub(crate) payer: Box<dyn RewardPayer + Send>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("params", &self.params)
            .field("state", &self.state)
            .field("fees", &self.fees)
            .finish_non_exhaustive()
    }
}

/// A validated header staged for commit.
struct StagedHeader {
    hash: BlockHash,
    height: u64,
    node: ChainNode,
}

impl Relay {
    /// Bootstrap the relay from a trusted genesis header.
    ///
    /// This is the single trust-on-first-use input: the header itself is
    /// not validated against anything, but the byte length and the
    /// little-endian formatting of both hashes are checked explicitly.
    /// A big-endian (display order) hash reads as a number far above the
    /// pow limit and is rejected rather than silently mis-validated.
    pub fn initialize(
        genesis_header_bytes: &[u8],
        genesis_height: u64,
        period_start_hash_le: [u8; 32],
        finalization_parameter: u64,
        params: NetworkParams,
        fee_params: FeeParams,
        payer: Box<dyn RewardPayer + Send>,
    ) -> Result<Self, RelayError> {
        let genesis = decode_header(genesis_header_bytes)
            .map_err(|e| RelayError::BadGenesis(e.to_string()))?;
        if finalization_parameter == 0 {
            return Err(RelayError::BadGenesis(
                "finalization parameter must be at least 1".into(),
            ));
        }

        let genesis_hash = header_hash(&genesis);
        let period_start_hash = bitcoin::hashes::Hash::from_byte_array(period_start_hash_le);
        let pow_limit = crate::difficulty::expand_target(params.pow_limit_bits, &params)?;
        for (name, hash) in [("genesis", &genesis_hash), ("period start", &period_start_hash)] {
            if pow_value(hash) > pow_limit {
                return Err(RelayError::BadGenesis(format!(
                    "{name} hash is above the pow limit; was it passed big-endian?"
                )));
            }
        }

        let store = ChainStore::bootstrap(
            genesis_hash,
            ChainNode {
                height: genesis_height,
                prev_hash: genesis.prev_blockhash,
                merkle_root: genesis.merkle_root,
                submitter: "genesis".into(),
            },
        );

        info!(height = genesis_height, hash = %genesis_hash, "relay initialized");

        Ok(Self {
            params,
            state: RelayState {
                genesis_height,
                genesis_hash,
                period_start_hash,
                highest_height: genesis_height,
                finalization_parameter,
                last_finalized_height: genesis_height,
                paused: false,
            },
            store,
            fees: FeeMeter::new(fee_params),
            payer,
        })
    }

    /// Rebuild a relay from persisted parts. Nodes must have been admitted
    /// by a previous instance; no re-validation happens here.
    pub fn from_parts(
        params: NetworkParams,
        state: RelayState,
        store: ChainStore,
        fees: FeeMeter,
        payer: Box<dyn RewardPayer + Send>,
    ) -> Self {
        Self {
            params,
            state,
            store,
            fees,
            payer,
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn fees(&self) -> &FeeMeter {
        &self.fees
    }

    pub fn last_submitted_height(&self) -> u64 {
        self.state.highest_height
    }

    pub fn finalization_parameter(&self) -> u64 {
        self.state.finalization_parameter
    }

    /// Quote the current inclusion-query fee.
    pub fn required_fee(&self) -> u64 {
        self.fees.required_fee()
    }

    // --- read-only queries ---

    pub fn find_height(&self, hash: &BlockHash) -> Result<u64, RelayError> {
        self.store.find_height(hash)
    }

    pub fn find_ancestor(&self, hash: &BlockHash, offset: u64) -> Result<BlockHash, RelayError> {
        self.store.find_ancestor(hash, offset)
    }

    pub fn is_ancestor(&self, ancestor: &BlockHash, descendant: &BlockHash, limit: u64) -> bool {
        self.store.is_ancestor(ancestor, descendant, limit)
    }

    pub fn block_hash_at(&self, height: u64, index: usize) -> Option<BlockHash> {
        self.store.candidate_at(height, index)
    }

    pub fn submitted_headers_at(&self, height: u64) -> usize {
        self.store.candidate_count(height)
    }

    // --- submission entry points ---

    /// Submit a contiguous run of headers anchored to a known parent.
    /// The batch must not cross a difficulty epoch boundary.
    pub fn submit_headers(
        &mut self,
        anchor_bytes: &[u8],
        new_header_bytes: &[u8],
        submitter: &str,
    ) -> Result<Vec<RelayEvent>, RelayError> {
        if self.state.paused {
            return Err(RelayError::Paused);
        }
        self.submit_inner(anchor_bytes, new_header_bytes, submitter, None, false)
    }

    /// Submit headers crossing an epoch boundary, with the old period's
    /// first and last headers supplied for retarget validation.
    pub fn submit_headers_with_retarget(
        &mut self,
        old_period_start_bytes: &[u8],
        old_period_end_bytes: &[u8],
        new_header_bytes: &[u8],
        submitter: &str,
    ) -> Result<Vec<RelayEvent>, RelayError> {
        if self.state.paused {
            return Err(RelayError::Paused);
        }
        self.submit_inner(
            old_period_end_bytes,
            new_header_bytes,
            submitter,
            Some(old_period_start_bytes),
            false,
        )
    }

    /// Owner override: submit while paused and past the fork window.
    ///
    /// The validation rules are otherwise identical; this exists so the
    /// operator can replay a contested branch after raising the
    /// finalization parameter.
    pub fn owner_submit_headers(
        &mut self,
        _auth: &Authority,
        anchor_bytes: &[u8],
        new_header_bytes: &[u8],
        submitter: &str,
    ) -> Result<Vec<RelayEvent>, RelayError> {
        self.submit_inner(anchor_bytes, new_header_bytes, submitter, None, true)
    }

    /// Owner override of the retarget path.
    pub fn owner_submit_headers_with_retarget(
        &mut self,
        _auth: &Authority,
        old_period_start_bytes: &[u8],
        old_period_end_bytes: &[u8],
        new_header_bytes: &[u8],
        submitter: &str,
    ) -> Result<Vec<RelayEvent>, RelayError> {
        self.submit_inner(
            old_period_end_bytes,
            new_header_bytes,
            submitter,
            Some(old_period_start_bytes),
            true,
        )
    }

    fn submit_inner(
        &mut self,
        anchor_bytes: &[u8],
        new_header_bytes: &[u8],
        submitter: &str,
        retarget_old_start: Option<&[u8]>,
        owner: bool,
    ) -> Result<Vec<RelayEvent>, RelayError> {
        let anchor = decode_header(anchor_bytes)?;
        let anchor_hash = header_hash(&anchor);
        let anchor_height = self.store.find_height(&anchor_hash)?;
        let headers = decode_header_batch(new_header_bytes)?;

        // Forks may only contest heights inside the liveness window, and
        // must grow out of the finalized chain. Pruning leaves a losing
        // branch's descendants orphaned in the store at in-window heights;
        // anchoring to them would extend a dead branch.
        if !owner
            && (anchor_height + self.state.finalization_parameter < self.state.highest_height
                || !self.anchor_descends_from_finalized(&anchor_hash, anchor_height))
        {
            return Err(RelayError::TooOldFork {
                fork_height: anchor_height,
                tip_height: self.state.highest_height,
            });
        }

        let first_height = anchor_height + 1;
        let expected_bits = match retarget_old_start {
            None => anchor.bits.to_consensus(),
            Some(old_start_bytes) => {
                self.validate_retarget_boundary(old_start_bytes, &anchor, anchor_hash, &headers[0])?
            }
        };

        // Validate the whole batch before committing anything.
        let staged = self.validate_batch(
            &headers,
            anchor_hash,
            first_height,
            expected_bits,
            retarget_old_start.is_some(),
            submitter,
        )?;

        // Commit phase: insertions can no longer fail.
        let mut events = Vec::new();
        for stage in staged {
            let added = self
                .store
                .add_candidate(stage.hash, stage.height, stage.node)
                .expect("staged header was validated against the store");
            if !added {
                // Already present at this height, nothing to do.
                debug!(height = stage.height, hash = %stage.hash, "header already known");
                continue;
            }
            info!(height = stage.height, hash = %stage.hash, submitter, "header admitted");
            events.push(RelayEvent::HeaderAdded {
                height: stage.height,
                hash: stage.hash,
                submitter: submitter.to_string(),
            });
            self.advance_tip(stage.hash, stage.height, &mut events);
        }
        Ok(events)
    }

    /// Whether walking `anchor`'s prev links down to the last finalized
    /// height lands on the finalized block there. Fails for orphans whose
    /// parent was pruned (the walk hits a missing node) and for anchors
    /// below the finalized height.
    fn anchor_descends_from_finalized(&self, anchor_hash: &BlockHash, anchor_height: u64) -> bool {
        let finalized_height = self.state.last_finalized_height;
        let offset = match anchor_height.checked_sub(finalized_height) {
            Some(offset) => offset,
            None => return false,
        };
        let finalized = match self.store.candidate_at(finalized_height, 0) {
            Some(hash) => hash,
            None => return false,
        };
        self.store.find_ancestor(anchor_hash, offset) == Ok(finalized)
    }

    /// Decode and check the old-period headers, then compute the bits the
    /// first header of the new epoch must carry.
    fn validate_retarget_boundary(
        &self,
        old_start_bytes: &[u8],
        old_end: &Header,
        old_end_hash: BlockHash,
        first_new: &Header,
    ) -> Result<u32, RelayError> {
        let epoch_len = self.params.epoch_length;
        let old_end_height = self.store.find_height(&old_end_hash)?;
        let first_height = old_end_height + 1;
        if first_height % epoch_len != 0 {
            return Err(RelayError::UnexpectedRetarget(first_height));
        }

        let old_start = decode_header(old_start_bytes)?;
        let old_start_hash = header_hash(&old_start);
        let epoch_start_height = first_height - epoch_len;

        // The epoch opener is either a stored ancestor or, for the genesis
        // epoch, the period-start hash supplied at bootstrap.
        let expected_start = if epoch_start_height >= self.store.horizon() {
            self.store.find_ancestor(&old_end_hash, epoch_len - 1)?
        } else {
            self.state.period_start_hash
        };
        if old_start_hash != expected_start {
            return match self.store.find_height(&old_start_hash) {
                Ok(actual) => Err(RelayError::NotExactlyOneEpoch(
                    old_end_height.saturating_sub(actual) + 1,
                )),
                Err(_) => Err(RelayError::UnknownBlock(old_start_hash)),
            };
        }

        validate_retarget(&old_start, old_end, first_new, first_height, &self.params)
    }

    fn validate_batch(
        &self,
        headers: &[Header],
        anchor_hash: BlockHash,
        first_height: u64,
        expected_bits: u32,
        is_retarget: bool,
        submitter: &str,
    ) -> Result<Vec<StagedHeader>, RelayError> {
        let epoch_len = self.params.epoch_length;
        let mut staged = Vec::with_capacity(headers.len());
        let mut prev_hash = anchor_hash;

        for (i, header) in headers.iter().enumerate() {
            let height = first_height + i as u64;
            let hash = header_hash(header);

            if header.prev_blockhash != prev_hash {
                return Err(RelayError::BrokenLinkage(hash));
            }
            // Resubmission fast path: a hash already in the store was fully
            // validated when it was first admitted, and linking into this
            // batch pins it to the same chain position. Skip the PoW and
            // difficulty re-checks.
            if self.store.contains(&hash) {
                prev_hash = hash;
                continue;
            }
            // Difficulty may only change on the first header of a retarget
            // submission; every other epoch crossing is rejected.
            let opens_epoch = height % epoch_len == 0;
            if opens_epoch && !(is_retarget && i == 0) {
                return Err(RelayError::UnexpectedRetarget(height));
            }
            if header.bits.to_consensus() != expected_bits {
                return Err(RelayError::UnexpectedRetarget(height));
            }
            check_pow(header, &self.params)?;

            staged.push(StagedHeader {
                hash,
                height,
                node: ChainNode {
                    height,
                    prev_hash,
                    merkle_root: header.merkle_root,
                    submitter: submitter.to_string(),
                },
            });
            prev_hash = hash;
        }
        Ok(staged)
    }

    // --- admin surface (authority-gated) ---

    pub fn pause(&mut self, _auth: &Authority) {
        self.state.paused = true;
        info!("relay paused");
    }

    pub fn unpause(&mut self, _auth: &Authority) {
        self.state.paused = false;
        info!("relay unpaused");
    }

    /// Raise the confirmation depth. Lowering it is refused: a pending
    /// manual-reorg operation relies on the window only growing.
    pub fn set_finalization_parameter(
        &mut self,
        _auth: &Authority,
        new: u64,
    ) -> Result<(), RelayError> {
        if new < self.state.finalization_parameter {
            return Err(RelayError::InvalidParameter(
                "finalization parameter may not decrease".into(),
            ));
        }
        self.state.finalization_parameter = new;
        Ok(())
    }

    /// Change the epoch length, preserving the per-block target spacing.
    pub fn set_epoch_length(&mut self, _auth: &Authority, new: u64) -> Result<(), RelayError> {
        if new == 0 {
            return Err(RelayError::InvalidParameter(
                "epoch length must be at least 1".into(),
            ));
        }
        let spacing = self.params.target_spacing_secs();
        self.params.epoch_length = new;
        self.params.target_timespan_secs = spacing * new;
        Ok(())
    }

    pub fn set_fee_params(&mut self, _auth: &Authority, params: FeeParams) -> Result<(), RelayError> {
        if params.baseline_queries == 0 {
            return Err(RelayError::InvalidParameter(
                "baseline queries must be at least 1".into(),
            ));
        }
        if params.relayer_fee_pct > 100 {
            return Err(RelayError::InvalidParameter(
                "relayer fee above 100 percent".into(),
            ));
        }
        self.fees.set_params(params);
        Ok(())
    }
}
