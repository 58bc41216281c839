//! Confirmation-depth finalization and sibling pruning.
//!
//! The finalized branch is whichever candidate is an ancestor of the new
//! tip once the confirmation depth is reached. This is deliberately NOT
//! Bitcoin's heaviest-chain rule: competing branches of equal length are
//! settled by who extends past the confirmation window first, which is the
//! tracked system's design choice, not an oversight.

use bitcoin::BlockHash;
use tracing::{info, warn};

use crate::engine::{Relay, RelayEvent};

impl Relay {
    /// Advance the tip to a newly admitted header and finalize every height
    /// that has just reached the confirmation depth.
    pub(crate) fn advance_tip(
        &mut self,
        tip_hash: BlockHash,
        tip_height: u64,
        events: &mut Vec<RelayEvent>,
    ) {
        if tip_height <= self.state.highest_height {
            return;
        }
        self.state.highest_height = tip_height;

        let depth = self.state.finalization_parameter;
        let finalize_upto = tip_height.saturating_sub(depth);
        // Genesis is finalized by definition; heights below the last
        // finalized one are already settled.
        let from = self.state.last_finalized_height + 1;
        for height in from..=finalize_upto {
            self.finalize_height(height, tip_hash, tip_height, events);
            self.state.last_finalized_height = height;
        }
    }

    fn finalize_height(
        &mut self,
        height: u64,
        tip_hash: BlockHash,
        tip_height: u64,
        events: &mut Vec<RelayEvent>,
    ) {
        // The tip's ancestor at this height is the finalized block; walking
        // down from the tip is bounded by the confirmation depth.
        let finalized = match self.store.find_ancestor(&tip_hash, tip_height - height) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(height, %err, "finalization skipped: tip ancestor unavailable");
                return;
            }
        };

        // Prune losing siblings at this height only; their descendants die
        // with their parent link and get swept when their height finalizes.
        let siblings: Vec<BlockHash> = self
            .store
            .candidates(height)
            .iter()
            .copied()
            .filter(|hash| *hash != finalized)
            .collect();
        for sibling in siblings {
            self.store.remove_candidate(height, &sibling);
            info!(height, hash = %sibling, "pruned competing candidate");
            events.push(RelayEvent::SiblingPruned {
                height,
                hash: sibling,
            });
        }

        let node = self
            .store
            .node(&finalized)
            .expect("finalized node is in the store")
            .clone();

        let outcome = self.fees.settle_reward(self.payer.as_mut(), &node.submitter);
        self.fees
            .maybe_roll_epoch(height, self.params.epoch_length);

        info!(
            height,
            hash = %finalized,
            submitter = %node.submitter,
            reward_native = outcome.native,
            reward_secondary = outcome.secondary,
            "block finalized"
        );
        events.push(RelayEvent::BlockFinalized {
            height,
            hash: finalized,
            parent: node.prev_hash,
            submitter: node.submitter.clone(),
            reward_native: outcome.native,
            reward_secondary: outcome.secondary,
        });

        if let Some(reason) = outcome.payment_error {
            warn!(submitter = %node.submitter, amount = outcome.secondary, %reason,
                "secondary reward payment failed; submission unaffected");
            events.push(RelayEvent::RewardPaymentFailed {
                submitter: node.submitter,
                amount: outcome.secondary,
                reason,
            });
        }
    }
}
