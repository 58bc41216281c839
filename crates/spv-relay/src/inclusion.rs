//! Transaction inclusion checks against finalized block merkle roots.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Txid, TxMerkleNode};

use crate::engine::Relay;
use crate::error::RelayError;

/// Fold a txid up the merkle tree along the sibling path.
///
/// Bit `i` of `proof_index` says whether the sibling at level `i` sits on
/// the left of our running hash.
pub fn compute_merkle_root(txid: &Txid, siblings: &[TxMerkleNode], proof_index: u32) -> TxMerkleNode {
    let mut current = txid.to_byte_array();
    for (level, sibling) in siblings.iter().enumerate() {
        let mut concat = [0u8; 64];
        if (proof_index >> level) & 1 == 1 {
            concat[..32].copy_from_slice(&sibling.to_byte_array());
            concat[32..].copy_from_slice(&current);
        } else {
            concat[..32].copy_from_slice(&current);
            concat[32..].copy_from_slice(&sibling.to_byte_array());
        }
        current = sha256d::Hash::hash(&concat).to_byte_array();
    }
    TxMerkleNode::from_byte_array(current)
}

impl Relay {
    /// Check that `txid` is included in the finalized block at `height`.
    ///
    /// The fee is banked the moment `payment` clears the quote; validation
    /// failures after that point still consume it, so probing inclusion is
    /// never free. Only the initial `InsufficientFee` rejection leaves the
    /// payment untouched.
    pub fn check_inclusion(
        &mut self,
        txid: &Txid,
        height: u64,
        merkle_proof: &[TxMerkleNode],
        proof_index: u32,
        payment: u64,
    ) -> Result<bool, RelayError> {
        let required = self.fees.required_fee();
        if payment < required {
            return Err(RelayError::InsufficientFee {
                paid: payment,
                required,
            });
        }
        self.fees.record_query(payment);

        if txid.to_byte_array() == [0u8; 32] {
            return Err(RelayError::ZeroTxid);
        }
        if height < self.store.horizon() {
            return Err(RelayError::TooOld(height));
        }
        if height + self.state.finalization_parameter > self.state.highest_height {
            return Err(RelayError::NotFinalized {
                height,
                tip_height: self.state.highest_height,
            });
        }

        // A finalized height holds exactly one candidate.
        let hash = self
            .store
            .candidate_at(height, 0)
            .ok_or(RelayError::TooOld(height))?;
        let node = self
            .store
            .node(&hash)
            .ok_or(RelayError::UnknownBlock(hash))?;

        Ok(compute_merkle_root(txid, merkle_proof, proof_index) == node.merkle_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn combine(left: [u8; 32], right: [u8; 32]) -> [u8; 32] {
        let mut concat = [0u8; 64];
        concat[..32].copy_from_slice(&left);
        concat[32..].copy_from_slice(&right);
        sha256d::Hash::hash(&concat).to_byte_array()
    }

    /// Reference root of a 4-leaf tree plus the proof for one leaf.
    fn four_leaf_tree(leaf: usize) -> (TxMerkleNode, Vec<TxMerkleNode>, u32) {
        let leaves: Vec<[u8; 32]> = (1..=4).map(|n| txid(n as u8).to_byte_array()).collect();
        let l01 = combine(leaves[0], leaves[1]);
        let l23 = combine(leaves[2], leaves[3]);
        let root = TxMerkleNode::from_byte_array(combine(l01, l23));

        let (sibling0, upper) = match leaf {
            0 => (leaves[1], l23),
            1 => (leaves[0], l23),
            2 => (leaves[3], l01),
            3 => (leaves[2], l01),
            _ => unreachable!(),
        };
        let proof = vec![
            TxMerkleNode::from_byte_array(sibling0),
            TxMerkleNode::from_byte_array(upper),
        ];
        (root, proof, leaf as u32)
    }

    #[test]
    fn recomputes_root_for_every_position() {
        for leaf in 0..4 {
            let (root, proof, index) = four_leaf_tree(leaf);
            assert_eq!(
                compute_merkle_root(&txid((leaf + 1) as u8), &proof, index),
                root,
                "leaf {leaf}"
            );
        }
    }

    #[test]
    fn wrong_txid_or_proof_misses_root() {
        let (root, proof, index) = four_leaf_tree(2);
        assert_ne!(compute_merkle_root(&txid(9), &proof, index), root);
        // Flip the path bits: sibling order matters.
        assert_ne!(compute_merkle_root(&txid(3), &proof, index ^ 1), root);

        let mut bad_proof = proof.clone();
        let mut bytes = bad_proof[0].to_byte_array();
        bytes[0] ^= 0x01;
        bad_proof[0] = TxMerkleNode::from_byte_array(bytes);
        assert_ne!(compute_merkle_root(&txid(3), &bad_proof, index), root);
    }

    #[test]
    fn single_transaction_block_has_empty_proof() {
        let id = txid(7);
        let root = compute_merkle_root(&id, &[], 0);
        assert_eq!(root.to_byte_array(), id.to_byte_array());
    }
}
