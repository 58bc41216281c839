//! Multi-branch header index.
//!
//! Nodes are kept in an arena keyed by block hash with a secondary
//! height-to-candidates index. Parent links are key lookups, never
//! references, so competing branches and reorg pruning stay cheap.

use std::collections::{BTreeMap, HashMap};

use bitcoin::{BlockHash, TxMerkleNode};

use crate::error::RelayError;

/// A stored header, reduced to what relay queries need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode {
    pub height: u64,
    pub prev_hash: BlockHash,
    pub merkle_root: TxMerkleNode,
    /// Identity credited with the submission, for reward accounting.
    pub submitter: String,
}

/// Persistent multi-branch index of submitted headers.
#[derive(Debug, Clone)]
pub struct ChainStore {
    nodes: HashMap<BlockHash, ChainNode>,
    /// height -> candidate hashes, in insertion order, no duplicates.
    by_height: BTreeMap<u64, Vec<BlockHash>>,
    genesis_hash: BlockHash,
    genesis_height: u64,
}

impl ChainStore {
    /// Create a store seeded with the trusted genesis node.
    pub fn bootstrap(genesis_hash: BlockHash, genesis: ChainNode) -> Self {
        let genesis_height = genesis.height;
        let mut store = Self {
            nodes: HashMap::new(),
            by_height: BTreeMap::new(),
            genesis_hash,
            genesis_height,
        };
        store.insert(genesis_hash, genesis);
        store
    }

    fn insert(&mut self, hash: BlockHash, node: ChainNode) {
        self.by_height.entry(node.height).or_default().push(hash);
        self.nodes.insert(hash, node);
    }

    /// Re-insert a node during state restore, skipping parent validation.
    ///
    /// Only for rehydrating a store from nodes that were validated when
    /// first admitted. Must be called in ascending height order.
    pub fn restore_node(&mut self, hash: BlockHash, node: ChainNode) {
        if !self.nodes.contains_key(&hash) {
            self.insert(hash, node);
        }
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis_hash
    }

    /// Lowest height the store answers queries for.
    pub fn horizon(&self) -> u64 {
        self.genesis_height
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn node(&self, hash: &BlockHash) -> Option<&ChainNode> {
        self.nodes.get(hash)
    }

    /// Height of a known block.
    pub fn find_height(&self, hash: &BlockHash) -> Result<u64, RelayError> {
        self.nodes
            .get(hash)
            .map(|node| node.height)
            .ok_or(RelayError::UnknownBlock(*hash))
    }

    /// Add a candidate at `height`, linked to an already-known parent.
    ///
    /// Returns `false` without touching the store when the hash is already
    /// known at that height (idempotent resubmission fast path).
    pub fn add_candidate(
        &mut self,
        hash: BlockHash,
        height: u64,
        node: ChainNode,
    ) -> Result<bool, RelayError> {
        debug_assert_eq!(height, node.height);
        if let Some(existing) = self.nodes.get(&hash) {
            if existing.height == height {
                return Ok(false);
            }
            return Err(RelayError::UnknownParent(node.prev_hash));
        }
        let parent_ok = self
            .nodes
            .get(&node.prev_hash)
            .map(|parent| parent.height + 1 == height)
            .unwrap_or(false);
        if !parent_ok {
            return Err(RelayError::UnknownParent(node.prev_hash));
        }
        self.insert(hash, node);
        Ok(true)
    }

    /// Walk `offset` prev-hash links from `hash`.
    pub fn find_ancestor(&self, hash: &BlockHash, offset: u64) -> Result<BlockHash, RelayError> {
        let mut current = *hash;
        if !self.contains(&current) {
            return Err(RelayError::UnknownBlock(current));
        }
        for walked in 0..offset {
            let node = self
                .nodes
                .get(&current)
                .ok_or(RelayError::UnknownAncestor { hash: *hash, walked })?;
            if node.height == self.genesis_height {
                return Err(RelayError::UnknownAncestor { hash: *hash, walked });
            }
            current = node.prev_hash;
        }
        // The final hop may land on a pruned sibling's parent.
        if !self.contains(&current) {
            return Err(RelayError::UnknownAncestor {
                hash: *hash,
                walked: offset,
            });
        }
        Ok(current)
    }

    /// Whether `ancestor` is reachable from `descendant` within `limit` hops.
    ///
    /// Returns `false` (never an error) when the walk misses or falls off
    /// the stored horizon, bounding the cost of adversarial deep queries.
    pub fn is_ancestor(&self, ancestor: &BlockHash, descendant: &BlockHash, limit: u64) -> bool {
        let mut current = *descendant;
        for _ in 0..=limit {
            if current == *ancestor {
                return true;
            }
            match self.nodes.get(&current) {
                Some(node) if node.height > self.genesis_height => current = node.prev_hash,
                _ => return false,
            }
        }
        false
    }

    /// Number of candidate headers submitted at `height`.
    pub fn candidate_count(&self, height: u64) -> usize {
        self.by_height.get(&height).map(Vec::len).unwrap_or(0)
    }

    /// Candidate hash at `height` by insertion index.
    pub fn candidate_at(&self, height: u64, index: usize) -> Option<BlockHash> {
        self.by_height
            .get(&height)
            .and_then(|hashes| hashes.get(index))
            .copied()
    }

    /// All candidate hashes at `height`, in insertion order.
    pub fn candidates(&self, height: u64) -> &[BlockHash] {
        self.by_height
            .get(&height)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop a candidate from both indexes. Used only by finalization pruning.
    pub fn remove_candidate(&mut self, height: u64, hash: &BlockHash) {
        if let Some(hashes) = self.by_height.get_mut(&height) {
            hashes.retain(|h| h != hash);
            if hashes.is_empty() {
                self.by_height.remove(&height);
            }
        }
        self.nodes.remove(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn h(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    fn node(height: u64, prev: BlockHash) -> ChainNode {
        ChainNode {
            height,
            prev_hash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            submitter: "test".into(),
        }
    }

    fn seeded() -> ChainStore {
        // Genesis at height 100, then 101..=103 on top.
        let mut store = ChainStore::bootstrap(h(0), node(100, h(255)));
        store.add_candidate(h(1), 101, node(101, h(0))).unwrap();
        store.add_candidate(h(2), 102, node(102, h(1))).unwrap();
        store.add_candidate(h(3), 103, node(103, h(2))).unwrap();
        store
    }

    #[test]
    fn linkage_is_enforced() {
        let mut store = seeded();
        let err = store.add_candidate(h(9), 105, node(105, h(3))).unwrap_err();
        assert!(matches!(err, RelayError::UnknownParent(_)));
        let err = store.add_candidate(h(9), 102, node(102, h(7))).unwrap_err();
        assert!(matches!(err, RelayError::UnknownParent(_)));
    }

    #[test]
    fn resubmission_is_a_noop() {
        let mut store = seeded();
        assert!(!store.add_candidate(h(2), 102, node(102, h(1))).unwrap());
        assert_eq!(store.candidate_count(102), 1);
    }

    #[test]
    fn ancestor_walks() {
        let store = seeded();
        assert_eq!(store.find_ancestor(&h(3), 0).unwrap(), h(3));
        assert_eq!(store.find_ancestor(&h(3), 2).unwrap(), h(1));
        assert_eq!(store.find_ancestor(&h(3), 3).unwrap(), h(0));
        assert!(matches!(
            store.find_ancestor(&h(3), 4),
            Err(RelayError::UnknownAncestor { .. })
        ));
        assert!(matches!(
            store.find_ancestor(&h(9), 1),
            Err(RelayError::UnknownBlock(_))
        ));
    }

    #[test]
    fn is_ancestor_respects_limit() {
        let store = seeded();
        assert!(store.is_ancestor(&h(0), &h(3), 3));
        assert!(!store.is_ancestor(&h(0), &h(3), 2));
        assert!(store.is_ancestor(&h(3), &h(3), 0));
        assert!(!store.is_ancestor(&h(9), &h(3), 10));
    }

    #[test]
    fn forks_share_a_height() {
        let mut store = seeded();
        store.add_candidate(h(12), 102, node(102, h(1))).unwrap();
        assert_eq!(store.candidate_count(102), 2);
        assert_eq!(store.candidate_at(102, 0), Some(h(2)));
        assert_eq!(store.candidate_at(102, 1), Some(h(12)));

        store.remove_candidate(102, &h(12));
        assert_eq!(store.candidates(102), &[h(2)]);
        assert!(!store.contains(&h(12)));
    }
}
