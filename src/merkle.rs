//! Merkle tree over a block's transactions.
//!
//! Leaves are hashed through [`Hashable`]; interior nodes are
//! `sha256(left || right)`. The last node of an odd level is carried up
//! unchanged, so `[a, b, c]` and `[a, b, c, c]` have different roots. The root
//! is a pure function of the ordered leaf sequence.

use crate::error::{ChainError, Result};
use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

pub trait Hashable {
    fn hash(&self) -> Result<Sha256Hash>;
    fn equals(&self, other: &Self) -> Result<bool>;
}

/// One sibling on the path from a leaf to the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Sha256Hash,
    /// The sibling sits to the left of the running hash.
    pub sibling_is_left: bool,
}

#[derive(Debug, Clone)]
pub struct MerkleTree<T> {
    leaves: Vec<T>,
    levels: Vec<Vec<Sha256Hash>>,
}

fn hash_pair(left: &Sha256Hash, right: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn build_levels(leaf_hashes: Vec<Sha256Hash>) -> Vec<Vec<Sha256Hash>> {
    let mut levels = vec![leaf_hashes];
    while levels.last().map_or(0, Vec::len) > 1 {
        let current = levels.last().cloned().unwrap_or_default();
        let next = current
            .chunks(2)
            .map(|pair| match pair.get(1) {
                Some(right) => hash_pair(&pair[0], right),
                None => pair[0],
            })
            .collect();
        levels.push(next);
    }
    levels
}

impl<T: Hashable> MerkleTree<T> {
    pub fn new(leaves: Vec<T>) -> Result<Self> {
        if leaves.is_empty() {
            return Err(ChainError::InvalidBlock(
                "Cannot build a Merkle tree with no transactions".to_string(),
            ));
        }
        let leaf_hashes = leaves
            .iter()
            .map(Hashable::hash)
            .collect::<Result<Vec<_>>>()?;
        Ok(MerkleTree {
            leaves,
            levels: build_levels(leaf_hashes),
        })
    }

    pub fn root(&self) -> Sha256Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or_default()
    }

    /// `0x`-prefixed hex root, the form stored in `BlockHeader::trans_root`.
    pub fn root_hex(&self) -> String {
        format!("0x{}", hex::encode(self.root()))
    }

    pub fn values(&self) -> &[T] {
        &self.leaves
    }

    pub fn into_values(self) -> Vec<T> {
        self.leaves
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Re-hashes every leaf and checks the stored structure still matches.
    pub fn verify(&self) -> Result<bool> {
        let leaf_hashes = self
            .leaves
            .iter()
            .map(Hashable::hash)
            .collect::<Result<Vec<_>>>()?;
        Ok(build_levels(leaf_hashes) == self.levels)
    }

    pub fn contains(&self, value: &T) -> Result<bool> {
        for leaf in &self.leaves {
            if leaf.equals(value)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaves.len() {
            return None;
        }
        let mut steps = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = if position % 2 == 0 {
                position + 1
            } else {
                position - 1
            };
            // A lone trailing node is promoted without a sibling.
            if let Some(sibling) = level.get(sibling_index) {
                steps.push(ProofStep {
                    sibling: *sibling,
                    sibling_is_left: position % 2 == 1,
                });
            }
            position /= 2;
        }
        Some(steps)
    }
}

pub fn verify_proof(root: &Sha256Hash, leaf_hash: &Sha256Hash, proof: &[ProofStep]) -> bool {
    let computed = proof.iter().fold(*leaf_hash, |acc, step| {
        if step.sibling_is_left {
            hash_pair(&step.sibling, &acc)
        } else {
            hash_pair(&acc, &step.sibling)
        }
    });
    computed == *root
}
