//! Merkle branches for wallet inclusion proofs.

use umbra_consensus::Hash256;

use crate::hash::sha256d;

fn hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    sha256d(&data)
}

/// Branch of sibling hashes proving `txids[index]` up to the merkle root.
/// Odd levels pair the last hash with itself, bitcoin-style.
pub fn merkle_branch(txids: &[Hash256], mut index: usize) -> Vec<Hash256> {
    let mut branch = Vec::new();
    if txids.is_empty() || index >= txids.len() {
        return branch;
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        let sibling = if index % 2 == 0 {
            *level.get(index + 1).unwrap_or(&level[index])
        } else {
            level[index - 1]
        };
        branch.push(sibling);

        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
        index /= 2;
    }
    branch
}

/// Root recomputed from a leaf and its branch.
pub fn merkle_root_from_branch(leaf: &Hash256, branch: &[Hash256], mut index: usize) -> Hash256 {
    let mut hash = *leaf;
    for sibling in branch {
        if index % 2 == 0 {
            hash = hash_pair(&hash, sibling);
        } else {
            hash = hash_pair(sibling, &hash);
        }
        index /= 2;
    }
    hash
}

pub fn merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash256> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            next.push(hash_pair(&pair[0], right));
        }
        level = next;
    }
    level[0]
}
