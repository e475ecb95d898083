mod account;
mod block;
mod receipt;
mod transaction;

pub use account::Account;
pub use block::{Block, BlockHeader, BlockMetadata};
pub use receipt::{Receipt, ReceiptStatus};
pub use transaction::{Sign, Transaction, TxType};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Address = String;

pub type Hash32 = [u8; 32];

/// Proof that a block proposer holds the UMID bound to its address,
/// computed over the on-chain bound hash and the block hash.
pub type AuthCode = Vec<u8>;

pub const UMID_LENGTH: usize = 32;

/// Outcome of a block insertion attempt. Every call to
/// `BlockChain::add_block_on_chain` terminates in exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddBlockResult {
    Failed,
    Success,
    AlreadyExists,
}

pub fn sha256(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute a binary merkle root over the leaves in the order given.
/// Transaction and receipt trees commit to body order, so leaves are
/// never sorted here.
pub fn compute_merkle_root(leaves: &[Hash32]) -> Hash32 {
    if leaves.is_empty() {
        return sha256(b"xchain-empty");
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for chunk in level.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&left);
            data.extend_from_slice(&right);
            next.push(sha256(&data));
        }
        level = next;
    }
    level[0]
}

pub fn decode_hash(hex_str: &str) -> crate::errors::ChainResult<Hash32> {
    let bytes = hex::decode(hex_str)
        .map_err(|err| crate::errors::ChainError::Codec(format!("invalid hash encoding: {err}")))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| crate::errors::ChainError::Codec("hash must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_root_preserves_leaf_order() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        let forward = compute_merkle_root(&[a, b]);
        let reversed = compute_merkle_root(&[b, a]);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn merkle_root_of_empty_set_is_stable() {
        assert_eq!(compute_merkle_root(&[]), compute_merkle_root(&[]));
        assert_ne!(compute_merkle_root(&[]), [0u8; 32]);
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let leaf = sha256(b"only");
        assert_eq!(compute_merkle_root(&[leaf]), leaf);
    }
}
