use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Keypair, PublicKey};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

use super::transaction::u256_to_be;
use super::{compute_merkle_root, decode_hash, sha256, Address, Hash32, Sign, Transaction};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: String,
    pub height: u64,
    pub pre_hash: String,
    pub cur_time: u64,
    pub proposer: Address,
    /// Plot nonce selected by the capacity scheduler, not a PoW counter.
    pub nonce: u64,
    pub tx_tree: String,
    pub receipt_tree: String,
    pub state_tree: String,
    pub base_target: u64,
    pub cumulative_difficulty: U256,
    pub auth_code: Vec<u8>,
    pub sign: Option<Sign>,
}

impl BlockHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        height: u64,
        pre_hash: String,
        proposer: Address,
        nonce: u64,
        tx_tree: String,
        receipt_tree: String,
        state_tree: String,
        base_target: u64,
        cumulative_difficulty: U256,
    ) -> Self {
        Self {
            hash: String::new(),
            height,
            pre_hash,
            cur_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            proposer,
            nonce,
            tx_tree,
            receipt_tree,
            state_tree,
            base_target,
            cumulative_difficulty,
            auth_code: Vec::new(),
            sign: None,
        }
    }

    fn preimage(&self, include_auth: bool) -> ChainResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(256 + self.auth_code.len());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&decode_hash(&self.pre_hash)?);
        buf.extend_from_slice(&self.cur_time.to_be_bytes());
        buf.extend_from_slice(&decode_hash(&self.proposer)?);
        buf.extend_from_slice(&self.nonce.to_be_bytes());
        buf.extend_from_slice(&decode_hash(&self.tx_tree)?);
        buf.extend_from_slice(&decode_hash(&self.receipt_tree)?);
        buf.extend_from_slice(&decode_hash(&self.state_tree)?);
        buf.extend_from_slice(&self.base_target.to_be_bytes());
        buf.extend_from_slice(&u256_to_be(&self.cumulative_difficulty));
        if include_auth {
            buf.extend_from_slice(&self.auth_code);
        }
        Ok(buf)
    }

    /// Hash of the header with the auth code excluded. The auth code is
    /// itself computed over this digest, so it cannot be part of it.
    pub fn pre_auth_hash(&self) -> ChainResult<Hash32> {
        Ok(sha256(&self.preimage(false)?))
    }

    /// Canonical block hash: every header field in fixed order, fixed-width
    /// big-endian integers, the variable-length auth code last. The
    /// signature stays outside the hash domain.
    pub fn gen_hash(&self) -> ChainResult<Hash32> {
        Ok(sha256(&self.preimage(true)?))
    }

    pub fn seal(&mut self, keypair: &Keypair) -> ChainResult<()> {
        let hash = self.gen_hash()?;
        self.hash = hex::encode(hash);
        self.sign = Some(Sign::create(keypair, &hash));
        Ok(())
    }

    pub fn hash_bytes(&self) -> ChainResult<Hash32> {
        decode_hash(&self.hash)
    }

    pub fn weight(&self) -> &U256 {
        &self.cumulative_difficulty
    }

    pub fn more_weight_than(&self, other: &BlockHeader) -> bool {
        self.cumulative_difficulty > other.cumulative_difficulty
    }

    /// Verifies the seal and returns the signer's public key.
    pub fn verify_sign(&self) -> ChainResult<PublicKey> {
        let sign = self
            .sign
            .as_ref()
            .ok_or_else(|| ChainError::Crypto("block header is unsigned".into()))?;
        let hash = self.gen_hash()?;
        if hex::encode(hash) != self.hash {
            return Err(ChainError::Crypto("block hash does not match header".into()));
        }
        sign.verify(&hash)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn transaction_hashes(&self) -> ChainResult<Vec<Hash32>> {
        self.transactions
            .iter()
            .map(|tx| tx.hash_bytes())
            .collect()
    }

    /// Validates that the header commits to exactly this transaction body.
    pub fn verify_tx_tree(&self) -> ChainResult<()> {
        let hashes = self.transaction_hashes()?;
        let root = compute_merkle_root(&hashes);
        if hex::encode(root) != self.header.tx_tree {
            return Err(ChainError::Transaction(
                "transaction tree does not match block body".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub height: u64,
    pub hash: String,
    pub cur_time: u64,
}

impl From<&Block> for BlockMetadata {
    fn from(block: &Block) -> Self {
        Self {
            height: block.header.height,
            hash: block.header.hash.clone(),
            cur_time: block.header.cur_time,
        }
    }
}
