use std::io;

use thiserror::Error;

use crate::types::Address;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("address {0} has no UMID binding")]
    AuthorityNotBound(Address),
    #[error("auth code mismatch for proposer {0}")]
    AuthorityMismatch(Address),
    #[error("UMID already bound for address {0}")]
    AlreadyBound(Address),
    #[error("insufficient balance for {0}")]
    InsufficientBalance(Address),
    #[error("nonce mismatch for {address}: expected {expected}, got {got}")]
    NonceMismatch {
        address: Address,
        expected: u64,
        got: u64,
    },
    #[error("unknown account {0}")]
    UnknownAccount(Address),
    #[error("fork error: {0}")]
    Fork(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

impl ChainError {
    /// True for failures that invalidate the whole block rather than a
    /// single transaction: an unverifiable signature or a broken nonce
    /// sequence means the proposer packed a body it never validated.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ChainError::Crypto(_) | ChainError::NonceMismatch { .. } | ChainError::Codec(_)
        )
    }
}
