use std::collections::BTreeMap;

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;

use super::{sha256, Address, Hash32};

/// Persisted per-address state record: balance, nonce, contract code and
/// the address-scoped key-value namespace. The UMID binding and stake
/// records live inside `storage` under reserved keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: U256,
    pub nonce: u64,
    pub code_hash: String,
    pub code: Vec<u8>,
    pub storage: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: U256::zero(),
            nonce: 0,
            code_hash: hex::encode(sha256(&[])),
            code: Vec::new(),
            storage: BTreeMap::new(),
        }
    }

    /// An account is empty when it carries no balance, no nonce, no code
    /// and no storage records. A UMID binding or stake record alone keeps
    /// the account alive. Empty accounts may be reset by a repeated
    /// `create_account`.
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero() && self.nonce == 0 && self.code.is_empty() && self.storage.is_empty()
    }

    pub fn state_leaf(&self) -> ChainResult<Hash32> {
        let bytes = bincode::serialize(self)?;
        Ok(sha256(&bytes))
    }
}
