use serde::{Deserialize, Serialize};

use super::{sha256, Hash32};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success = 0,
    Fail = 1,
    BalanceNotEnough = 2,
    ParseFail = 3,
}

/// Execution outcome record for one transaction within a committed block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub status: ReceiptStatus,
    pub cumulative_gas_used: u64,
    pub tx_hash: String,
    pub height: u64,
    pub tx_index: u16,
}

impl Receipt {
    pub fn new(
        status: ReceiptStatus,
        cumulative_gas_used: u64,
        tx_hash: String,
        height: u64,
        tx_index: u16,
    ) -> Self {
        Self {
            status,
            cumulative_gas_used,
            tx_hash,
            height,
            tx_index,
        }
    }

    pub fn success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }

    pub fn gen_hash(&self) -> Hash32 {
        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(self.tx_hash.as_bytes());
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.cumulative_gas_used.to_be_bytes());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.extend_from_slice(&self.tx_index.to_be_bytes());
        sha256(&buf)
    }
}
