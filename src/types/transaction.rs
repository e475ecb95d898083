use ed25519_dalek::{Keypair, PublicKey, Signature};
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    address_from_public_key, public_key_from_hex, sign_message, signature_from_hex,
    signature_to_hex, verify_signature,
};
use crate::errors::{ChainError, ChainResult};

use super::{decode_hash, sha256, Address, Hash32};

/// Supported transaction types. The discriminants are part of the wire
/// format and must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Transfer = 0,
    BindUmid = 1,
    TransformUmid = 2,
    UnbindUmid = 3,
    StakeAdd = 4,
    StakeReduce = 5,
}

impl TxType {
    pub fn from_u8(value: u8) -> ChainResult<Self> {
        match value {
            0 => Ok(TxType::Transfer),
            1 => Ok(TxType::BindUmid),
            2 => Ok(TxType::TransformUmid),
            3 => Ok(TxType::UnbindUmid),
            4 => Ok(TxType::StakeAdd),
            5 => Ok(TxType::StakeReduce),
            other => Err(ChainError::Codec(format!(
                "unknown transaction type {other}"
            ))),
        }
    }
}

/// Signature material attached to a transaction or block header. Ed25519
/// offers no public-key recovery, so the signer's key travels next to the
/// signature and the source address is derived from it on demand.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sign {
    pub signature: String,
    pub public_key: String,
}

impl Sign {
    pub fn create(keypair: &Keypair, message: &[u8]) -> Self {
        let signature = sign_message(keypair, message);
        Self {
            signature: signature_to_hex(&signature),
            public_key: hex::encode(keypair.public.to_bytes()),
        }
    }

    pub fn verify(&self, message: &[u8]) -> ChainResult<PublicKey> {
        let signature: Signature = signature_from_hex(&self.signature)?;
        let public_key = public_key_from_hex(&self.public_key)?;
        verify_signature(&public_key, message, &signature)?;
        Ok(public_key)
    }

    pub fn to_bytes(&self) -> ChainResult<Vec<u8>> {
        let mut bytes = hex::decode(&self.public_key)
            .map_err(|err| ChainError::Codec(format!("invalid public key encoding: {err}")))?;
        let signature = hex::decode(&self.signature)
            .map_err(|err| ChainError::Codec(format!("invalid signature encoding: {err}")))?;
        if bytes.len() != 32 || signature.len() != 64 {
            return Err(ChainError::Codec("malformed sign material".into()));
        }
        bytes.extend_from_slice(&signature);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> ChainResult<Self> {
        if bytes.len() != 96 {
            return Err(ChainError::Codec(format!(
                "sign material must be 96 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            public_key: hex::encode(&bytes[..32]),
            signature: hex::encode(&bytes[32..]),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub data: Vec<u8>,
    pub value: U256,
    pub nonce: u64,
    pub target: Option<Address>,
    pub tx_type: TxType,
    pub gas_limit: U256,
    pub gas_price: U256,
    pub hash: String,
    pub sign: Option<Sign>,
    /// Sender address, recovered from `sign`. Cached after the first
    /// successful recovery and excluded from the hash domain. Never
    /// serialized: a transaction arriving over the wire or the RPC must
    /// re-derive the sender from its signature.
    #[serde(skip)]
    pub source: Option<Address>,
}

impl Transaction {
    pub fn new(
        data: Vec<u8>,
        value: U256,
        nonce: u64,
        target: Option<Address>,
        tx_type: TxType,
        gas_limit: U256,
        gas_price: U256,
    ) -> Self {
        let mut tx = Self {
            data,
            value,
            nonce,
            target,
            tx_type,
            gas_limit,
            gas_price,
            hash: String::new(),
            sign: None,
            source: None,
        };
        tx.hash = hex::encode(tx.gen_hash());
        tx
    }

    /// Unique hash of the transaction. `sign` and `source` are outside the
    /// hash domain so identity is fixed at construction time.
    pub fn gen_hash(&self) -> Hash32 {
        let mut buffer = Vec::with_capacity(self.data.len() + 128);
        buffer.extend_from_slice(&self.data);
        buffer.extend_from_slice(&self.nonce.to_be_bytes());
        if let Some(target) = &self.target {
            if let Ok(bytes) = hex::decode(target) {
                buffer.extend_from_slice(&bytes);
            }
        }
        buffer.push(self.tx_type as u8);
        buffer.extend_from_slice(&u256_to_be(&self.value));
        buffer.extend_from_slice(&u256_to_be(&self.gas_limit));
        buffer.extend_from_slice(&u256_to_be(&self.gas_price));
        sha256(&buffer)
    }

    pub fn hash_bytes(&self) -> ChainResult<Hash32> {
        decode_hash(&self.hash)
    }

    pub fn sign_with(&mut self, keypair: &Keypair) {
        let hash = self.gen_hash();
        self.sign = Some(Sign::create(keypair, &hash));
        self.source = Some(address_from_public_key(&keypair.public));
    }

    /// Recover the sender address from the signature over the transaction
    /// hash. Returns the cached address when recovery already happened.
    pub fn recover_source(&mut self) -> ChainResult<Address> {
        if let Some(source) = &self.source {
            return Ok(source.clone());
        }
        let sign = self
            .sign
            .as_ref()
            .ok_or_else(|| ChainError::Crypto("transaction is unsigned".into()))?;
        let hash = self.gen_hash();
        if hex::encode(hash) != self.hash {
            return Err(ChainError::Crypto(
                "transaction hash does not match its contents".into(),
            ));
        }
        let public_key = sign.verify(&hash)?;
        let source = address_from_public_key(&public_key);
        self.source = Some(source.clone());
        Ok(source)
    }

    /// Upper bound the sender must be able to cover before replay:
    /// transferred value plus the full gas allowance.
    pub fn max_cost(&self) -> Option<U256> {
        self.gas_limit
            .checked_mul(self.gas_price)
            .and_then(|gas| gas.checked_add(self.value))
    }

    pub fn size(&self) -> usize {
        // Fixed envelope overhead plus the variable payload.
        200 + self.data.len()
    }
}

pub(crate) fn u256_to_be(value: &U256) -> [u8; 32] {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    buf
}
