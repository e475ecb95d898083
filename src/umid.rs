//! UMID identity binding.
//!
//! A UMID is a 32-byte machine identifier that never leaves the node that
//! holds it. What goes on chain is the bound hash, `sha256(address || umid)`,
//! kept in the owner's account under a reserved storage key. A block
//! proposer proves possession by deriving an auth code from the bound hash
//! and the header being sealed; verifiers recompute it from chain state
//! alone.

use primitive_types::U256;

use crate::errors::{ChainError, ChainResult};
use crate::state::AccountState;
use crate::types::{sha256, Hash32, UMID_LENGTH};

/// Storage key of the bound hash inside an account. The leading zero byte
/// keeps reserved keys outside the range contracts can claim.
pub const UMID_KEY: &[u8] = b"\x00umid";
/// Storage key of the staked amount, big-endian `U256`.
pub const STAKE_KEY: &[u8] = b"\x00stake";

/// `sha256(address || umid)`, the only identity-derived value that is ever
/// published.
pub fn compute_bound_hash(address: &str, umid: &[u8; UMID_LENGTH]) -> ChainResult<Hash32> {
    let mut buffer = hex::decode(address)
        .map_err(|err| ChainError::Crypto(format!("invalid address encoding: {err}")))?;
    buffer.extend_from_slice(umid);
    Ok(sha256(&buffer))
}

/// `sha256(bound_hash || header_digest)`, fresh per block.
pub fn compute_auth_code(bound_hash: &Hash32, header_digest: &Hash32) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(64);
    buffer.extend_from_slice(bound_hash);
    buffer.extend_from_slice(header_digest);
    sha256(&buffer).to_vec()
}

/// The node's own identity: its address plus the raw UMID held on this
/// machine. The raw bytes stay inside this struct, only derived hashes
/// leave it.
pub struct UmidStore {
    address: String,
    umid: [u8; UMID_LENGTH],
}

impl UmidStore {
    pub fn new(address: String, umid: [u8; UMID_LENGTH]) -> Self {
        Self { address, umid }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_bound_hash(&self) -> ChainResult<Hash32> {
        compute_bound_hash(&self.address, &self.umid)
    }

    /// True when the on-chain binding matches the UMID this machine
    /// holds. A node whose identity moved elsewhere must not propose.
    pub fn can_propose(&self, state: &mut AccountState) -> ChainResult<bool> {
        let local = self.local_bound_hash()?;
        Ok(bound_hash_of(state, &self.address)? == Some(local))
    }

    /// Auth code for a header this node is sealing.
    pub fn generate_auth_code(&self, header_digest: &Hash32) -> ChainResult<Vec<u8>> {
        Ok(compute_auth_code(&self.local_bound_hash()?, header_digest))
    }
}

pub fn bound_hash_of(state: &mut AccountState, address: &str) -> ChainResult<Option<Hash32>> {
    match state.storage_value(address, UMID_KEY)? {
        Some(bytes) => {
            let hash: Hash32 = bytes.as_slice().try_into().map_err(|_| {
                ChainError::Crypto(format!(
                    "stored bound hash for {address} has invalid length {}",
                    bytes.len()
                ))
            })?;
            Ok(Some(hash))
        }
        None => Ok(None),
    }
}

/// Records a first-time binding. A bound account must unbind before it can
/// bind again.
pub fn bind(state: &mut AccountState, address: &str, bound_hash: &Hash32) -> ChainResult<()> {
    if bound_hash_of(state, address)?.is_some() {
        return Err(ChainError::AlreadyBound(address.to_string()));
    }
    state.set_storage(address, UMID_KEY.to_vec(), bound_hash.to_vec())
}

/// Moves an existing binding to another address: the current owner's
/// record is removed and the new owner's bound hash installed in the
/// same step. The new owner must not already carry a binding.
pub fn transform(
    state: &mut AccountState,
    from: &str,
    to: &str,
    bound_hash: &Hash32,
) -> ChainResult<()> {
    if bound_hash_of(state, from)?.is_none() {
        return Err(ChainError::AuthorityNotBound(from.to_string()));
    }
    if bound_hash_of(state, to)?.is_some() {
        return Err(ChainError::AlreadyBound(to.to_string()));
    }
    state.remove_storage(from, UMID_KEY)?;
    state.set_storage(to, UMID_KEY.to_vec(), bound_hash.to_vec())
}

pub fn unbind(state: &mut AccountState, address: &str) -> ChainResult<()> {
    if bound_hash_of(state, address)?.is_none() {
        return Err(ChainError::AuthorityNotBound(address.to_string()));
    }
    state.remove_storage(address, UMID_KEY)
}

pub fn stake_of(state: &mut AccountState, address: &str) -> ChainResult<U256> {
    match state.storage_value(address, STAKE_KEY)? {
        Some(bytes) if bytes.len() == 32 => Ok(U256::from_big_endian(&bytes)),
        Some(bytes) => Err(ChainError::Crypto(format!(
            "stored stake for {address} has invalid length {}",
            bytes.len()
        ))),
        None => Ok(U256::zero()),
    }
}

fn write_stake(state: &mut AccountState, address: &str, stake: U256) -> ChainResult<()> {
    if stake.is_zero() {
        return state.remove_storage(address, STAKE_KEY);
    }
    let mut be = [0u8; 32];
    stake.to_big_endian(&mut be);
    state.set_storage(address, STAKE_KEY.to_vec(), be.to_vec())
}

/// Moves `amount` from the account balance into its stake record.
pub fn stake_add(state: &mut AccountState, address: &str, amount: U256) -> ChainResult<()> {
    if state.balance(address)? < amount {
        return Err(ChainError::InsufficientBalance(address.to_string()));
    }
    state.sub_balance(address, amount)?;
    let stake = stake_of(state, address)?.saturating_add(amount);
    write_stake(state, address, stake)
}

/// Releases `amount` from the stake record back into the balance.
pub fn stake_reduce(state: &mut AccountState, address: &str, amount: U256) -> ChainResult<()> {
    let stake = stake_of(state, address)?;
    if stake < amount {
        return Err(ChainError::InsufficientBalance(address.to_string()));
    }
    write_stake(state, address, stake - amount)?;
    state.add_balance(address, amount)
}

/// Checks a header's auth code against the proposer's on-chain binding.
/// `header_digest` is the header hash with the auth code field zeroed out
/// of the preimage.
pub fn verify_authority(
    state: &mut AccountState,
    proposer: &str,
    header_digest: &Hash32,
    auth_code: &[u8],
) -> ChainResult<()> {
    let bound_hash = bound_hash_of(state, proposer)?
        .ok_or_else(|| ChainError::AuthorityNotBound(proposer.to_string()))?;
    let expected = compute_auth_code(&bound_hash, header_digest);
    if expected != auth_code {
        return Err(ChainError::AuthorityMismatch(proposer.to_string()));
    }
    Ok(())
}
