use std::fs;
use std::path::Path;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{sha256, Address, UMID_LENGTH};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(stored.public_key)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

/// Load the raw machine identifier from disk, minting one on first start.
/// The raw UMID never leaves this host; only hashes derived from it do.
pub fn load_or_generate_umid(path: &Path) -> ChainResult<Vec<u8>> {
    if path.exists() {
        let raw = fs::read_to_string(path)?;
        let umid = hex::decode(raw.trim())
            .map_err(|err| ChainError::Config(format!("invalid UMID encoding: {err}")))?;
        if umid.len() != UMID_LENGTH {
            return Err(ChainError::Config(format!(
                "UMID must be {UMID_LENGTH} bytes, got {}",
                umid.len()
            )));
        }
        Ok(umid)
    } else {
        let mut umid = vec![0u8; UMID_LENGTH];
        OsRng.fill_bytes(&mut umid);
        fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
        fs::write(path, hex::encode(&umid))?;
        Ok(umid)
    }
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> ChainResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| ChainError::Crypto(format!("signature verification failed: {err}")))
}

pub fn address_from_public_key(public_key: &PublicKey) -> Address {
    hex::encode(sha256(public_key.as_bytes()))
}

pub fn public_key_from_hex(data: &str) -> ChainResult<PublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

pub fn signature_from_hex(data: &str) -> ChainResult<Signature> {
    let bytes = hex::decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid signature encoding: {err}")))?;
    Signature::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid signature bytes: {err}")))
}

pub fn signature_to_hex(signature: &Signature) -> String {
    hex::encode(signature.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keypair_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("node.toml");
        let keypair = load_or_generate_keypair(&path).expect("generate");
        let reloaded = load_or_generate_keypair(&path).expect("load");
        assert_eq!(keypair.public.to_bytes(), reloaded.public.to_bytes());
    }

    #[test]
    fn umid_is_stable_across_restarts() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("umid");
        let first = load_or_generate_umid(&path).expect("generate");
        let second = load_or_generate_umid(&path).expect("load");
        assert_eq!(first, second);
        assert_eq!(first.len(), UMID_LENGTH);
    }
}
