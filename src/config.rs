use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use primitive_types::U256;
use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub key_path: PathBuf,
    pub umid_path: PathBuf,
    pub rpc_listen: SocketAddr,
    /// Interval between proposal attempts.
    pub block_time_ms: u64,
    pub max_block_transactions: usize,
    pub mempool_limit: usize,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    pub genesis: GenesisConfig,
}

fn default_sync_interval_ms() -> u64 {
    10_000
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        for path in [&self.key_path, &self.umid_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            key_path: PathBuf::from("./keys/node.toml"),
            umid_path: PathBuf::from("./keys/umid.hex"),
            rpc_listen: "127.0.0.1:7070".parse().expect("valid socket addr"),
            block_time_ms: 5_000,
            max_block_transactions: 512,
            mempool_limit: 8_192,
            sync_interval_ms: default_sync_interval_ms(),
            genesis: GenesisConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    /// Timestamp of the genesis header, fixed so every node derives the
    /// same genesis hash.
    pub timestamp: u64,
    pub accounts: Vec<GenesisAccount>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_id: "umid-local".to_string(),
            timestamp: 0,
            accounts: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub address: String,
    /// Decimal string so genesis balances are not capped at u64.
    pub balance: String,
    /// Hex bound hash pre-installed at genesis, the bootstrap for the
    /// first proposers.
    #[serde(default)]
    pub bound_umid_hash: Option<String>,
}

impl GenesisAccount {
    pub fn balance_value(&self) -> ChainResult<U256> {
        U256::from_dec_str(&self.balance)
            .map_err(|_| ChainError::Config(format!("invalid genesis balance {}", self.balance)))
    }
}
