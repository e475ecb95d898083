use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::chain::BlockChain;
use crate::config::NodeConfig;
use crate::crypto::{address_from_public_key, load_or_generate_keypair, load_or_generate_umid};
use crate::errors::{ChainError, ChainResult};
use crate::network::{Conn, LoopbackNetwork, Network};
use crate::storage::Storage;
use crate::sync::SyncDriver;
use crate::txpool::{TransactionPool, TxPool};
use crate::types::{AddBlockResult, Address, Block, Receipt, Transaction, UMID_LENGTH};
use crate::umid::UmidStore;

/// A fully wired node: chain engine, pool, sync driver and the local
/// identity material. Cheap to hand out through [`NodeHandle`].
pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    keypair: Keypair,
    address: Address,
    umid_store: UmidStore,
    chain: Arc<BlockChain>,
    pool: Arc<TxPool>,
    sync: Arc<SyncDriver>,
    network: Arc<dyn Network>,
    block_interval: Duration,
}

/// Snapshot of the node for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub address: Address,
    pub chain_id: String,
    pub height: u64,
    pub tip_hash: String,
    pub pending_transactions: usize,
    pub peer_count: usize,
    pub sync_finished: bool,
    pub bound_umid_hash: Option<String>,
}

/// Account projection for queries. Balances and nonces default to zero
/// for addresses the chain has never seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountView {
    pub address: Address,
    pub balance: U256,
    pub nonce: u64,
    pub stake: U256,
    pub bound_umid_hash: Option<String>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        config.ensure_directories()?;
        let keypair = load_or_generate_keypair(&config.key_path)?;
        let address = address_from_public_key(&keypair.public);
        let umid_raw = load_or_generate_umid(&config.umid_path)?;
        let umid: [u8; UMID_LENGTH] = umid_raw
            .try_into()
            .map_err(|_| ChainError::Config("stored UMID has the wrong length".into()))?;
        let umid_store = UmidStore::new(address.clone(), umid);

        let storage = Storage::open(&config.data_dir.join("db"))?;
        let pool = Arc::new(TxPool::new(storage.clone(), config.mempool_limit));
        let bus = Arc::new(EventBus::new());
        let chain = Arc::new(BlockChain::open(
            storage,
            pool.clone() as Arc<dyn TransactionPool>,
            bus.clone(),
            config.genesis.clone(),
        )?);
        let network: Arc<dyn Network> =
            Arc::new(LoopbackNetwork::new(bus.clone(), address.clone()));
        let sync = Arc::new(SyncDriver::new(
            chain.clone(),
            pool.clone() as Arc<dyn TransactionPool>,
            network.clone(),
            bus,
        ));

        let inner = Arc::new(NodeInner {
            block_interval: Duration::from_millis(config.block_time_ms),
            config,
            keypair,
            address,
            umid_store,
            chain,
            pool,
            sync,
            network,
        });
        Ok(Self { inner })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    pub async fn start(self) -> ChainResult<()> {
        self.inner.run().await
    }
}

impl NodeHandle {
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Validates and pools a transaction, then gossips it. Returns the
    /// transaction hash accepted into the pool.
    pub fn submit_transaction(&self, tx: Transaction) -> ChainResult<String> {
        let hash = tx.hash.clone();
        let broadcast = tx.clone();
        if !self.inner.pool.add_transaction(tx)? {
            return Err(ChainError::Transaction(
                "transaction already queued".into(),
            ));
        }
        if let Err(err) = self.inner.sync.broadcast_transaction(&broadcast) {
            warn!(%hash, %err, "transaction gossip failed");
        }
        Ok(hash)
    }

    pub fn node_status(&self) -> ChainResult<NodeStatus> {
        let tip = self.inner.chain.query_top_block();
        Ok(NodeStatus {
            address: self.inner.address.clone(),
            chain_id: self.inner.chain.chain_id().to_string(),
            height: tip.height,
            tip_hash: tip.hash,
            pending_transactions: self.inner.pool.pending_count(),
            peer_count: self.inner.network.peer_count(),
            sync_finished: self.inner.chain.sync_finished(),
            bound_umid_hash: self.inner.chain.account_bound_hash(&self.inner.address)?,
        })
    }

    pub fn latest_block(&self) -> ChainResult<Option<Block>> {
        let tip = self.inner.chain.query_top_block();
        self.inner.chain.query_block_by_height(tip.height)
    }

    pub fn get_block(&self, height: u64) -> ChainResult<Option<Block>> {
        self.inner.chain.query_block_by_height(height)
    }

    pub fn get_block_by_hash(&self, hash: &str) -> ChainResult<Option<Block>> {
        self.inner.chain.query_block_by_hash(hash)
    }

    /// Looks for the transaction in the pending pool first, then in
    /// committed blocks via its receipt.
    pub fn get_transaction(&self, hash: &str) -> ChainResult<Option<Transaction>> {
        if let Some(tx) = self.inner.pool.get_transaction(hash) {
            return Ok(Some(tx));
        }
        let Some(receipt) = self.inner.chain.get_receipt(hash)? else {
            return Ok(None);
        };
        let Some(block) = self.inner.chain.query_block_by_height(receipt.height)? else {
            return Ok(None);
        };
        Ok(block
            .transactions
            .into_iter()
            .find(|tx| tx.hash == hash))
    }

    pub fn conn_info(&self) -> Vec<Conn> {
        self.inner.network.conn_info()
    }

    pub fn get_receipt(&self, tx_hash: &str) -> ChainResult<Option<Receipt>> {
        self.inner.chain.get_receipt(tx_hash)
    }

    pub fn get_account(&self, address: &str) -> ChainResult<AccountView> {
        Ok(AccountView {
            address: address.to_string(),
            balance: self.inner.chain.account_balance(address)?,
            nonce: self.inner.chain.account_nonce(address)?,
            stake: self.inner.chain.account_stake(address)?,
            bound_umid_hash: self.inner.chain.account_bound_hash(address)?,
        })
    }
}

impl NodeInner {
    async fn run(self: Arc<Self>) -> ChainResult<()> {
        info!(address = %self.address, "starting node");
        self.sync
            .start(Duration::from_millis(self.config.sync_interval_ms));

        let mut ticker = time::interval(self.block_interval);
        loop {
            ticker.tick().await;
            if !self.chain.sync_finished() {
                debug!("skipping proposal while syncing");
                continue;
            }
            if let Err(err) = self.propose_block() {
                match err {
                    ChainError::AuthorityNotBound(_) => {
                        debug!("local identity not bound, not proposing")
                    }
                    err => warn!(%err, "block proposal failed"),
                }
            }
        }
    }

    fn propose_block(&self) -> ChainResult<()> {
        let block = self.chain.cast_block(
            &self.keypair,
            &self.umid_store,
            self.config.max_block_transactions,
        )?;
        match self.chain.add_block_on_chain(None, block.clone()) {
            AddBlockResult::Success => {
                if let Err(err) = self.sync.broadcast_block(&block) {
                    warn!(%err, "block broadcast failed");
                }
                Ok(())
            }
            AddBlockResult::AlreadyExists => Ok(()),
            AddBlockResult::Failed => Err(ChainError::Fork(format!(
                "locally cast block {} was rejected",
                block.header.hash
            ))),
        }
    }
}
