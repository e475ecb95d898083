//! Chain engine.
//!
//! All mutations of the canonical chain funnel through a single
//! insertion lock. An incoming block moves through the pipeline
//! decode -> shape checks -> authority check -> ordered replay -> commit,
//! and any failure along the way rejects it without touching committed
//! state. Fork choice is by strictly greater cumulative difficulty; a
//! winning side chain rewinds the canonical chain to the common ancestor
//! and returns abandoned transactions to the pool.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ed25519_dalek::Keypair;
use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, Notification, Payload, TOPIC_BLOCK_ADD_SUCC};
use crate::config::GenesisConfig;
use crate::crypto::address_from_public_key;
use crate::errors::{ChainError, ChainResult};
use crate::state::AccountState;
use crate::storage::Storage;
use crate::txpool::{recover_and_validate_tx, TransactionPool};
use crate::types::{
    compute_merkle_root, AddBlockResult, Block, BlockHeader, BlockMetadata, Receipt,
    ReceiptStatus, Transaction, TxType, UMID_LENGTH,
};
use crate::umid::{self, UmidStore};

/// Flat reward credited to the proposer on top of collected fees.
pub const BASE_BLOCK_REWARD: u64 = 40;
/// Gas charged for the envelope of any transaction; payload bytes are
/// charged on top.
pub const TX_BASE_GAS: u64 = 1_000;
pub const INITIAL_BASE_TARGET: u64 = 18_325_193_796;
/// Cap on blocks returned by the batch getters.
pub const MAX_BATCH_BLOCKS: usize = 50;
const FORK_CACHE_LIMIT: usize = 512;

fn block_difficulty(base_target: u64) -> U256 {
    U256::from(u64::MAX) / U256::from(base_target.max(1))
}

enum InsertOutcome {
    Committed,
    AlreadyExists,
    /// Accepted onto a known side branch without outweighing the tip.
    SideChain,
}

pub struct BlockChain {
    storage: Storage,
    pool: Arc<dyn TransactionPool>,
    bus: Arc<EventBus>,
    genesis: GenesisConfig,
    insert_lock: Mutex<()>,
    tip: RwLock<BlockHeader>,
    /// Blocks off the canonical chain, kept so a later heavier child can
    /// walk back to a common ancestor.
    fork_cache: RwLock<HashMap<String, Block>>,
    adjusting: AtomicBool,
    syncing: AtomicBool,
}

impl BlockChain {
    pub fn open(
        storage: Storage,
        pool: Arc<dyn TransactionPool>,
        bus: Arc<EventBus>,
        genesis: GenesisConfig,
    ) -> ChainResult<Self> {
        let tip_header = match storage.tip()? {
            Some(metadata) => storage
                .read_block(metadata.height)?
                .ok_or_else(|| ChainError::Config("tip metadata without a tip block".into()))?
                .header,
            None => Self::build_genesis(&storage, &genesis)?,
        };
        info!(
            height = tip_header.height,
            hash = %tip_header.hash,
            chain_id = %genesis.chain_id,
            "chain opened"
        );
        Ok(Self {
            storage,
            pool,
            bus,
            genesis,
            insert_lock: Mutex::new(()),
            tip: RwLock::new(tip_header),
            fork_cache: RwLock::new(HashMap::new()),
            adjusting: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
        })
    }

    fn build_genesis(storage: &Storage, genesis: &GenesisConfig) -> ChainResult<BlockHeader> {
        let mut state = AccountState::new(Arc::new(storage.clone()));
        apply_genesis_allocations(&mut state, genesis)?;
        let state_root = state.commit()?;

        let mut header = BlockHeader::new(
            0,
            hex::encode([0u8; 32]),
            hex::encode([0u8; 32]),
            0,
            hex::encode(compute_merkle_root(&[])),
            hex::encode(compute_merkle_root(&[])),
            hex::encode(state_root),
            INITIAL_BASE_TARGET,
            U256::zero(),
        );
        header.cur_time = genesis.timestamp;
        header.hash = hex::encode(header.gen_hash()?);
        let block = Block {
            header: header.clone(),
            transactions: Vec::new(),
        };
        storage.store_block(&block)?;
        info!(hash = %header.hash, "genesis block created");
        Ok(header)
    }

    /// Entry point for every block, local or remote. Never panics on bad
    /// input; failures reject the block and leave the chain untouched.
    pub fn add_block_on_chain(&self, source: Option<&str>, block: Block) -> AddBlockResult {
        let hash = block.header.hash.clone();
        let height = block.header.height;
        let _guard = self.insert_lock.lock();
        match self.insert_locked(block) {
            Ok(InsertOutcome::Committed) => {
                info!(height, %hash, source = source.unwrap_or("local"), "block committed");
                AddBlockResult::Success
            }
            Ok(InsertOutcome::AlreadyExists) => AddBlockResult::AlreadyExists,
            Ok(InsertOutcome::SideChain) => {
                debug!(height, %hash, "block accepted on a side chain");
                AddBlockResult::Success
            }
            Err(err) => {
                warn!(height, %hash, source = source.unwrap_or("local"), %err, "block rejected");
                AddBlockResult::Failed
            }
        }
    }

    fn insert_locked(&self, block: Block) -> ChainResult<InsertOutcome> {
        if self.has_block(&block.header.hash)?
            || self.fork_cache.read().contains_key(&block.header.hash)
        {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.validate_shape(&block)?;

        let tip = self.tip.read().clone();
        if block.header.pre_hash == tip.hash {
            self.extend_tip(&tip, block)?;
            return Ok(InsertOutcome::Committed);
        }

        // Off-tip block: remember it, switch only if it outweighs us.
        self.remember_fork_block(block.clone());
        if !block.header.more_weight_than(&tip) {
            return Ok(InsertOutcome::SideChain);
        }
        self.reorganize(block)
    }

    /// Structural checks that need no state: hash integrity, proposer
    /// signature and the transaction tree.
    fn validate_shape(&self, block: &Block) -> ChainResult<()> {
        let computed = hex::encode(block.header.gen_hash()?);
        if computed != block.header.hash {
            return Err(ChainError::Crypto(
                "header hash does not match its contents".into(),
            ));
        }
        let public_key = block.header.verify_sign()?;
        if address_from_public_key(&public_key) != block.header.proposer {
            return Err(ChainError::Crypto(
                "header signer is not the declared proposer".into(),
            ));
        }
        block.verify_tx_tree()
    }

    /// Appends a block whose parent is the current tip.
    fn extend_tip(&self, parent: &BlockHeader, block: Block) -> ChainResult<()> {
        let header = &block.header;
        if header.height != parent.height + 1 {
            return Err(ChainError::Fork(format!(
                "height {} does not follow parent height {}",
                header.height, parent.height
            )));
        }
        if header.cur_time < parent.cur_time {
            return Err(ChainError::Fork("block time precedes its parent".into()));
        }
        // No retargeting exists; a header claiming its own base target
        // could otherwise mint arbitrary difficulty.
        if header.base_target != parent.base_target {
            return Err(ChainError::Fork(format!(
                "base target {} does not match the parent's {}",
                header.base_target, parent.base_target
            )));
        }
        let expected_difficulty =
            parent.cumulative_difficulty + block_difficulty(header.base_target);
        if header.cumulative_difficulty != expected_difficulty {
            return Err(ChainError::Fork(format!(
                "cumulative difficulty {} does not extend the parent",
                header.cumulative_difficulty
            )));
        }

        let mut state = AccountState::new(Arc::new(self.storage.clone()));
        let digest = header.pre_auth_hash()?;
        umid::verify_authority(&mut state, &header.proposer, &digest, &header.auth_code)?;

        let receipts = execute_block(&mut state, &block)?;
        let receipt_root = receipt_merkle_root(&receipts);
        if hex::encode(receipt_root) != header.receipt_tree {
            return Err(ChainError::Fork("receipt root mismatch".into()));
        }
        let state_root = state.root()?;
        if hex::encode(state_root) != header.state_tree {
            return Err(ChainError::Fork("state root mismatch".into()));
        }

        state.commit()?;
        self.storage.store_block(&block)?;
        self.pool.save_receipts(&receipts)?;
        self.pool.remove_from_pool(&block.transactions);
        self.fork_cache.write().remove(&block.header.hash);
        *self.tip.write() = block.header.clone();
        self.bus.publish(Notification::local(
            TOPIC_BLOCK_ADD_SUCC,
            Payload::Block(Arc::new(block)),
        ));
        Ok(())
    }

    fn remember_fork_block(&self, block: Block) {
        let tip_height = self.tip.read().height;
        let mut cache = self.fork_cache.write();
        if cache.len() >= FORK_CACHE_LIMIT {
            cache.retain(|_hash, cached| cached.header.height + 64 > tip_height);
        }
        if cache.len() < FORK_CACHE_LIMIT {
            cache.insert(block.header.hash.clone(), block);
        }
    }

    /// Switches to the fork ending in `target`. The divergent suffix is
    /// collected by walking `pre_hash` links through the fork cache until
    /// a canonical ancestor appears.
    fn reorganize(&self, target: Block) -> ChainResult<InsertOutcome> {
        self.adjusting.store(true, Ordering::SeqCst);
        let result = self.reorganize_inner(target);
        self.adjusting.store(false, Ordering::SeqCst);
        result
    }

    fn reorganize_inner(&self, target: Block) -> ChainResult<InsertOutcome> {
        let target_hash = target.header.hash.clone();
        let mut suffix = vec![target];
        let ancestor_height = loop {
            let pre_hash = suffix
                .last()
                .map(|block| block.header.pre_hash.clone())
                .unwrap_or_default();
            if let Some(on_chain) = self.storage.read_block_by_hash(&pre_hash)? {
                break on_chain.header.height;
            }
            let cached = self
                .fork_cache
                .read()
                .get(&pre_hash)
                .cloned()
                .ok_or_else(|| ChainError::Fork(format!("unknown ancestor {pre_hash}")))?;
            suffix.push(cached);
        };
        suffix.reverse();
        info!(
            ancestor_height,
            suffix_len = suffix.len(),
            target = %target_hash,
            "switching to a heavier fork"
        );

        let abandoned = self.rewind_to(ancestor_height)?;
        let mut applied = Vec::new();
        for block in suffix {
            let parent = self.tip.read().clone();
            match self
                .validate_shape(&block)
                .and_then(|_| self.extend_tip(&parent, block.clone()))
            {
                Ok(()) => applied.push(block),
                Err(err) => {
                    warn!(%err, "fork block failed during switch, restoring canonical chain");
                    self.restore_canonical(ancestor_height, &abandoned)?;
                    return Err(err);
                }
            }
        }

        // Transactions the old chain had that the new one does not go
        // back to the pool; their receipts are no longer valid.
        let kept: HashSet<&str> = applied
            .iter()
            .flat_map(|block| block.transactions.iter().map(|tx| tx.hash.as_str()))
            .collect();
        let mut returned = Vec::new();
        let mut dead_receipts = Vec::new();
        for block in &abandoned {
            for tx in &block.transactions {
                if !kept.contains(tx.hash.as_str()) {
                    dead_receipts.push(tx.hash.clone());
                    returned.push(tx.clone());
                }
            }
        }
        self.pool.delete_receipts(&dead_receipts)?;
        self.pool.back_to_pool(returned);
        Ok(InsertOutcome::Committed)
    }

    /// Truncates the canonical chain down to `height` and rebuilds the
    /// account state by replaying what remains. Returns the blocks that
    /// were cut off, newest last.
    fn rewind_to(&self, height: u64) -> ChainResult<Vec<Block>> {
        let abandoned = self.storage.truncate_above(height)?;
        let ancestor = self
            .storage
            .read_block(height)?
            .ok_or_else(|| ChainError::Fork(format!("missing ancestor at height {height}")))?;
        self.storage.set_tip(&BlockMetadata::from(&ancestor))?;
        *self.tip.write() = ancestor.header;
        self.rebuild_state()?;
        Ok(abandoned)
    }

    fn restore_canonical(&self, ancestor_height: u64, abandoned: &[Block]) -> ChainResult<()> {
        self.rewind_to(ancestor_height)?;
        for block in abandoned {
            let parent = self.tip.read().clone();
            self.extend_tip(&parent, block.clone())?;
        }
        Ok(())
    }

    /// Replays every canonical block from genesis into a fresh account
    /// state. Blocks on the canonical chain were fully validated when
    /// they were committed, so only the replay itself runs here.
    fn rebuild_state(&self) -> ChainResult<()> {
        self.storage.clear_accounts()?;
        let mut state = AccountState::new(Arc::new(self.storage.clone()));
        apply_genesis_allocations(&mut state, &self.genesis)?;
        for block in self.storage.load_blockchain()?.iter().skip(1) {
            execute_block(&mut state, block)?;
        }
        state.commit()?;
        Ok(())
    }

    /// Builds and seals the next block from pool contents. The caller
    /// feeds the result back through [`BlockChain::add_block_on_chain`].
    pub fn cast_block(
        &self,
        keypair: &Keypair,
        umid_store: &UmidStore,
        max_txs: usize,
    ) -> ChainResult<Block> {
        let _guard = self.insert_lock.lock();
        let tip = self.tip.read().clone();
        let mut state = AccountState::new(Arc::new(self.storage.clone()));
        if !umid_store.can_propose(&mut state)? {
            return Err(ChainError::AuthorityNotBound(
                umid_store.address().to_string(),
            ));
        }

        let proposer = umid_store.address().to_string();
        let height = tip.height + 1;
        let mut included = Vec::new();
        let mut receipts = Vec::new();
        let mut cumulative_gas = 0u64;
        let mut skipped_senders: HashSet<String> = HashSet::new();
        for mut tx in self.pool.pack_for_cast(max_txs) {
            let source = match recover_and_validate_tx(&mut tx) {
                Ok(source) => source,
                Err(err) => {
                    debug!(hash = %tx.hash, %err, "skipping invalid pooled transaction");
                    continue;
                }
            };
            // A sender with a nonce gap stalls; later nonces cannot run.
            if skipped_senders.contains(&source) || state.nonce(&source)? != tx.nonce {
                skipped_senders.insert(source);
                continue;
            }
            let receipt = apply_transaction(
                &mut state,
                &tx,
                &source,
                height,
                included.len() as u16,
                &proposer,
                &mut cumulative_gas,
            )?;
            receipts.push(receipt);
            included.push(tx);
        }
        state.add_balance(&proposer, U256::from(BASE_BLOCK_REWARD))?;

        let tx_hashes = included
            .iter()
            .map(|tx| tx.hash_bytes())
            .collect::<ChainResult<Vec<_>>>()?;
        let state_root = state.root()?;
        state.discard();

        let mut header = BlockHeader::new(
            height,
            tip.hash.clone(),
            proposer,
            0,
            hex::encode(compute_merkle_root(&tx_hashes)),
            hex::encode(receipt_merkle_root(&receipts)),
            hex::encode(state_root),
            tip.base_target,
            tip.cumulative_difficulty + block_difficulty(tip.base_target),
        );
        if header.cur_time < tip.cur_time {
            header.cur_time = tip.cur_time;
        }
        let digest = header.pre_auth_hash()?;
        header.auth_code = umid_store.generate_auth_code(&digest)?;
        header.seal(keypair)?;

        Ok(Block {
            header,
            transactions: included,
        })
    }

    pub fn query_top_block(&self) -> BlockHeader {
        self.tip.read().clone()
    }

    pub fn query_block_by_height(&self, height: u64) -> ChainResult<Option<Block>> {
        self.storage.read_block(height)
    }

    pub fn query_block_by_hash(&self, hash: &str) -> ChainResult<Option<Block>> {
        self.storage.read_block_by_hash(hash)
    }

    pub fn has_block(&self, hash: &str) -> ChainResult<bool> {
        Ok(self.storage.read_block_by_hash(hash)?.is_some())
    }

    pub fn has_height(&self, height: u64) -> ChainResult<bool> {
        Ok(height <= self.tip.read().height)
    }

    /// Up to `limit` consecutive blocks strictly after `height`, gap-free.
    pub fn batch_get_blocks_after_height(
        &self,
        height: u64,
        limit: usize,
    ) -> ChainResult<Vec<Block>> {
        let limit = limit.min(MAX_BATCH_BLOCKS);
        let mut blocks = Vec::new();
        for offset in 1..=limit as u64 {
            match self.storage.read_block(height + offset)? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }
        Ok(blocks)
    }

    pub fn batch_get_block_headers_after_height(
        &self,
        height: u64,
        limit: usize,
    ) -> ChainResult<Vec<BlockHeader>> {
        Ok(self
            .batch_get_blocks_after_height(height, limit)?
            .into_iter()
            .map(|block| block.header)
            .collect())
    }

    pub fn is_adjusting(&self) -> bool {
        self.adjusting.load(Ordering::SeqCst)
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.syncing.store(syncing, Ordering::SeqCst);
    }

    pub fn sync_finished(&self) -> bool {
        !self.syncing.load(Ordering::SeqCst) && !self.is_adjusting()
    }

    pub fn chain_id(&self) -> &str {
        &self.genesis.chain_id
    }

    pub fn account_balance(&self, address: &str) -> ChainResult<U256> {
        let mut state = AccountState::new(Arc::new(self.storage.clone()));
        state.balance(address)
    }

    pub fn account_nonce(&self, address: &str) -> ChainResult<u64> {
        let mut state = AccountState::new(Arc::new(self.storage.clone()));
        state.nonce(address)
    }

    pub fn account_bound_hash(&self, address: &str) -> ChainResult<Option<String>> {
        let mut state = AccountState::new(Arc::new(self.storage.clone()));
        Ok(umid::bound_hash_of(&mut state, address)?.map(hex::encode))
    }

    pub fn account_stake(&self, address: &str) -> ChainResult<U256> {
        let mut state = AccountState::new(Arc::new(self.storage.clone()));
        umid::stake_of(&mut state, address)
    }

    pub fn get_receipt(&self, tx_hash: &str) -> ChainResult<Option<Receipt>> {
        self.pool.get_receipt(tx_hash)
    }
}

fn apply_genesis_allocations(state: &mut AccountState, genesis: &GenesisConfig) -> ChainResult<()> {
    for account in &genesis.accounts {
        state.add_balance(&account.address, account.balance_value()?)?;
        if let Some(bound) = &account.bound_umid_hash {
            let bytes = hex::decode(bound)
                .map_err(|err| ChainError::Config(format!("invalid genesis bound hash: {err}")))?;
            let hash: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("genesis bound hash must be 32 bytes".into()))?;
            umid::bind(state, &account.address, &hash)?;
        }
    }
    Ok(())
}

fn receipt_merkle_root(receipts: &[Receipt]) -> [u8; 32] {
    let leaves: Vec<_> = receipts.iter().map(|receipt| receipt.gen_hash()).collect();
    compute_merkle_root(&leaves)
}

/// Replays a block's transactions in order, strict nonce equality per
/// sender, and credits the proposer reward. Structural failures abort
/// with an error, economic failures produce a downgraded receipt.
fn execute_block(state: &mut AccountState, block: &Block) -> ChainResult<Vec<Receipt>> {
    let mut receipts = Vec::with_capacity(block.transactions.len());
    let mut cumulative_gas = 0u64;
    for (index, tx) in block.transactions.iter().enumerate() {
        let mut tx = tx.clone();
        let source = recover_and_validate_tx(&mut tx)?;
        let expected = state.nonce(&source)?;
        if tx.nonce != expected {
            return Err(ChainError::NonceMismatch {
                address: source,
                expected,
                got: tx.nonce,
            });
        }
        let receipt = apply_transaction(
            state,
            &tx,
            &source,
            block.header.height,
            index as u16,
            &block.header.proposer,
            &mut cumulative_gas,
        )?;
        receipts.push(receipt);
    }
    state.add_balance(&block.header.proposer, U256::from(BASE_BLOCK_REWARD))?;
    Ok(receipts)
}

/// Applies a single transaction whose nonce already matched. The nonce
/// advances even when execution fails, so a failed transaction cannot be
/// replayed.
fn apply_transaction(
    state: &mut AccountState,
    tx: &Transaction,
    source: &str,
    height: u64,
    index: u16,
    proposer: &str,
    cumulative_gas: &mut u64,
) -> ChainResult<Receipt> {
    let next_nonce = tx.nonce + 1;
    let gas_used = TX_BASE_GAS + tx.data.len() as u64;

    if U256::from(gas_used) > tx.gas_limit {
        state.set_nonce(source, next_nonce)?;
        return Ok(Receipt::new(
            ReceiptStatus::Fail,
            *cumulative_gas,
            tx.hash.clone(),
            height,
            index,
        ));
    }
    let max_cost = tx
        .max_cost()
        .ok_or_else(|| ChainError::Transaction(format!("cost overflow in {}", tx.hash)))?;
    if state.balance(source)? < max_cost {
        state.set_nonce(source, next_nonce)?;
        return Ok(Receipt::new(
            ReceiptStatus::BalanceNotEnough,
            *cumulative_gas,
            tx.hash.clone(),
            height,
            index,
        ));
    }

    let fee = U256::from(gas_used) * tx.gas_price;
    state.sub_balance(source, fee)?;
    state.add_balance(proposer, fee)?;
    state.set_nonce(source, next_nonce)?;
    *cumulative_gas += gas_used;

    let snap = state.snapshot();
    let status = match dispatch_tx(state, tx, source) {
        Ok(status) => status,
        Err(err) if err.is_structural() => return Err(err),
        Err(err) => {
            state.revert_to_snapshot(snap);
            debug!(hash = %tx.hash, %err, "transaction failed during replay");
            ReceiptStatus::Fail
        }
    };
    Ok(Receipt::new(
        status,
        *cumulative_gas,
        tx.hash.clone(),
        height,
        index,
    ))
}

fn payload_hash(data: &[u8]) -> Option<[u8; UMID_LENGTH]> {
    data.try_into().ok()
}

fn dispatch_tx(
    state: &mut AccountState,
    tx: &Transaction,
    source: &str,
) -> ChainResult<ReceiptStatus> {
    match tx.tx_type {
        TxType::Transfer => {
            let Some(target) = &tx.target else {
                return Ok(ReceiptStatus::ParseFail);
            };
            state.transfer(source, target, tx.value)?;
            Ok(ReceiptStatus::Success)
        }
        TxType::BindUmid => {
            let Some(hash) = payload_hash(&tx.data) else {
                return Ok(ReceiptStatus::ParseFail);
            };
            umid::bind(state, source, &hash)?;
            Ok(ReceiptStatus::Success)
        }
        TxType::TransformUmid => {
            let Some(target) = &tx.target else {
                return Ok(ReceiptStatus::ParseFail);
            };
            let Some(hash) = payload_hash(&tx.data) else {
                return Ok(ReceiptStatus::ParseFail);
            };
            umid::transform(state, source, target, &hash)?;
            Ok(ReceiptStatus::Success)
        }
        TxType::UnbindUmid => {
            umid::unbind(state, source)?;
            Ok(ReceiptStatus::Success)
        }
        TxType::StakeAdd => {
            umid::stake_add(state, source, tx.value)?;
            Ok(ReceiptStatus::Success)
        }
        TxType::StakeReduce => {
            umid::stake_reduce(state, source, tx.value)?;
            Ok(ReceiptStatus::Success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisAccount;
    use crate::crypto::generate_keypair;
    use crate::txpool::TxPool;
    use tempfile::TempDir;

    struct Node {
        chain: BlockChain,
        pool: Arc<TxPool>,
        keypair: Keypair,
        umid_store: UmidStore,
        _dir: TempDir,
    }

    fn genesis_for(entries: &[(&str, u64, Option<[u8; 32]>)]) -> GenesisConfig {
        GenesisConfig {
            chain_id: "umid-test".into(),
            timestamp: 0,
            accounts: entries
                .iter()
                .map(|(address, balance, bound)| GenesisAccount {
                    address: address.to_string(),
                    balance: balance.to_string(),
                    bound_umid_hash: bound.map(hex::encode),
                })
                .collect(),
        }
    }

    fn node_with_genesis(genesis: GenesisConfig, keypair: Keypair, umid: [u8; 32]) -> Node {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open storage");
        let pool = Arc::new(TxPool::new(storage.clone(), 1_000));
        let bus = Arc::new(EventBus::new());
        let address = address_from_public_key(&keypair.public);
        let chain = BlockChain::open(storage, pool.clone(), bus, genesis).expect("open chain");
        Node {
            chain,
            pool,
            keypair,
            umid_store: UmidStore::new(address, umid),
            _dir: dir,
        }
    }

    /// A node whose proposer is funded and bound at genesis.
    fn bound_node() -> Node {
        let keypair = generate_keypair();
        let umid = [9u8; 32];
        let address = address_from_public_key(&keypair.public);
        let bound = umid::compute_bound_hash(&address, &umid).unwrap();
        let genesis = genesis_for(&[(&address, 1_000_000_000, Some(bound))]);
        node_with_genesis(genesis, keypair, umid)
    }

    fn transfer_tx(keypair: &Keypair, nonce: u64, target: &str, value: u64) -> Transaction {
        let mut tx = Transaction::new(
            Vec::new(),
            U256::from(value),
            nonce,
            Some(target.to_string()),
            TxType::Transfer,
            U256::from(50_000u64),
            U256::from(1u64),
        );
        tx.sign_with(keypair);
        tx
    }

    #[test]
    fn genesis_is_deterministic_across_nodes() {
        let keypair_a = generate_keypair();
        let keypair_b = generate_keypair();
        let genesis = genesis_for(&[(&"ab".repeat(32), 1_000, None)]);
        let a = node_with_genesis(genesis.clone(), keypair_a, [1u8; 32]);
        let b = node_with_genesis(genesis, keypair_b, [2u8; 32]);
        assert_eq!(
            a.chain.query_top_block().hash,
            b.chain.query_top_block().hash
        );
    }

    #[test]
    fn cast_commit_applies_transfers_and_drains_the_pool() {
        let node = bound_node();
        let recipient = "ee".repeat(32);
        let tx = transfer_tx(&node.keypair, 0, &recipient, 12_345);
        let tx_hash = tx.hash.clone();
        node.pool.add_transaction(tx).unwrap();

        let block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Success
        );

        assert_eq!(
            node.chain.account_balance(&recipient).unwrap(),
            U256::from(12_345u64)
        );
        assert_eq!(
            node.chain.account_nonce(node.umid_store.address()).unwrap(),
            1
        );
        assert!(!node.pool.contains(&tx_hash));
        let receipt = node.chain.get_receipt(&tx_hash).unwrap().expect("receipt");
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert_eq!(receipt.height, 1);
    }

    #[test]
    fn insertion_is_idempotent_by_hash() {
        let node = bound_node();
        let block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        assert_eq!(
            node.chain.add_block_on_chain(None, block.clone()),
            AddBlockResult::Success
        );
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::AlreadyExists
        );
        assert_eq!(node.chain.query_top_block().height, 1);
    }

    #[test]
    fn unbound_proposer_cannot_cast() {
        let keypair = generate_keypair();
        let address = address_from_public_key(&keypair.public);
        // Funded but never bound.
        let genesis = genesis_for(&[(&address, 1_000_000, None)]);
        let node = node_with_genesis(genesis, keypair, [3u8; 32]);
        assert!(matches!(
            node.chain.cast_block(&node.keypair, &node.umid_store, 10),
            Err(ChainError::AuthorityNotBound(_))
        ));
    }

    #[test]
    fn tampered_auth_code_fails_the_authority_gate() {
        let node = bound_node();
        let mut block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        block.header.auth_code[0] ^= 0xff;
        // Reseal so the shape checks pass and only authority can reject.
        block.header.seal(&node.keypair).unwrap();
        assert_eq!(
            node.chain.add_block_on_chain(Some("peer"), block),
            AddBlockResult::Failed
        );
        assert_eq!(node.chain.query_top_block().height, 0);
    }

    #[test]
    fn nonce_gap_aborts_the_whole_block() {
        let node = bound_node();
        let recipient = "ee".repeat(32);
        // Nonce 4 while the account is at 0.
        let gap_tx = transfer_tx(&node.keypair, 4, &recipient, 1);
        let tip = node.chain.query_top_block();
        let tx_root = compute_merkle_root(&[gap_tx.hash_bytes().unwrap()]);
        let mut header = BlockHeader::new(
            1,
            tip.hash.clone(),
            node.umid_store.address().to_string(),
            0,
            hex::encode(tx_root),
            hex::encode(compute_merkle_root(&[])),
            tip.state_tree.clone(),
            tip.base_target,
            tip.cumulative_difficulty + block_difficulty(tip.base_target),
        );
        let digest = header.pre_auth_hash().unwrap();
        header.auth_code = node.umid_store.generate_auth_code(&digest).unwrap();
        header.seal(&node.keypair).unwrap();
        let block = Block {
            header,
            transactions: vec![gap_tx],
        };
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Failed
        );
        assert_eq!(node.chain.query_top_block().height, 0);
    }

    #[test]
    fn forged_base_target_is_rejected() {
        let node = bound_node();
        let tip = node.chain.query_top_block();
        let mut block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        // Claim a tiny target so the block carries enormous difficulty,
        // keeping every other check consistent with the forged value.
        block.header.base_target = 1;
        block.header.cumulative_difficulty = tip.cumulative_difficulty + block_difficulty(1);
        let digest = block.header.pre_auth_hash().unwrap();
        block.header.auth_code = node.umid_store.generate_auth_code(&digest).unwrap();
        block.header.seal(&node.keypair).unwrap();
        assert_eq!(
            node.chain.add_block_on_chain(Some("peer"), block),
            AddBlockResult::Failed
        );
        assert_eq!(node.chain.query_top_block().height, 0);
    }

    #[test]
    fn duplicate_nonce_aborts_the_whole_block() {
        let node = bound_node();
        let recipient = "ee".repeat(32);
        // Two transactions both spending nonce 0.
        let first = transfer_tx(&node.keypair, 0, &recipient, 1);
        let replay = transfer_tx(&node.keypair, 0, &recipient, 2);
        let tip = node.chain.query_top_block();
        let tx_root = compute_merkle_root(&[
            first.hash_bytes().unwrap(),
            replay.hash_bytes().unwrap(),
        ]);
        let mut header = BlockHeader::new(
            1,
            tip.hash.clone(),
            node.umid_store.address().to_string(),
            0,
            hex::encode(tx_root),
            hex::encode(compute_merkle_root(&[])),
            tip.state_tree.clone(),
            tip.base_target,
            tip.cumulative_difficulty + block_difficulty(tip.base_target),
        );
        let digest = header.pre_auth_hash().unwrap();
        header.auth_code = node.umid_store.generate_auth_code(&digest).unwrap();
        header.seal(&node.keypair).unwrap();
        let block = Block {
            header,
            transactions: vec![first, replay],
        };
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Failed
        );
        assert_eq!(node.chain.query_top_block().height, 0);
    }

    #[test]
    fn insufficient_balance_downgrades_the_receipt_but_keeps_the_block() {
        let keypair = generate_keypair();
        let umid = [4u8; 32];
        let address = address_from_public_key(&keypair.public);
        let bound = umid::compute_bound_hash(&address, &umid).unwrap();
        // Enough for fees, nowhere near enough for the transfer below.
        let genesis = genesis_for(&[(&address, 100_000, Some(bound))]);
        let node = node_with_genesis(genesis, keypair, umid);

        let tx = transfer_tx(&node.keypair, 0, &"ee".repeat(32), 50_000_000);
        let tx_hash = tx.hash.clone();
        node.pool.add_transaction(tx).unwrap();

        let block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Success
        );
        let receipt = node.chain.get_receipt(&tx_hash).unwrap().expect("receipt");
        assert_eq!(receipt.status, ReceiptStatus::BalanceNotEnough);
        // The nonce still advanced so the transaction cannot replay.
        assert_eq!(
            node.chain.account_nonce(node.umid_store.address()).unwrap(),
            1
        );
    }

    #[test]
    fn bind_lifecycle_through_blocks() {
        let node = bound_node();
        let user = generate_keypair();
        let user_address = address_from_public_key(&user.public);
        let user_umid = [5u8; 32];
        let first = umid::compute_bound_hash(&user_address, &user_umid).unwrap();
        let second = umid::compute_bound_hash(&user_address, &[6u8; 32]).unwrap();

        // Fund the user first.
        let fund = transfer_tx(&node.keypair, 0, &user_address, 10_000_000);
        node.pool.add_transaction(fund).unwrap();
        let block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Success
        );

        let umid_tx = |nonce: u64, tx_type: TxType, data: Vec<u8>| {
            let mut tx = Transaction::new(
                data,
                U256::zero(),
                nonce,
                None,
                tx_type,
                U256::from(50_000u64),
                U256::from(1u64),
            );
            tx.sign_with(&user);
            tx
        };

        // bind, rebind (fails), unbind, bind again.
        let bind1 = umid_tx(0, TxType::BindUmid, first.to_vec());
        let rebind = umid_tx(1, TxType::BindUmid, second.to_vec());
        let unbind = umid_tx(2, TxType::UnbindUmid, Vec::new());
        let bind2 = umid_tx(3, TxType::BindUmid, second.to_vec());
        let rebind_hash = rebind.hash.clone();
        for tx in [bind1, rebind, unbind, bind2] {
            node.pool.add_transaction(tx).unwrap();
        }

        let block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        assert_eq!(block.transactions.len(), 4);
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Success
        );

        assert_eq!(
            node.chain.account_bound_hash(&user_address).unwrap(),
            Some(hex::encode(second))
        );
        let rebind_receipt = node
            .chain
            .get_receipt(&rebind_hash)
            .unwrap()
            .expect("receipt");
        assert_eq!(rebind_receipt.status, ReceiptStatus::Fail);
    }

    #[test]
    fn transform_moves_ownership_and_rolls_back_refused_moves() {
        let node = bound_node();
        let user = generate_keypair();
        let user_address = address_from_public_key(&user.public);
        let user_umid = [5u8; 32];
        let user_bound = umid::compute_bound_hash(&user_address, &user_umid).unwrap();
        let new_owner = "cd".repeat(32);
        let new_owner_bound = umid::compute_bound_hash(&new_owner, &user_umid).unwrap();
        let proposer_bound = node
            .chain
            .account_bound_hash(node.umid_store.address())
            .unwrap();

        let fund = transfer_tx(&node.keypair, 0, &user_address, 10_000_000);
        node.pool.add_transaction(fund).unwrap();
        let block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Success
        );

        let transform_tx = |nonce: u64, target: &str, data: Vec<u8>| {
            let mut tx = Transaction::new(
                data,
                U256::zero(),
                nonce,
                Some(target.to_string()),
                TxType::TransformUmid,
                U256::from(50_000u64),
                U256::from(1u64),
            );
            tx.sign_with(&user);
            tx
        };
        let mut bind = Transaction::new(
            user_bound.to_vec(),
            U256::zero(),
            0,
            None,
            TxType::BindUmid,
            U256::from(50_000u64),
            U256::from(1u64),
        );
        bind.sign_with(&user);

        // Moving onto the proposer's bound address must fail and leave
        // the sender's record in place for the move that follows.
        let refused = transform_tx(
            1,
            node.umid_store.address(),
            umid::compute_bound_hash(node.umid_store.address(), &user_umid)
                .unwrap()
                .to_vec(),
        );
        let moved = transform_tx(2, &new_owner, new_owner_bound.to_vec());
        let refused_hash = refused.hash.clone();
        for tx in [bind, refused, moved] {
            node.pool.add_transaction(tx).unwrap();
        }

        let block = node
            .chain
            .cast_block(&node.keypair, &node.umid_store, 100)
            .unwrap();
        assert_eq!(block.transactions.len(), 3);
        assert_eq!(
            node.chain.add_block_on_chain(None, block),
            AddBlockResult::Success
        );

        assert_eq!(node.chain.account_bound_hash(&user_address).unwrap(), None);
        assert_eq!(
            node.chain.account_bound_hash(&new_owner).unwrap(),
            Some(hex::encode(new_owner_bound))
        );
        assert_eq!(
            node.chain
                .account_bound_hash(node.umid_store.address())
                .unwrap(),
            proposer_bound
        );
        let receipt = node
            .chain
            .get_receipt(&refused_hash)
            .unwrap()
            .expect("receipt");
        assert_eq!(receipt.status, ReceiptStatus::Fail);
    }

    #[test]
    fn zero_balance_genesis_binding_survives_bootstrap() {
        let keypair = generate_keypair();
        let umid = [8u8; 32];
        let address = address_from_public_key(&keypair.public);
        let bound = umid::compute_bound_hash(&address, &umid).unwrap();
        // No balance; the binding record is the account's only state.
        let genesis = genesis_for(&[(&address, 0, Some(bound))]);
        let node = node_with_genesis(genesis, keypair, umid);
        assert_eq!(
            node.chain.account_bound_hash(&address).unwrap(),
            Some(hex::encode(bound))
        );
    }

    #[test]
    fn heavier_fork_wins_and_returns_transactions_to_the_pool() {
        // Two nodes share a genesis with both proposers bound.
        let keypair_a = generate_keypair();
        let keypair_b = generate_keypair();
        let umid_a = [1u8; 32];
        let umid_b = [2u8; 32];
        let address_a = address_from_public_key(&keypair_a.public);
        let address_b = address_from_public_key(&keypair_b.public);
        let bound_a = umid::compute_bound_hash(&address_a, &umid_a).unwrap();
        let bound_b = umid::compute_bound_hash(&address_b, &umid_b).unwrap();
        let genesis = genesis_for(&[
            (&address_a, 1_000_000_000, Some(bound_a)),
            (&address_b, 1_000_000_000, Some(bound_b)),
        ]);
        let node_a = node_with_genesis(genesis.clone(), keypair_a, umid_a);
        let node_b = node_with_genesis(genesis, keypair_b, umid_b);

        // Node A commits a block carrying a transfer.
        let tx = transfer_tx(&node_a.keypair, 0, &"ee".repeat(32), 777);
        let tx_hash = tx.hash.clone();
        node_a.pool.add_transaction(tx).unwrap();
        let a1 = node_a
            .chain
            .cast_block(&node_a.keypair, &node_a.umid_store, 100)
            .unwrap();
        assert_eq!(
            node_a.chain.add_block_on_chain(None, a1),
            AddBlockResult::Success
        );

        // Node B independently builds two empty blocks.
        let b1 = node_b
            .chain
            .cast_block(&node_b.keypair, &node_b.umid_store, 100)
            .unwrap();
        assert_eq!(
            node_b.chain.add_block_on_chain(None, b1.clone()),
            AddBlockResult::Success
        );
        let b2 = node_b
            .chain
            .cast_block(&node_b.keypair, &node_b.umid_store, 100)
            .unwrap();
        assert_eq!(
            node_b.chain.add_block_on_chain(None, b2.clone()),
            AddBlockResult::Success
        );

        // b1 ties with A's tip for weight, so it is accepted onto a side
        // branch without displacing the canonical chain.
        assert_eq!(
            node_a.chain.add_block_on_chain(Some("b"), b1.clone()),
            AddBlockResult::Success
        );
        assert_eq!(
            node_a.chain.add_block_on_chain(Some("b"), b1.clone()),
            AddBlockResult::AlreadyExists
        );
        assert_eq!(node_a.chain.query_top_block().hash, node_a.chain.query_block_by_height(1).unwrap().unwrap().header.hash);

        // b2 outweighs the canonical tip and triggers the switch.
        assert_eq!(
            node_a.chain.add_block_on_chain(Some("b"), b2.clone()),
            AddBlockResult::Success
        );
        assert_eq!(node_a.chain.query_top_block().hash, b2.header.hash);
        assert_eq!(node_a.chain.query_top_block().height, 2);
        assert_eq!(
            node_a
                .chain
                .query_block_by_height(1)
                .unwrap()
                .unwrap()
                .header
                .hash,
            b1.header.hash
        );

        // The abandoned transfer went back to the pool, its receipt died
        // and its state effects were rolled back.
        assert!(node_a.pool.contains(&tx_hash));
        assert!(node_a.chain.get_receipt(&tx_hash).unwrap().is_none());
        assert_eq!(
            node_a.chain.account_balance(&"ee".repeat(32)).unwrap(),
            U256::zero()
        );
    }

    #[test]
    fn batch_getters_return_contiguous_ranges() {
        let node = bound_node();
        for _ in 0..3 {
            let block = node
                .chain
                .cast_block(&node.keypair, &node.umid_store, 100)
                .unwrap();
            assert_eq!(
                node.chain.add_block_on_chain(None, block),
                AddBlockResult::Success
            );
        }
        // Batches exclude the anchor height itself.
        let blocks = node.chain.batch_get_blocks_after_height(0, 10).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].header.height, 1);
        assert_eq!(blocks[2].header.height, 3);

        let blocks = node.chain.batch_get_blocks_after_height(1, 10).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].header.height, 2);

        let headers = node
            .chain
            .batch_get_block_headers_after_height(2, 1)
            .unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].height, 3);

        assert!(node.chain.has_height(3).unwrap());
        assert!(!node.chain.has_height(4).unwrap());
    }
}
