//! Pending transaction pool.
//!
//! Incoming transactions are verified structurally (hash integrity and
//! signature) before admission. The pool keeps a flat hash index plus a
//! per-sender nonce ordering so proposals pack each sender's
//! transactions in executable order. Executed transactions leave the
//! pool when their block commits and can be looked up through their
//! persisted receipt.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::storage::Storage;
use crate::types::{Address, Receipt, Transaction};

pub const DEFAULT_POOL_CAPACITY: usize = 10_000;
/// Upper bound on a single transaction's encoded size.
pub const MAX_TX_SIZE: usize = 64 * 1024;

/// Structural admission check shared by the pool and the chain engine:
/// size bound, hash integrity and signature, returning the recovered
/// sender.
pub fn recover_and_validate_tx(tx: &mut Transaction) -> ChainResult<Address> {
    if tx.size() > MAX_TX_SIZE {
        return Err(ChainError::Transaction(format!(
            "transaction {} exceeds the size limit",
            tx.hash
        )));
    }
    tx.recover_source()
}

/// Pool operations the chain depends on.
pub trait TransactionPool: Send + Sync {
    /// Admits a verified transaction. `Ok(true)` means newly added,
    /// `Ok(false)` a duplicate that was ignored.
    fn add_transaction(&self, tx: Transaction) -> ChainResult<bool>;

    fn get_transaction(&self, hash: &str) -> Option<Transaction>;

    fn contains(&self, hash: &str) -> bool;

    /// Pending transactions in per-sender nonce order, at most `limit`.
    fn pack_for_cast(&self, limit: usize) -> Vec<Transaction>;

    /// Drops executed transactions once their block commits.
    fn remove_from_pool(&self, txs: &[Transaction]);

    /// Re-admits transactions from blocks a reorg abandoned.
    fn back_to_pool(&self, txs: Vec<Transaction>);

    /// Receipt of an executed transaction, if one was persisted.
    fn get_receipt(&self, tx_hash: &str) -> ChainResult<Option<Receipt>>;

    fn save_receipts(&self, receipts: &[Receipt]) -> ChainResult<()>;

    fn delete_receipts(&self, tx_hashes: &[String]) -> ChainResult<()>;

    fn pending_count(&self) -> usize;
}

struct PoolInner {
    received: HashMap<String, Transaction>,
    /// Per-sender nonce index into `received`.
    by_source: HashMap<Address, BTreeMap<u64, String>>,
}

pub struct TxPool {
    inner: RwLock<PoolInner>,
    storage: Storage,
    capacity: usize,
}

impl TxPool {
    pub fn new(storage: Storage, capacity: usize) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                received: HashMap::new(),
                by_source: HashMap::new(),
            }),
            storage,
            capacity,
        }
    }

    fn remove_locked(inner: &mut PoolInner, hash: &str) {
        if let Some(tx) = inner.received.remove(hash) {
            if let Some(source) = &tx.source {
                if let Some(nonces) = inner.by_source.get_mut(source) {
                    nonces.retain(|_nonce, entry| entry != hash);
                    if nonces.is_empty() {
                        inner.by_source.remove(source);
                    }
                }
            }
        }
    }

    fn admit(&self, mut tx: Transaction, strict: bool) -> ChainResult<bool> {
        let source = recover_and_validate_tx(&mut tx)?;

        let mut inner = self.inner.write();
        if inner.received.contains_key(&tx.hash) {
            return Ok(false);
        }
        if inner.received.len() >= self.capacity {
            return Err(ChainError::Transaction("transaction pool is full".into()));
        }

        // A sender can replace a pending nonce only by outbidding it.
        if let Some(existing_hash) = inner
            .by_source
            .get(&source)
            .and_then(|nonces| nonces.get(&tx.nonce))
            .cloned()
        {
            let outbids = inner
                .received
                .get(&existing_hash)
                .map(|existing| tx.gas_price > existing.gas_price)
                .unwrap_or(true);
            if !outbids {
                if strict {
                    return Err(ChainError::Transaction(format!(
                        "nonce {} for {source} is already pending",
                        tx.nonce
                    )));
                }
                return Ok(false);
            }
            Self::remove_locked(&mut inner, &existing_hash);
            debug!(%source, nonce = tx.nonce, "replaced pending transaction");
        }

        inner
            .by_source
            .entry(source)
            .or_default()
            .insert(tx.nonce, tx.hash.clone());
        inner.received.insert(tx.hash.clone(), tx);
        Ok(true)
    }
}

impl TransactionPool for TxPool {
    fn add_transaction(&self, tx: Transaction) -> ChainResult<bool> {
        self.admit(tx, true)
    }

    fn get_transaction(&self, hash: &str) -> Option<Transaction> {
        self.inner.read().received.get(hash).cloned()
    }

    fn contains(&self, hash: &str) -> bool {
        self.inner.read().received.contains_key(hash)
    }

    fn pack_for_cast(&self, limit: usize) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut packed = Vec::new();
        // Round-robin over senders keeps one busy sender from starving
        // the rest while preserving per-sender nonce order.
        let mut cursors: Vec<_> = inner
            .by_source
            .values()
            .map(|nonces| nonces.values())
            .collect();
        'outer: loop {
            let mut progressed = false;
            for cursor in cursors.iter_mut() {
                if let Some(hash) = cursor.next() {
                    if let Some(tx) = inner.received.get(hash) {
                        packed.push(tx.clone());
                        if packed.len() >= limit {
                            break 'outer;
                        }
                    }
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        packed
    }

    fn remove_from_pool(&self, txs: &[Transaction]) {
        let mut inner = self.inner.write();
        for tx in txs {
            Self::remove_locked(&mut inner, &tx.hash);
        }
    }

    fn back_to_pool(&self, txs: Vec<Transaction>) {
        for tx in txs {
            let hash = tx.hash.clone();
            if let Err(err) = self.admit(tx, false) {
                debug!(%hash, %err, "abandoned transaction not re-admitted");
            }
        }
    }

    fn get_receipt(&self, tx_hash: &str) -> ChainResult<Option<Receipt>> {
        self.storage.read_receipt(tx_hash)
    }

    fn save_receipts(&self, receipts: &[Receipt]) -> ChainResult<()> {
        self.storage.store_receipts(receipts)
    }

    fn delete_receipts(&self, tx_hashes: &[String]) -> ChainResult<()> {
        self.storage.delete_receipts(tx_hashes)
    }

    fn pending_count(&self) -> usize {
        self.inner.read().received.len()
    }
}
