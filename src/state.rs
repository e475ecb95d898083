//! Transactional account state.
//!
//! All mutations during block replay go through [`AccountState`], which
//! records an undo entry per mutation. Snapshots mark journal positions,
//! reverting to a snapshot undoes every mutation taken since it. Nothing
//! reaches the backing store until [`AccountState::commit`] runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use primitive_types::U256;

use crate::errors::{ChainError, ChainResult};
use crate::types::{sha256, Account, Address, Hash32};

/// Persistence boundary for account records. The chain storage implements
/// this over its accounts column family.
pub trait StateBackend: Send + Sync {
    fn load_account(&self, address: &str) -> ChainResult<Option<Account>>;

    /// Every live account, used to compute the state root.
    fn all_accounts(&self) -> ChainResult<Vec<Account>>;

    /// Atomically persist `updates` and remove `deletes`.
    fn write_accounts(&self, updates: &[Account], deletes: &[Address]) -> ChainResult<()>;
}

enum JournalEntry {
    AccountCreated {
        address: Address,
    },
    AccountReset {
        address: Address,
        prev: Account,
    },
    BalanceChanged {
        address: Address,
        prev: U256,
    },
    NonceChanged {
        address: Address,
        prev: u64,
    },
    CodeChanged {
        address: Address,
        prev_code: Vec<u8>,
        prev_hash: String,
    },
    StorageChanged {
        address: Address,
        key: Vec<u8>,
        prev: Option<Vec<u8>>,
    },
    SuicideMarked {
        address: Address,
    },
    RefundChanged {
        prev: u64,
    },
}

pub struct AccountState {
    backend: Arc<dyn StateBackend>,
    /// Accounts touched since the last commit, keyed by address.
    cache: HashMap<Address, Account>,
    journal: Vec<JournalEntry>,
    /// `(snapshot id, journal length at the time)`, ids strictly increasing.
    snapshots: Vec<(usize, usize)>,
    next_snapshot_id: usize,
    /// Addresses marked for deletion at commit.
    suicides: HashSet<Address>,
    /// Gas refund accumulated during the current replay.
    refund: u64,
}

impl AccountState {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            cache: HashMap::new(),
            journal: Vec::new(),
            snapshots: Vec::new(),
            next_snapshot_id: 0,
            suicides: HashSet::new(),
            refund: 0,
        }
    }

    fn load(&mut self, address: &str) -> ChainResult<Option<&mut Account>> {
        if !self.cache.contains_key(address) {
            match self.backend.load_account(address)? {
                Some(account) => {
                    self.cache.insert(address.to_string(), account);
                }
                None => return Ok(None),
            }
        }
        Ok(self.cache.get_mut(address))
    }

    fn load_or_create(&mut self, address: &str) -> ChainResult<&mut Account> {
        if self.load(address)?.is_none() {
            self.journal.push(JournalEntry::AccountCreated {
                address: address.to_string(),
            });
            self.cache
                .insert(address.to_string(), Account::new(address.to_string()));
        }
        Ok(self
            .cache
            .get_mut(address)
            .unwrap_or_else(|| unreachable!("account inserted above")))
    }

    pub fn account_exists(&mut self, address: &str) -> ChainResult<bool> {
        Ok(self.load(address)?.is_some())
    }

    pub fn account_empty(&mut self, address: &str) -> ChainResult<bool> {
        Ok(self
            .load(address)?
            .map(|account| account.is_empty())
            .unwrap_or(true))
    }

    /// Idempotent create. An existing non-empty account is left alone;
    /// an existing empty account has its code and storage reset.
    pub fn create_account(&mut self, address: &str) -> ChainResult<()> {
        match self.load(address)? {
            None => {
                self.load_or_create(address)?;
                Ok(())
            }
            Some(account) if account.is_empty() => {
                let prev = account.clone();
                account.code.clear();
                account.code_hash.clear();
                account.storage.clear();
                self.journal.push(JournalEntry::AccountReset {
                    address: address.to_string(),
                    prev,
                });
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    pub fn balance(&mut self, address: &str) -> ChainResult<U256> {
        Ok(self
            .load(address)?
            .map(|account| account.balance)
            .unwrap_or_default())
    }

    pub fn nonce(&mut self, address: &str) -> ChainResult<u64> {
        Ok(self
            .load(address)?
            .map(|account| account.nonce)
            .unwrap_or_default())
    }

    pub fn add_balance(&mut self, address: &str, amount: U256) -> ChainResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let account = self.load_or_create(address)?;
        let prev = account.balance;
        account.balance = account.balance.saturating_add(amount);
        self.journal.push(JournalEntry::BalanceChanged {
            address: address.to_string(),
            prev,
        });
        Ok(())
    }

    /// Debits `amount`. The caller checks affordability first, an
    /// underflow here clamps to zero.
    pub fn sub_balance(&mut self, address: &str, amount: U256) -> ChainResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        let account = self.load_or_create(address)?;
        let prev = account.balance;
        account.balance = account.balance.saturating_sub(amount);
        self.journal.push(JournalEntry::BalanceChanged {
            address: address.to_string(),
            prev,
        });
        Ok(())
    }

    pub fn can_transfer(&mut self, from: &str, amount: U256) -> ChainResult<bool> {
        Ok(self.balance(from)? >= amount)
    }

    /// Moves `amount` between accounts, re-checking affordability under
    /// the journal so a stale pre-check cannot overdraw.
    pub fn transfer(&mut self, from: &str, to: &str, amount: U256) -> ChainResult<()> {
        if !self.can_transfer(from, amount)? {
            return Err(ChainError::InsufficientBalance(from.to_string()));
        }
        self.sub_balance(from, amount)?;
        self.add_balance(to, amount)
    }

    pub fn set_nonce(&mut self, address: &str, nonce: u64) -> ChainResult<()> {
        let account = self.load_or_create(address)?;
        let prev = account.nonce;
        account.nonce = nonce;
        self.journal.push(JournalEntry::NonceChanged {
            address: address.to_string(),
            prev,
        });
        Ok(())
    }

    pub fn set_code(&mut self, address: &str, code: Vec<u8>) -> ChainResult<()> {
        let code_hash = hex::encode(sha256(&code));
        let account = self.load_or_create(address)?;
        let prev_code = std::mem::take(&mut account.code);
        let prev_hash = std::mem::replace(&mut account.code_hash, code_hash);
        account.code = code;
        self.journal.push(JournalEntry::CodeChanged {
            address: address.to_string(),
            prev_code,
            prev_hash,
        });
        Ok(())
    }

    pub fn storage_value(&mut self, address: &str, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        Ok(self
            .load(address)?
            .and_then(|account| account.storage.get(key).cloned()))
    }

    pub fn set_storage(&mut self, address: &str, key: Vec<u8>, value: Vec<u8>) -> ChainResult<()> {
        let account = self.load_or_create(address)?;
        let prev = account.storage.insert(key.clone(), value);
        self.journal.push(JournalEntry::StorageChanged {
            address: address.to_string(),
            key,
            prev,
        });
        Ok(())
    }

    pub fn remove_storage(&mut self, address: &str, key: &[u8]) -> ChainResult<()> {
        let account = self.load_or_create(address)?;
        let prev = account.storage.remove(key);
        if prev.is_some() {
            self.journal.push(JournalEntry::StorageChanged {
                address: address.to_string(),
                key: key.to_vec(),
                prev,
            });
        }
        Ok(())
    }

    /// Storage entries of an address, sorted by key.
    pub fn storage_entries(&mut self, address: &str) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .load(address)?
            .map(|account| {
                account
                    .storage
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Marks the account for deletion at commit. Its balance is gone,
    /// the record itself stays readable until then.
    pub fn suicide(&mut self, address: &str) -> ChainResult<bool> {
        if self.load(address)?.is_none() {
            return Ok(false);
        }
        let prev_balance = self.balance(address)?;
        self.sub_balance(address, prev_balance)?;
        if self.suicides.insert(address.to_string()) {
            self.journal.push(JournalEntry::SuicideMarked {
                address: address.to_string(),
            });
        }
        Ok(true)
    }

    pub fn has_suicided(&self, address: &str) -> bool {
        self.suicides.contains(address)
    }

    pub fn add_refund(&mut self, gas: u64) {
        self.journal.push(JournalEntry::RefundChanged {
            prev: self.refund,
        });
        self.refund = self.refund.saturating_add(gas);
    }

    pub fn refund(&self) -> u64 {
        self.refund
    }

    /// Marks the current journal position and returns a handle for
    /// [`AccountState::revert_to_snapshot`].
    pub fn snapshot(&mut self) -> usize {
        let id = self.next_snapshot_id;
        self.next_snapshot_id += 1;
        self.snapshots.push((id, self.journal.len()));
        id
    }

    /// Undoes every mutation recorded after snapshot `id` was taken.
    ///
    /// Panics when `id` is unknown or was already consumed. A revert past
    /// the replay base means the block pipeline lost track of its own
    /// snapshots and the state can no longer be trusted.
    pub fn revert_to_snapshot(&mut self, id: usize) {
        let index = self
            .snapshots
            .iter()
            .position(|(snap_id, _)| *snap_id == id)
            .unwrap_or_else(|| panic!("revert to unknown snapshot {id}"));
        let journal_len = self.snapshots[index].1;
        self.snapshots.truncate(index);
        while self.journal.len() > journal_len {
            let entry = self
                .journal
                .pop()
                .unwrap_or_else(|| unreachable!("journal length checked above"));
            self.undo(entry);
        }
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::AccountCreated { address } => {
                self.cache.remove(&address);
            }
            JournalEntry::BalanceChanged { address, prev } => {
                if let Some(account) = self.cache.get_mut(&address) {
                    account.balance = prev;
                }
            }
            JournalEntry::NonceChanged { address, prev } => {
                if let Some(account) = self.cache.get_mut(&address) {
                    account.nonce = prev;
                }
            }
            JournalEntry::CodeChanged {
                address,
                prev_code,
                prev_hash,
            } => {
                if let Some(account) = self.cache.get_mut(&address) {
                    account.code = prev_code;
                    account.code_hash = prev_hash;
                }
            }
            JournalEntry::StorageChanged { address, key, prev } => {
                if let Some(account) = self.cache.get_mut(&address) {
                    match prev {
                        Some(value) => account.storage.insert(key, value),
                        None => account.storage.remove(&key),
                    };
                }
            }
            JournalEntry::AccountReset { address, prev } => {
                self.cache.insert(address, prev);
            }
            JournalEntry::SuicideMarked { address } => {
                self.suicides.remove(&address);
            }
            JournalEntry::RefundChanged { prev } => {
                self.refund = prev;
            }
        }
    }

    /// Root over the post-mutation account set: persisted accounts
    /// overlaid with the cache, sorted by address, empty accounts pruned.
    pub fn root(&self) -> ChainResult<Hash32> {
        let mut accounts: BTreeMap<Address, Account> = self
            .backend
            .all_accounts()?
            .into_iter()
            .map(|account| (account.address.clone(), account))
            .collect();
        for (address, account) in &self.cache {
            accounts.insert(address.clone(), account.clone());
        }
        for address in &self.suicides {
            accounts.remove(address);
        }
        let leaves: Vec<Hash32> = accounts
            .values()
            .filter(|account| !account.is_empty())
            .map(|account| account.state_leaf())
            .collect::<ChainResult<_>>()?;
        Ok(crate::types::compute_merkle_root(&leaves))
    }

    /// Flushes every cached mutation to the backend and resets the
    /// journal. Empty accounts are deleted rather than persisted.
    pub fn commit(&mut self) -> ChainResult<Hash32> {
        let root = self.root()?;
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for (address, account) in self.cache.drain() {
            if account.is_empty() || self.suicides.contains(&address) {
                deletes.push(address);
            } else {
                updates.push(account);
            }
        }
        for address in self.suicides.drain() {
            if !deletes.contains(&address) {
                deletes.push(address);
            }
        }
        self.backend.write_accounts(&updates, &deletes)?;
        self.journal.clear();
        self.snapshots.clear();
        self.refund = 0;
        Ok(root)
    }

    /// Drops every uncommitted mutation.
    pub fn discard(&mut self) {
        self.cache.clear();
        self.journal.clear();
        self.snapshots.clear();
        self.suicides.clear();
        self.refund = 0;
    }
}
