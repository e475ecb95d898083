use std::convert::TryInto;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};

use crate::errors::{ChainError, ChainResult};
use crate::state::StateBackend;
use crate::types::{Account, Address, Block, BlockMetadata, Receipt};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

pub(crate) const CF_BLOCKS: &str = "blocks";
pub(crate) const CF_BLOCK_INDEX: &str = "block_index";
pub(crate) const CF_RECEIPTS: &str = "receipts";
pub(crate) const CF_ACCOUNTS: &str = "accounts";
pub(crate) const CF_METADATA: &str = "metadata";
const TIP_HEIGHT_KEY: &[u8] = b"tip_height";
const TIP_HASH_KEY: &[u8] = b"tip_hash";
const TIP_TIMESTAMP_KEY: &[u8] = b"tip_timestamp";
pub(crate) const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// RocksDB-backed persistence.
///
/// `blocks` maps big-endian height to the canonical block at that height,
/// `block_index` maps block hash to height for hash lookups, `receipts`
/// maps transaction hash to its execution receipt, `accounts` holds the
/// committed account records and `metadata` the tip pointer and schema
/// version.
pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

fn cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
        ColumnFamilyDescriptor::new(CF_BLOCK_INDEX, Options::default()),
        ColumnFamilyDescriptor::new(CF_RECEIPTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_ACCOUNTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ]
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors())?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema_supported()?;
        Ok(storage)
    }

    fn cf(&self, name: &str) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Config(format!("missing {name} column family")))
    }

    fn ensure_schema_supported(&self) -> ChainResult<()> {
        let metadata_cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&metadata_cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let bytes: [u8; 4] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid schema version encoding".into()))?;
                let version = u32::from_be_bytes(bytes);
                if version != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "database schema version {version} is not supported, expected {STORAGE_SCHEMA_VERSION}"
                    )));
                }
                Ok(())
            }
            None => {
                self.db.put_cf(
                    &metadata_cf,
                    SCHEMA_VERSION_KEY,
                    STORAGE_SCHEMA_VERSION.to_be_bytes(),
                )?;
                Ok(())
            }
        }
    }

    /// Writes a block at its height, indexes it by hash and advances the
    /// tip pointer, all in one batch.
    pub fn store_block(&self, block: &Block) -> ChainResult<()> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let index_cf = self.cf(CF_BLOCK_INDEX)?;
        let metadata_cf = self.cf(CF_METADATA)?;
        let height_key = block.header.height.to_be_bytes();
        let data = bincode::serialize(block)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&blocks_cf, height_key, data);
        batch.put_cf(&index_cf, block.header.hash.as_bytes(), height_key);
        batch.put_cf(&metadata_cf, TIP_HEIGHT_KEY, height_key);
        batch.put_cf(&metadata_cf, TIP_HASH_KEY, block.header.hash.as_bytes());
        batch.put_cf(
            &metadata_cf,
            TIP_TIMESTAMP_KEY,
            block.header.cur_time.to_be_bytes(),
        );
        self.db.write(batch)?;
        Ok(())
    }

    pub fn read_block(&self, height: u64) -> ChainResult<Option<Block>> {
        let cf = self.cf(CF_BLOCKS)?;
        match self.db.get_cf(&cf, height.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn read_block_by_hash(&self, hash: &str) -> ChainResult<Option<Block>> {
        let index_cf = self.cf(CF_BLOCK_INDEX)?;
        let Some(height_bytes) = self.db.get_cf(&index_cf, hash.as_bytes())? else {
            return Ok(None);
        };
        let height = u64::from_be_bytes(
            height_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid block height encoding".into()))?,
        );
        // The index may point at a height that a reorg has since
        // rewritten; confirm the hash still matches.
        match self.read_block(height)? {
            Some(block) if block.header.hash == hash => Ok(Some(block)),
            _ => Ok(None),
        }
    }

    pub fn load_blockchain(&self) -> ChainResult<Vec<Block>> {
        let cf = self.cf(CF_BLOCKS)?;
        let mut iterator = self.db.iterator_cf(&cf, IteratorMode::Start);
        let mut blocks = Vec::new();
        while let Some(entry) = iterator.next() {
            let (_key, value) = entry?;
            blocks.push(bincode::deserialize::<Block>(&value)?);
        }
        blocks.sort_by_key(|block| block.header.height);
        Ok(blocks)
    }

    /// Removes every block strictly above `height` together with its hash
    /// index entry. Used when a heavier fork replaces the tail of the
    /// canonical chain.
    pub fn truncate_above(&self, height: u64) -> ChainResult<Vec<Block>> {
        let blocks_cf = self.cf(CF_BLOCKS)?;
        let index_cf = self.cf(CF_BLOCK_INDEX)?;
        let mut removed = Vec::new();
        let mut batch = WriteBatch::default();
        let mut iterator = self.db.iterator_cf(&blocks_cf, IteratorMode::Start);
        while let Some(entry) = iterator.next() {
            let (key, value) = entry?;
            let block: Block = bincode::deserialize(&value)?;
            if block.header.height > height {
                batch.delete_cf(&blocks_cf, key.as_ref());
                batch.delete_cf(&index_cf, block.header.hash.as_bytes());
                removed.push(block);
            }
        }
        self.db.write(batch)?;
        removed.sort_by_key(|block| block.header.height);
        Ok(removed)
    }

    pub fn store_receipts(&self, receipts: &[Receipt]) -> ChainResult<()> {
        let cf = self.cf(CF_RECEIPTS)?;
        let mut batch = WriteBatch::default();
        for receipt in receipts {
            batch.put_cf(&cf, receipt.tx_hash.as_bytes(), bincode::serialize(receipt)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn read_receipt(&self, tx_hash: &str) -> ChainResult<Option<Receipt>> {
        let cf = self.cf(CF_RECEIPTS)?;
        match self.db.get_cf(&cf, tx_hash.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_receipts(&self, tx_hashes: &[String]) -> ChainResult<()> {
        let cf = self.cf(CF_RECEIPTS)?;
        let mut batch = WriteBatch::default();
        for hash in tx_hashes {
            batch.delete_cf(&cf, hash.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn clear_accounts(&self) -> ChainResult<()> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let mut batch = WriteBatch::default();
        let mut iterator = self.db.iterator_cf(&cf, IteratorMode::Start);
        while let Some(entry) = iterator.next() {
            let (key, _value) = entry?;
            batch.delete_cf(&cf, key.as_ref());
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn tip(&self) -> ChainResult<Option<BlockMetadata>> {
        let cf = self.cf(CF_METADATA)?;
        let height_bytes = match self.db.get_cf(&cf, TIP_HEIGHT_KEY)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let hash_bytes = self
            .db
            .get_cf(&cf, TIP_HASH_KEY)?
            .ok_or_else(|| ChainError::Config("missing tip hash".into()))?;
        let timestamp_bytes = self
            .db
            .get_cf(&cf, TIP_TIMESTAMP_KEY)?
            .ok_or_else(|| ChainError::Config("missing tip timestamp".into()))?;
        let height = u64::from_be_bytes(
            height_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid tip height encoding".into()))?,
        );
        let hash = String::from_utf8(hash_bytes.to_vec())
            .map_err(|err| ChainError::Config(format!("invalid tip hash encoding: {err}")))?;
        let cur_time = u64::from_be_bytes(
            timestamp_bytes
                .as_slice()
                .try_into()
                .map_err(|_| ChainError::Config("invalid tip timestamp encoding".into()))?,
        );
        Ok(Some(BlockMetadata {
            height,
            hash,
            cur_time,
        }))
    }

    pub fn set_tip(&self, metadata: &BlockMetadata) -> ChainResult<()> {
        let cf = self.cf(CF_METADATA)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, TIP_HEIGHT_KEY, metadata.height.to_be_bytes());
        batch.put_cf(&cf, TIP_HASH_KEY, metadata.hash.as_bytes());
        batch.put_cf(&cf, TIP_TIMESTAMP_KEY, metadata.cur_time.to_be_bytes());
        self.db.write(batch)?;
        Ok(())
    }
}

impl StateBackend for Storage {
    fn load_account(&self, address: &str) -> ChainResult<Option<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        match self.db.get_cf(&cf, address.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn all_accounts(&self) -> ChainResult<Vec<Account>> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let mut iterator = self.db.iterator_cf(&cf, IteratorMode::Start);
        let mut accounts = Vec::new();
        while let Some(entry) = iterator.next() {
            let (_key, value) = entry?;
            accounts.push(bincode::deserialize::<Account>(&value)?);
        }
        accounts.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(accounts)
    }

    fn write_accounts(&self, updates: &[Account], deletes: &[Address]) -> ChainResult<()> {
        let cf = self.cf(CF_ACCOUNTS)?;
        let mut batch = WriteBatch::default();
        for account in updates {
            batch.put_cf(&cf, account.address.as_bytes(), bincode::serialize(account)?);
        }
        for address in deletes {
            batch.delete_cf(&cf, address.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, ReceiptStatus};
    use primitive_types::U256;
    use tempfile::TempDir;

    fn block_at(height: u64, marker: u8) -> Block {
        let mut header = BlockHeader::new(
            height,
            hex::encode([marker; 32]),
            hex::encode([1u8; 32]),
            0,
            hex::encode([2u8; 32]),
            hex::encode([3u8; 32]),
            hex::encode([4u8; 32]),
            1_000,
            U256::from(height),
        );
        header.hash = hex::encode([marker.wrapping_add(100); 32]);
        Block {
            header,
            transactions: Vec::new(),
        }
    }

    #[test]
    fn blocks_round_trip_by_height_and_hash() {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let block = block_at(5, 1);
        storage.store_block(&block).unwrap();

        let by_height = storage.read_block(5).unwrap().expect("by height");
        assert_eq!(by_height.header.hash, block.header.hash);
        let by_hash = storage
            .read_block_by_hash(&block.header.hash)
            .unwrap()
            .expect("by hash");
        assert_eq!(by_hash.header.height, 5);
        assert!(storage.read_block(6).unwrap().is_none());

        let tip = storage.tip().unwrap().expect("tip");
        assert_eq!(tip.height, 5);
        assert_eq!(tip.hash, block.header.hash);
    }

    #[test]
    fn truncate_removes_blocks_and_their_index_entries() {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        for height in 0..4 {
            storage.store_block(&block_at(height, height as u8)).unwrap();
        }
        let removed = storage.truncate_above(1).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].header.height, 2);
        assert!(storage.read_block(2).unwrap().is_none());
        assert!(storage
            .read_block_by_hash(&removed[1].header.hash)
            .unwrap()
            .is_none());
        assert!(storage.read_block(1).unwrap().is_some());
    }

    #[test]
    fn receipts_round_trip_and_delete() {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let receipt = Receipt::new(ReceiptStatus::Success, 21_000, "ab".repeat(32), 7, 0);
        storage.store_receipts(&[receipt.clone()]).unwrap();
        assert_eq!(
            storage.read_receipt(&receipt.tx_hash).unwrap(),
            Some(receipt.clone())
        );
        storage.delete_receipts(&[receipt.tx_hash.clone()]).unwrap();
        assert!(storage.read_receipt(&receipt.tx_hash).unwrap().is_none());
    }

    #[test]
    fn accounts_persist_through_the_state_backend() {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut account = Account::new("aa".repeat(32));
        account.balance = U256::from(9u64);
        storage.write_accounts(&[account.clone()], &[]).unwrap();
        assert_eq!(
            storage.load_account(&account.address).unwrap(),
            Some(account.clone())
        );
        storage
            .write_accounts(&[], &[account.address.clone()])
            .unwrap();
        assert!(storage.load_account(&account.address).unwrap().is_none());
    }
}
