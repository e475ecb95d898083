//! Block and transaction synchronization.
//!
//! The driver announces the local tip on a ticker, answers block and
//! chain-piece requests from peers, and feeds every received block back
//! through the chain engine. An outstanding-request map tracks which
//! peers still owe us a response; the chain's syncing flag mirrors it so
//! `sync_finished` reflects reality.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::bus::{
    EventBus, Notification, TOPIC_BLOCK_INFO_NOTIFY, TOPIC_BLOCK_REQ, TOPIC_BLOCK_RESPONSE,
    TOPIC_CHAIN_PIECE_INFO, TOPIC_CHAIN_PIECE_REQ, TOPIC_NEW_BLOCK, TOPIC_TX_SYNC_NOTIFY,
    TOPIC_TX_SYNC_REQ, TOPIC_TX_SYNC_RESPONSE,
};
use crate::chain::{BlockChain, MAX_BATCH_BLOCKS};
use crate::codec::{
    decode_block, decode_block_header, decode_block_headers, decode_blocks, decode_transactions,
    encode_block_header, encode_block_headers, encode_blocks, encode_transaction,
    encode_transactions,
};
use crate::errors::{ChainError, ChainResult};
use crate::network::{
    Message, Network, CODE_BLOCK_INFO_NOTIFY, CODE_BLOCK_REQ, CODE_BLOCK_RESPONSE,
    CODE_CHAIN_PIECE_INFO, CODE_CHAIN_PIECE_REQ, CODE_TX_SYNC_NOTIFY, CODE_TX_SYNC_RESPONSE,
};
use crate::txpool::TransactionPool;
use crate::types::{AddBlockResult, Transaction};

/// How far below the local tip a chain-piece probe starts.
const PIECE_PROBE_WINDOW: u64 = 16;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const TX_SYNC_BATCH: usize = 256;

pub struct SyncDriver {
    chain: Arc<BlockChain>,
    pool: Arc<dyn TransactionPool>,
    network: Arc<dyn Network>,
    bus: Arc<EventBus>,
    /// Peers we are waiting on, with the time the request went out.
    outstanding: Mutex<HashMap<String, Instant>>,
}

impl SyncDriver {
    pub fn new(
        chain: Arc<BlockChain>,
        pool: Arc<dyn TransactionPool>,
        network: Arc<dyn Network>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            chain,
            pool,
            network,
            bus,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the ticker and one task per subscribed topic. Tasks run
    /// until the bus is dropped.
    pub fn start(self: &Arc<Self>, announce_interval: Duration) {
        let driver = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(announce_interval);
            loop {
                ticker.tick().await;
                driver.expire_stale_requests();
                if let Err(err) = driver.announce_top_block() {
                    warn!(%err, "tip announcement failed");
                }
            }
        });

        self.spawn_handler(TOPIC_BLOCK_INFO_NOTIFY, Self::handle_block_info_notify);
        self.spawn_handler(TOPIC_BLOCK_REQ, Self::handle_block_req);
        self.spawn_handler(TOPIC_BLOCK_RESPONSE, Self::handle_block_response);
        self.spawn_handler(TOPIC_NEW_BLOCK, Self::handle_new_block);
        self.spawn_handler(TOPIC_CHAIN_PIECE_REQ, Self::handle_chain_piece_req);
        self.spawn_handler(TOPIC_CHAIN_PIECE_INFO, Self::handle_chain_piece_info);
        self.spawn_handler(TOPIC_TX_SYNC_NOTIFY, Self::handle_tx_sync);
        self.spawn_handler(TOPIC_TX_SYNC_REQ, Self::handle_tx_sync_req);
        self.spawn_handler(TOPIC_TX_SYNC_RESPONSE, Self::handle_tx_sync);
    }

    fn spawn_handler(
        self: &Arc<Self>,
        topic: &'static str,
        handler: fn(&SyncDriver, Notification) -> ChainResult<()>,
    ) {
        let driver = self.clone();
        let mut rx: UnboundedReceiver<Notification> = self.bus.subscribe(topic);
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                if let Err(err) = handler(&driver, notification) {
                    debug!(topic, %err, "sync handler failed");
                }
            }
        });
    }

    fn expire_stale_requests(&self) {
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|peer, since| {
            let live = since.elapsed() < REQUEST_TIMEOUT;
            if !live {
                debug!(peer, "block request timed out");
            }
            live
        });
        self.chain.set_syncing(!outstanding.is_empty());
    }

    fn mark_requested(&self, peer: &str) {
        self.outstanding
            .lock()
            .insert(peer.to_string(), Instant::now());
        self.chain.set_syncing(true);
    }

    fn mark_answered(&self, peer: &str) {
        let mut outstanding = self.outstanding.lock();
        outstanding.remove(peer);
        self.chain.set_syncing(!outstanding.is_empty());
    }

    pub fn announce_top_block(&self) -> ChainResult<()> {
        let top = self.chain.query_top_block();
        let body = encode_block_header(&top)?;
        self.network
            .transmit_to_neighbor(Message::new(CODE_BLOCK_INFO_NOTIFY, body))
    }

    /// Gossips a freshly committed local block.
    pub fn broadcast_block(&self, block: &crate::types::Block) -> ChainResult<()> {
        let body = crate::codec::encode_block(block)?;
        self.network
            .broadcast(Message::new(crate::network::CODE_NEW_BLOCK, body))
    }

    /// Gossips a transaction accepted into the local pool.
    pub fn broadcast_transaction(&self, tx: &Transaction) -> ChainResult<()> {
        let body = encode_transactions(std::slice::from_ref(tx))?;
        self.network
            .transmit_to_neighbor(Message::new(CODE_TX_SYNC_NOTIFY, body))
    }

    pub fn handle_block_info_notify(&self, notification: Notification) -> ChainResult<()> {
        let peer = peer_of(&notification)?;
        let remote = decode_block_header(notification.payload.as_bytes())?;
        let local = self.chain.query_top_block();
        if remote.more_weight_than(&local) {
            info!(
                peer = %peer,
                remote_height = remote.height,
                local_height = local.height,
                "peer is ahead, requesting blocks"
            );
            self.request_blocks_from(&peer, local.height)?;
        }
        Ok(())
    }

    fn request_blocks_from(&self, peer: &str, from_height: u64) -> ChainResult<()> {
        self.mark_requested(peer);
        self.network.send_to_peer(
            peer,
            Message::new(CODE_BLOCK_REQ, from_height.to_be_bytes().to_vec()),
        )
    }

    pub fn handle_block_req(&self, notification: Notification) -> ChainResult<()> {
        let peer = peer_of(&notification)?;
        let from_height = decode_height(notification.payload.as_bytes())?;
        let blocks = self
            .chain
            .batch_get_blocks_after_height(from_height, MAX_BATCH_BLOCKS)?;
        let body = encode_blocks(&blocks)?;
        self.network
            .send_to_peer(&peer, Message::new(CODE_BLOCK_RESPONSE, body))
    }

    pub fn handle_block_response(&self, notification: Notification) -> ChainResult<()> {
        let peer = peer_of(&notification)?;
        self.mark_answered(&peer);
        let blocks = decode_blocks(notification.payload.as_bytes())?;
        let mut unknown_parent = None;
        for block in blocks {
            let pre_hash = block.header.pre_hash.clone();
            let result = self.chain.add_block_on_chain(Some(&peer), block);
            if result == AddBlockResult::Failed && !self.chain.has_block(&pre_hash)? {
                unknown_parent = Some(pre_hash);
            }
        }
        // A detached block means the fork root is further back than the
        // batch reached; probe with headers first.
        if unknown_parent.is_some() {
            let probe = self
                .chain
                .query_top_block()
                .height
                .saturating_sub(PIECE_PROBE_WINDOW);
            self.mark_requested(&peer);
            self.network.send_to_peer(
                &peer,
                Message::new(CODE_CHAIN_PIECE_REQ, probe.to_be_bytes().to_vec()),
            )?;
        }
        Ok(())
    }

    pub fn handle_new_block(&self, notification: Notification) -> ChainResult<()> {
        let peer = peer_of(&notification)?;
        let block = decode_block(notification.payload.as_bytes())?;
        let result = self.chain.add_block_on_chain(Some(&peer), block);
        if result == AddBlockResult::Success {
            // Relay once; peers already holding it answer AlreadyExists.
            self.network.transmit_to_neighbor(Message::new(
                crate::network::CODE_NEW_BLOCK,
                notification.payload.as_bytes().to_vec(),
            ))?;
        }
        Ok(())
    }

    pub fn handle_chain_piece_req(&self, notification: Notification) -> ChainResult<()> {
        let peer = peer_of(&notification)?;
        let from_height = decode_height(notification.payload.as_bytes())?;
        let headers = self
            .chain
            .batch_get_block_headers_after_height(from_height, MAX_BATCH_BLOCKS)?;
        let body = encode_block_headers(&headers)?;
        self.network
            .send_to_peer(&peer, Message::new(CODE_CHAIN_PIECE_INFO, body))
    }

    pub fn handle_chain_piece_info(&self, notification: Notification) -> ChainResult<()> {
        let peer = peer_of(&notification)?;
        self.mark_answered(&peer);
        let headers = decode_block_headers(notification.payload.as_bytes())?;
        // The last header we share is the fork root; pull blocks after it.
        // Pieces start past the probed height, so the parent of the first
        // header can itself be the fork root.
        let mut common = None;
        if let Some(first) = headers.first() {
            if self.chain.has_block(&first.pre_hash)? {
                common = Some(first.height.saturating_sub(1));
            }
        }
        for header in &headers {
            if self.chain.has_block(&header.hash)? {
                common = Some(header.height);
            }
        }
        match common {
            Some(height) => self.request_blocks_from(&peer, height),
            None => {
                // No overlap in this piece; probe further back.
                let first = headers.first().map(|header| header.height).unwrap_or(0);
                let probe = first.saturating_sub(PIECE_PROBE_WINDOW);
                self.mark_requested(&peer);
                self.network.send_to_peer(
                    &peer,
                    Message::new(CODE_CHAIN_PIECE_REQ, probe.to_be_bytes().to_vec()),
                )
            }
        }
    }

    pub fn handle_tx_sync(&self, notification: Notification) -> ChainResult<()> {
        let txs = decode_transactions(notification.payload.as_bytes())?;
        for tx in txs {
            let hash = tx.hash.clone();
            match self.pool.add_transaction(tx) {
                Ok(_) => {}
                Err(err) => debug!(%hash, %err, "synced transaction rejected"),
            }
        }
        Ok(())
    }

    pub fn handle_tx_sync_req(&self, notification: Notification) -> ChainResult<()> {
        let peer = peer_of(&notification)?;
        let txs = self.pool.pack_for_cast(TX_SYNC_BATCH);
        let body = encode_transactions(&txs)?;
        self.network
            .send_to_peer(&peer, Message::new(CODE_TX_SYNC_RESPONSE, body))
    }
}

fn peer_of(notification: &Notification) -> ChainResult<String> {
    notification
        .source
        .clone()
        .ok_or_else(|| ChainError::Fork("sync notification without a peer source".into()))
}

fn decode_height(body: &[u8]) -> ChainResult<u64> {
    let bytes: [u8; 8] = body
        .try_into()
        .map_err(|_| ChainError::Codec(format!("height body must be 8 bytes, got {}", body.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Payload;
    use crate::config::{GenesisAccount, GenesisConfig};
    use crate::crypto::{address_from_public_key, generate_keypair};
    use crate::storage::Storage;
    use crate::txpool::TxPool;
    use crate::types::TxType;
    use crate::umid::{self, UmidStore};
    use ed25519_dalek::Keypair;
    use primitive_types::U256;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingNetwork {
        sent: Mutex<Vec<(Option<String>, Message)>>,
    }

    impl RecordingNetwork {
        fn take(&self) -> Vec<(Option<String>, Message)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl Network for RecordingNetwork {
        fn send_to_peer(&self, peer: &str, message: Message) -> ChainResult<()> {
            self.sent.lock().push((Some(peer.to_string()), message));
            Ok(())
        }

        fn broadcast(&self, message: Message) -> ChainResult<()> {
            self.sent.lock().push((None, message));
            Ok(())
        }

        fn transmit_to_neighbor(&self, message: Message) -> ChainResult<()> {
            self.sent.lock().push((None, message));
            Ok(())
        }

        fn peer_count(&self) -> usize {
            1
        }
    }

    struct TestNode {
        driver: SyncDriver,
        chain: Arc<BlockChain>,
        pool: Arc<TxPool>,
        network: Arc<RecordingNetwork>,
        keypair: Keypair,
        umid_store: UmidStore,
        _dir: TempDir,
    }

    fn shared_genesis(keypair: &Keypair, umid: &[u8; 32]) -> GenesisConfig {
        let address = address_from_public_key(&keypair.public);
        let bound = umid::compute_bound_hash(&address, umid).unwrap();
        GenesisConfig {
            chain_id: "umid-test".into(),
            timestamp: 0,
            accounts: vec![GenesisAccount {
                address,
                balance: "1000000000".into(),
                bound_umid_hash: Some(hex::encode(bound)),
            }],
        }
    }

    fn test_node(genesis: GenesisConfig, keypair: Keypair, umid: [u8; 32]) -> TestNode {
        let dir = TempDir::new().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open storage");
        let pool = Arc::new(TxPool::new(storage.clone(), 1_000));
        let bus = Arc::new(EventBus::new());
        let network = Arc::new(RecordingNetwork::default());
        let address = address_from_public_key(&keypair.public);
        let chain = Arc::new(
            BlockChain::open(storage, pool.clone(), bus.clone(), genesis).expect("open chain"),
        );
        let driver = SyncDriver::new(chain.clone(), pool.clone(), network.clone(), bus);
        TestNode {
            driver,
            chain,
            pool,
            network,
            keypair,
            umid_store: UmidStore::new(address, umid),
            _dir: dir,
        }
    }

    fn advance(node: &TestNode, blocks: usize) {
        for _ in 0..blocks {
            let block = node
                .chain
                .cast_block(&node.keypair, &node.umid_store, 10)
                .unwrap();
            assert_eq!(
                node.chain.add_block_on_chain(None, block),
                AddBlockResult::Success
            );
        }
    }

    fn from_peer(topic: &'static str, peer: &str, body: Vec<u8>) -> Notification {
        Notification::from_peer(topic, peer.to_string(), Payload::Bytes(body))
    }

    #[test]
    fn lagging_node_requests_and_applies_blocks() {
        let keypair = generate_keypair();
        let umid = [7u8; 32];
        let genesis = shared_genesis(&keypair, &umid);
        let ahead = test_node(genesis.clone(), Keypair::from_bytes(&keypair.to_bytes()).unwrap(), umid);
        let behind = test_node(genesis, keypair, umid);
        advance(&ahead, 2);

        // The lagging node learns about the remote tip.
        let top = encode_block_header(&ahead.chain.query_top_block()).unwrap();
        behind
            .driver
            .handle_block_info_notify(from_peer(TOPIC_BLOCK_INFO_NOTIFY, "peer-a", top))
            .unwrap();
        assert!(!behind.chain.sync_finished());
        let sent = behind.network.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.code, CODE_BLOCK_REQ);
        assert_eq!(decode_height(&sent[0].1.body).unwrap(), 0);

        // The peer answers the request with a batch.
        ahead
            .driver
            .handle_block_req(from_peer(TOPIC_BLOCK_REQ, "peer-b", sent[0].1.body.clone()))
            .unwrap();
        let answer = ahead.network.take();
        assert_eq!(answer[0].1.code, CODE_BLOCK_RESPONSE);

        // Applying the response catches the lagging node up.
        behind
            .driver
            .handle_block_response(from_peer(
                TOPIC_BLOCK_RESPONSE,
                "peer-a",
                answer[0].1.body.clone(),
            ))
            .unwrap();
        assert_eq!(behind.chain.query_top_block().height, 2);
        assert_eq!(
            behind.chain.query_top_block().hash,
            ahead.chain.query_top_block().hash
        );
        assert!(behind.chain.sync_finished());
    }

    #[test]
    fn equal_tips_trigger_no_request() {
        let keypair = generate_keypair();
        let umid = [8u8; 32];
        let genesis = shared_genesis(&keypair, &umid);
        let node = test_node(genesis, keypair, umid);
        let top = encode_block_header(&node.chain.query_top_block()).unwrap();
        node.driver
            .handle_block_info_notify(from_peer(TOPIC_BLOCK_INFO_NOTIFY, "peer-x", top))
            .unwrap();
        assert!(node.network.take().is_empty());
        assert!(node.chain.sync_finished());
    }

    #[test]
    fn tx_sync_feeds_the_pool_and_answers_requests() {
        let keypair = generate_keypair();
        let umid = [9u8; 32];
        let genesis = shared_genesis(&keypair, &umid);
        let node = test_node(genesis, keypair, umid);

        let sender = generate_keypair();
        let mut tx = crate::types::Transaction::new(
            Vec::new(),
            U256::from(5u64),
            0,
            Some("aa".repeat(32)),
            TxType::Transfer,
            U256::from(21_000u64),
            U256::from(1u64),
        );
        tx.sign_with(&sender);
        let body = encode_transactions(std::slice::from_ref(&tx)).unwrap();
        node.driver
            .handle_tx_sync(from_peer(TOPIC_TX_SYNC_NOTIFY, "peer-y", body))
            .unwrap();
        assert!(node.pool.contains(&tx.hash));

        node.driver
            .handle_tx_sync_req(from_peer(TOPIC_TX_SYNC_REQ, "peer-y", Vec::new()))
            .unwrap();
        let sent = node.network.take();
        assert_eq!(sent[0].1.code, CODE_TX_SYNC_RESPONSE);
        let returned = decode_transactions(&sent[0].1.body).unwrap();
        assert_eq!(returned.len(), 1);
        assert_eq!(returned[0].hash, tx.hash);
    }

    #[test]
    fn detached_response_blocks_probe_for_the_fork_root() {
        let keypair = generate_keypair();
        let umid = [6u8; 32];
        let genesis = shared_genesis(&keypair, &umid);
        let ahead = test_node(genesis.clone(), Keypair::from_bytes(&keypair.to_bytes()).unwrap(), umid);
        let behind = test_node(genesis, keypair, umid);
        advance(&ahead, 3);

        // Deliver only the last block; its parent is unknown downstream.
        let orphan = ahead.chain.query_block_by_height(3).unwrap().unwrap();
        let body = encode_blocks(std::slice::from_ref(&orphan)).unwrap();
        behind
            .driver
            .handle_block_response(from_peer(TOPIC_BLOCK_RESPONSE, "peer-a", body))
            .unwrap();
        let sent = behind.network.take();
        assert_eq!(sent.last().unwrap().1.code, CODE_CHAIN_PIECE_REQ);

        // The header piece reveals the common ancestor (genesis).
        behind
            .driver
            .handle_chain_piece_req(from_peer(
                TOPIC_CHAIN_PIECE_REQ,
                "peer-x",
                0u64.to_be_bytes().to_vec(),
            ))
            .unwrap();
        let piece = behind.network.take();
        assert_eq!(piece[0].1.code, CODE_CHAIN_PIECE_INFO);

        let remote_headers = ahead
            .chain
            .batch_get_block_headers_after_height(0, 10)
            .unwrap();
        let info_body = encode_block_headers(&remote_headers).unwrap();
        behind
            .driver
            .handle_chain_piece_info(from_peer(TOPIC_CHAIN_PIECE_INFO, "peer-a", info_body))
            .unwrap();
        let followup = behind.network.take();
        assert_eq!(followup.last().unwrap().1.code, CODE_BLOCK_REQ);
        // Requests restart at the newest shared header, height 0 here.
        assert_eq!(decode_height(&followup.last().unwrap().1.body).unwrap(), 0);
    }
}
