//! In-process notification bus.
//!
//! Network dispatch, the chain and the sync loop talk through named
//! topics instead of calling each other directly. Publishing clones the
//! notification to every live subscriber of the topic; subscribers that
//! dropped their receiver are pruned on the next publish.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::types::Block;

pub const TOPIC_BLOCK_ADD_SUCC: &str = "block_add_succ";
pub const TOPIC_BLOCK_SYNC: &str = "block_sync";
pub const TOPIC_CONSOLE_MSG: &str = "console_msg";
pub const TOPIC_NEW_BLOCK: &str = "new_block";
pub const TOPIC_BLOCK_REQ: &str = "block_req";
pub const TOPIC_BLOCK_RESPONSE: &str = "block_response";
pub const TOPIC_BLOCK_INFO_NOTIFY: &str = "block_info_notify";
pub const TOPIC_CHAIN_PIECE_REQ: &str = "chain_piece_req";
pub const TOPIC_CHAIN_PIECE_INFO: &str = "chain_piece_info";
pub const TOPIC_TX_SYNC_REQ: &str = "tx_sync_req";
pub const TOPIC_TX_SYNC_RESPONSE: &str = "tx_sync_response";
pub const TOPIC_TX_SYNC_NOTIFY: &str = "tx_sync_notify";

#[derive(Clone, Debug)]
pub enum Payload {
    Empty,
    Bytes(Vec<u8>),
    Text(String),
    Block(Arc<Block>),
}

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
            _ => &[],
        }
    }
}

#[derive(Clone, Debug)]
pub struct Notification {
    pub topic: &'static str,
    /// Peer the triggering message came from, absent for local events.
    pub source: Option<String>,
    pub payload: Payload,
}

impl Notification {
    pub fn local(topic: &'static str, payload: Payload) -> Self {
        Self {
            topic,
            source: None,
            payload,
        }
    }

    pub fn from_peer(topic: &'static str, source: String, payload: Payload) -> Self {
        Self {
            topic,
            source: Some(source),
            payload,
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<&'static str, Vec<UnboundedSender<Notification>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &'static str) -> UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().entry(topic).or_default().push(tx);
        rx
    }

    pub fn publish(&self, notification: Notification) {
        let mut subscribers = self.subscribers.write();
        if let Some(senders) = subscribers.get_mut(notification.topic) {
            senders.retain(|sender| sender.send(notification.clone()).is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifications_reach_every_subscriber_of_the_topic() {
        let bus = EventBus::new();
        let mut first = bus.subscribe(TOPIC_BLOCK_ADD_SUCC);
        let mut second = bus.subscribe(TOPIC_BLOCK_ADD_SUCC);
        let mut other = bus.subscribe(TOPIC_BLOCK_SYNC);

        bus.publish(Notification::local(
            TOPIC_BLOCK_ADD_SUCC,
            Payload::Text("tip".into()),
        ));

        assert_eq!(first.recv().await.unwrap().payload.as_bytes(), b"tip");
        assert_eq!(second.recv().await.unwrap().payload.as_bytes(), b"tip");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let receiver = bus.subscribe(TOPIC_CONSOLE_MSG);
        drop(receiver);
        bus.publish(Notification::local(TOPIC_CONSOLE_MSG, Payload::Empty));
        assert!(bus
            .subscribers
            .read()
            .get(TOPIC_CONSOLE_MSG)
            .map(|senders| senders.is_empty())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn peer_source_travels_with_the_notification() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(TOPIC_BLOCK_REQ);
        bus.publish(Notification::from_peer(
            TOPIC_BLOCK_REQ,
            "peer-1".into(),
            Payload::Bytes(vec![1, 2]),
        ));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.source.as_deref(), Some("peer-1"));
        assert_eq!(got.payload.as_bytes(), &[1, 2]);
    }
}
