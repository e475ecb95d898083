//! Network boundary.
//!
//! The node never talks to a transport directly. Outbound traffic goes
//! through the [`Network`] trait, inbound frames come back through
//! [`DispatchBridge::deliver`], which maps the wire code onto a bus topic
//! and publishes the body. Unknown codes are logged and dropped so a
//! newer peer cannot wedge the node.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bus::{
    EventBus, Notification, Payload, TOPIC_BLOCK_INFO_NOTIFY, TOPIC_BLOCK_REQ,
    TOPIC_BLOCK_RESPONSE, TOPIC_CHAIN_PIECE_INFO, TOPIC_CHAIN_PIECE_REQ, TOPIC_NEW_BLOCK,
    TOPIC_TX_SYNC_NOTIFY, TOPIC_TX_SYNC_REQ, TOPIC_TX_SYNC_RESPONSE,
};
use crate::errors::{ChainError, ChainResult};

pub const CODE_NEW_BLOCK: u32 = 1;
pub const CODE_BLOCK_REQ: u32 = 2;
pub const CODE_BLOCK_RESPONSE: u32 = 3;
pub const CODE_BLOCK_INFO_NOTIFY: u32 = 4;
pub const CODE_CHAIN_PIECE_REQ: u32 = 5;
pub const CODE_CHAIN_PIECE_INFO: u32 = 6;
pub const CODE_TX_SYNC_REQ: u32 = 7;
pub const CODE_TX_SYNC_RESPONSE: u32 = 8;
pub const CODE_TX_SYNC_NOTIFY: u32 = 9;

/// A framed wire message: 4-byte big-endian code followed by the body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub code: u32,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(code: u32, body: Vec<u8>) -> Self {
        Self { code, body }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + self.body.len());
        frame.extend_from_slice(&self.code.to_be_bytes());
        frame.extend_from_slice(&self.body);
        frame
    }

    pub fn decode(frame: &[u8]) -> ChainResult<Self> {
        if frame.len() < 4 {
            return Err(ChainError::Codec(format!(
                "frame too short for a message header: {} bytes",
                frame.len()
            )));
        }
        let code = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        Ok(Self {
            code,
            body: frame[4..].to_vec(),
        })
    }
}

fn topic_for_code(code: u32) -> Option<&'static str> {
    match code {
        CODE_NEW_BLOCK => Some(TOPIC_NEW_BLOCK),
        CODE_BLOCK_REQ => Some(TOPIC_BLOCK_REQ),
        CODE_BLOCK_RESPONSE => Some(TOPIC_BLOCK_RESPONSE),
        CODE_BLOCK_INFO_NOTIFY => Some(TOPIC_BLOCK_INFO_NOTIFY),
        CODE_CHAIN_PIECE_REQ => Some(TOPIC_CHAIN_PIECE_REQ),
        CODE_CHAIN_PIECE_INFO => Some(TOPIC_CHAIN_PIECE_INFO),
        CODE_TX_SYNC_REQ => Some(TOPIC_TX_SYNC_REQ),
        CODE_TX_SYNC_RESPONSE => Some(TOPIC_TX_SYNC_RESPONSE),
        CODE_TX_SYNC_NOTIFY => Some(TOPIC_TX_SYNC_NOTIFY),
        _ => None,
    }
}

/// A live peer connection as seen by the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conn {
    pub id: String,
    pub ip: String,
    pub port: u16,
}

/// Outbound transport operations the chain and sync loop rely on.
pub trait Network: Send + Sync {
    fn send_to_peer(&self, peer: &str, message: Message) -> ChainResult<()>;

    fn broadcast(&self, message: Message) -> ChainResult<()>;

    /// Forwards to a random subset of neighbors instead of everyone, used
    /// for gossip that peers re-relay.
    fn transmit_to_neighbor(&self, message: Message) -> ChainResult<()>;

    fn peer_count(&self) -> usize;

    /// The currently connected peers with their remote endpoints.
    fn conn_info(&self) -> Vec<Conn> {
        Vec::new()
    }
}

/// Turns raw inbound frames into bus notifications.
pub struct DispatchBridge {
    bus: Arc<EventBus>,
}

impl DispatchBridge {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn deliver(&self, peer: &str, frame: &[u8]) {
        let message = match Message::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(peer, %err, "dropping undecodable frame");
                return;
            }
        };
        let Some(topic) = topic_for_code(message.code) else {
            debug!(peer, code = message.code, "dropping message with unknown code");
            return;
        };
        self.bus.publish(Notification::from_peer(
            topic,
            peer.to_string(),
            Payload::Bytes(message.body),
        ));
    }
}

/// Transport that loops every outbound message straight back into the
/// local dispatch. Lets a node run standalone and drives tests.
pub struct LoopbackNetwork {
    bridge: DispatchBridge,
    local_peer: String,
}

impl LoopbackNetwork {
    pub fn new(bus: Arc<EventBus>, local_peer: impl Into<String>) -> Self {
        Self {
            bridge: DispatchBridge::new(bus),
            local_peer: local_peer.into(),
        }
    }
}

impl Network for LoopbackNetwork {
    fn send_to_peer(&self, _peer: &str, message: Message) -> ChainResult<()> {
        self.bridge.deliver(&self.local_peer, &message.encode());
        Ok(())
    }

    fn broadcast(&self, message: Message) -> ChainResult<()> {
        self.bridge.deliver(&self.local_peer, &message.encode());
        Ok(())
    }

    fn transmit_to_neighbor(&self, message: Message) -> ChainResult<()> {
        self.broadcast(message)
    }

    fn peer_count(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let message = Message::new(CODE_BLOCK_REQ, vec![9, 8, 7]);
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(matches!(
            Message::decode(&[0, 0, 1]),
            Err(ChainError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_routes_codes_onto_their_topics() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe(TOPIC_NEW_BLOCK);
        let bridge = DispatchBridge::new(bus);

        bridge.deliver("peer-7", &Message::new(CODE_NEW_BLOCK, vec![5]).encode());
        let got = rx.recv().await.unwrap();
        assert_eq!(got.source.as_deref(), Some("peer-7"));
        assert_eq!(got.payload.as_bytes(), &[5]);
    }

    #[tokio::test]
    async fn unknown_codes_are_dropped_silently() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe(TOPIC_NEW_BLOCK);
        let bridge = DispatchBridge::new(bus.clone());
        bridge.deliver("peer-1", &Message::new(999, vec![1]).encode());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn conn_info_reports_remote_endpoints() {
        struct FixedNetwork;
        impl Network for FixedNetwork {
            fn send_to_peer(&self, _peer: &str, _message: Message) -> ChainResult<()> {
                Ok(())
            }
            fn broadcast(&self, _message: Message) -> ChainResult<()> {
                Ok(())
            }
            fn transmit_to_neighbor(&self, _message: Message) -> ChainResult<()> {
                Ok(())
            }
            fn peer_count(&self) -> usize {
                1
            }
            fn conn_info(&self) -> Vec<Conn> {
                vec![Conn {
                    id: "peer-1".into(),
                    ip: "10.0.0.4".into(),
                    port: 30303,
                }]
            }
        }
        let conns = FixedNetwork.conn_info();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].id, "peer-1");
        assert_eq!(conns[0].port, 30303);
        // The loopback transport has no remote peers to report.
        let network = LoopbackNetwork::new(Arc::new(EventBus::new()), "self");
        assert!(network.conn_info().is_empty());
    }

    #[tokio::test]
    async fn loopback_delivers_broadcasts_to_the_local_bus() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe(TOPIC_TX_SYNC_NOTIFY);
        let network = LoopbackNetwork::new(bus, "self");
        network
            .broadcast(Message::new(CODE_TX_SYNC_NOTIFY, vec![3, 3]))
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.source.as_deref(), Some("self"));
        assert_eq!(got.payload.as_bytes(), &[3, 3]);
    }
}
