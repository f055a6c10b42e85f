use serde::{Deserialize, Serialize};

pub const ID_BYTES: usize = 20;

// Ring identifier, big-endian; only the low m bits are ever set
pub type NodeId = [u8; ID_BYTES];

/// A key/value pair as it travels during migration.
pub type Entry = (String, Vec<u8>);

/// Reference to a ring member: its identifier plus where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
    pub api_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtMessage {
    // Find the node owning an identifier
    FindSuccessor {
        id: NodeId,
    },
    // Response to FindSuccessor; `hops` counts the forwards taken
    FoundSuccessor {
        node: NodeInfo,
        hops: u32,
    },
    // Request for a node's immediate successor
    GetSuccessor,
    Successor {
        node: NodeInfo,
    },
    // Request for a node's predecessor
    GetPredecessor,
    Predecessor {
        node: Option<NodeInfo>,
    },
    // The sender believes it might be our predecessor
    Notify {
        candidate: NodeInfo,
    },
    // Liveness probe
    Ping,
    Pong {
        alive: bool,
    },
    // Key operations against the receiver's local store
    Get {
        key: String,
    },
    Value {
        key: String,
        value: Option<Vec<u8>>,
    },
    Put {
        key: String,
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
    Deleted {
        key: String,
        existed: bool,
    },
    // The receiver does not own `key`; `owner` is closer to it
    NotOwner {
        key: String,
        owner: NodeInfo,
    },
    // Copy of every key in (low_exclusive, high_inclusive] the receiver
    // holds but no longer owns. Nothing is removed until `ReleaseEntries`
    TransferRange {
        low_exclusive: NodeId,
        high_inclusive: NodeId,
    },
    Entries {
        entries: Vec<Entry>,
    },
    // The sender now holds these entries; drop the ones still unchanged
    ReleaseEntries {
        entries: Vec<Entry>,
    },
    // Keys pushed to their new owner. With `leaving` set the sender is
    // departing and the receiver also takes over `predecessor`
    Handoff {
        from: NodeInfo,
        leaving: bool,
        predecessor: Option<NodeInfo>,
        entries: Vec<Entry>,
    },
    // Sent by a leaving node to its predecessor
    SpliceSuccessor {
        leaving: NodeInfo,
        successor: NodeInfo,
    },
    Ack,
    Error {
        message: String,
    },
}

impl DhtMessage {
    /// Whether delivering this request twice leaves the receiver in the same
    /// state as delivering it once. Only these may be resent after the
    /// request could have reached the peer.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            DhtMessage::FindSuccessor { .. }
                | DhtMessage::GetSuccessor
                | DhtMessage::GetPredecessor
                | DhtMessage::Notify { .. }
                | DhtMessage::Ping
                | DhtMessage::Get { .. }
                | DhtMessage::TransferRange { .. }
                | DhtMessage::ReleaseEntries { .. }
        )
    }
}
