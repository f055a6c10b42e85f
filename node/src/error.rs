use chordkv_lib::dht_messages::DhtMessage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("peer {address} unreachable: {reason}")]
    PeerUnreachable { address: String, reason: String },

    #[error("unexpected response from {address}: {response:?}")]
    UnexpectedResponse {
        address: String,
        response: Box<DhtMessage>,
    },

    #[error("failed to join via {bootstrap}: {reason}")]
    JoinFailure { bootstrap: String, reason: String },

    #[error("owner of key {key:?} unreachable after {attempts} attempts")]
    OwnerUnreachable { key: String, attempts: u32 },

    #[error("owner of key {key:?} still unresolved after {redirects} redirects")]
    OwnerUnresolved { key: String, redirects: u32 },

    #[error("node has already left the ring")]
    AlreadyLeft,

    #[error("handoff to successor {successor} failed, leave rolled back: {reason}")]
    HandoffFailed { successor: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub(crate) fn unexpected(address: &str, response: DhtMessage) -> Self {
        NodeError::UnexpectedResponse {
            address: address.to_string(),
            response: Box::new(response),
        }
    }
}
