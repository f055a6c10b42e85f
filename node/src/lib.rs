//! Chord DHT node library
//!
//! The protocol engine behind the `chordkv-node` binary: ring state, lookup
//! routing, stabilization, key storage with migration and membership
//! changes. Every cross-node call goes through [`NetworkClient`], so the
//! engine can be driven over TCP or by an in-process simulator in tests.

pub mod api;
pub mod error;
pub mod keystore;
pub mod membership;
pub mod network_client;
pub mod node;
pub mod router;
pub mod server;
pub mod stabilizer;
pub mod state;

use std::time::Duration;

pub use error::NodeError;
pub use network_client::{NetworkClient, RealNetworkClient};
pub use node::ChordNode;
pub use router::Lookup;
pub use state::RingState;

pub use chordkv_lib::dht_messages::{DhtMessage, NodeId, NodeInfo};
pub use chordkv_lib::metrics::NodeMetrics;
pub use chordkv_lib::IdentifierSpace;

/// Configuration for a ChordNode
#[derive(Debug, Clone)]
pub struct Config {
    pub p2p_address: String,
    pub api_address: String,
    /// Fixed ring position; hashed from `p2p_address` when absent.
    pub node_id: Option<NodeId>,
    /// Width m of the identifier space.
    pub bits: u32,
    pub stabilize_interval: Duration,
    pub rpc_timeout: Duration,
    pub bootstrap_address: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_address: "127.0.0.1:8000".to_string(),
            api_address: "127.0.0.1:9000".to_string(),
            node_id: None,
            bits: IdentifierSpace::MAX_BITS,
            stabilize_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(5),
            bootstrap_address: None,
        }
    }
}

impl Config {
    /// Reads the `CHORD_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, NodeError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, NodeError> {
        let mut config = Config::default();

        if let Some(address) = var("CHORD_ADDRESS") {
            config.p2p_address = address;
        }
        if let Some(address) = var("CHORD_API_ADDRESS") {
            config.api_address = address;
        }
        config.bootstrap_address = var("CHORD_BOOTSTRAP").filter(|a| !a.trim().is_empty());

        if let Some(bits) = var("CHORD_BITS") {
            config.bits = parse_number("CHORD_BITS", &bits)?;
        }
        if let Some(id) = var("CHORD_NODE_ID") {
            config.node_id = Some(chordkv_lib::parse_id(&id).ok_or_else(|| {
                NodeError::InvalidConfig(format!("CHORD_NODE_ID is not a valid identifier: {}", id))
            })?);
        }
        if let Some(ms) = var("CHORD_STABILIZE_INTERVAL_MS") {
            config.stabilize_interval =
                Duration::from_millis(parse_number("CHORD_STABILIZE_INTERVAL_MS", &ms)?);
        }
        if let Some(ms) = var("CHORD_RPC_TIMEOUT_MS") {
            config.rpc_timeout = Duration::from_millis(parse_number("CHORD_RPC_TIMEOUT_MS", &ms)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if IdentifierSpace::new(self.bits).is_none() {
            return Err(NodeError::InvalidConfig(format!(
                "ring width must be 1..={} bits, got {}",
                IdentifierSpace::MAX_BITS,
                self.bits
            )));
        }
        if self.stabilize_interval.is_zero() {
            return Err(NodeError::InvalidConfig(
                "stabilize interval must be positive".to_string(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(NodeError::InvalidConfig(
                "rpc timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<N: std::str::FromStr>(name: &str, value: &str) -> Result<N, NodeError> {
    value
        .trim()
        .parse()
        .map_err(|_| NodeError::InvalidConfig(format!("{} is not a number: {:?}", name, value)))
}
