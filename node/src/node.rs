use chordkv_lib::dht_messages::{DhtMessage, NodeId, NodeInfo};
use chordkv_lib::metrics::NodeMetrics;
use chordkv_lib::{display_id, IdentifierSpace};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::NodeError;
use crate::network_client::NetworkClient;
use crate::state::RingState;
use crate::Config;

macro_rules! log_info {
    ($address:expr, $($arg:tt)*) => ({
        ::log::info!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_warn {
    ($address:expr, $($arg:tt)*) => ({
        ::log::warn!("[{}] {}", $address, format_args!($($arg)*));
    })
}

macro_rules! log_error {
    ($address:expr, $($arg:tt)*) => ({
        ::log::error!("[{}] {}", $address, format_args!($($arg)*));
    })
}

pub(crate) use {log_error, log_info, log_warn};

pub struct ChordNode<T: NetworkClient> {
    pub info: NodeInfo,
    pub(crate) space: IdentifierSpace,
    pub(crate) state: Arc<Mutex<RingState>>,
    pub(crate) alive: Arc<AtomicBool>,
    pub(crate) metrics: Arc<Mutex<NodeMetrics>>,
    pub(crate) stabilizer: Arc<Mutex<Option<JoinHandle<()>>>>,
    pub(crate) network_client: Arc<T>,
    pub(crate) rpc_timeout: Duration,
    pub(crate) stabilize_interval: Duration,
}

// Clones share the same state; only the handles are duplicated
impl<T: NetworkClient> Clone for ChordNode<T> {
    fn clone(&self) -> Self {
        ChordNode {
            info: self.info.clone(),
            space: self.space,
            state: self.state.clone(),
            alive: self.alive.clone(),
            metrics: self.metrics.clone(),
            stabilizer: self.stabilizer.clone(),
            network_client: self.network_client.clone(),
            rpc_timeout: self.rpc_timeout,
            stabilize_interval: self.stabilize_interval,
        }
    }
}

impl<T: NetworkClient> std::fmt::Debug for ChordNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChordNode")
            .field("id", &display_id(&self.info.id))
            .field("address", &self.info.address)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<T: NetworkClient> ChordNode<T> {
    pub fn new(config: &Config, network_client: Arc<T>) -> Result<Self, NodeError> {
        config.validate()?;
        let space = IdentifierSpace::new(config.bits).ok_or_else(|| {
            NodeError::InvalidConfig(format!("unsupported ring width {}", config.bits))
        })?;

        let id = match config.node_id {
            Some(id) => space.reduce(&chordkv_lib::node_id_to_biguint(&id)),
            None => space.hash(&config.p2p_address),
        };
        let info = NodeInfo {
            id,
            address: config.p2p_address.clone(),
            api_address: config.api_address.clone(),
        };

        Ok(ChordNode {
            state: Arc::new(Mutex::new(RingState::new(&info, &space))),
            info,
            space,
            alive: Arc::new(AtomicBool::new(true)),
            metrics: Arc::new(Mutex::new(NodeMetrics::default())),
            stabilizer: Arc::new(Mutex::new(None)),
            network_client,
            rpc_timeout: config.rpc_timeout,
            stabilize_interval: config.stabilize_interval,
        })
    }

    pub fn id(&self) -> NodeId {
        self.info.id
    }

    pub fn space(&self) -> &IdentifierSpace {
        &self.space
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    // A panic while the lock was held cannot leave RingState half-written:
    // every mutation is a single field assignment or map operation.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_metrics(&self) -> MutexGuard<'_, NodeMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn successor(&self) -> NodeInfo {
        self.lock_state().successor.clone()
    }

    pub fn predecessor(&self) -> Option<NodeInfo> {
        self.lock_state().predecessor.clone()
    }

    pub fn finger_table(&self) -> Vec<NodeInfo> {
        self.lock_state().finger_table.clone()
    }

    /// Consistent copy of all pointers and the local shard.
    pub fn state_snapshot(&self) -> RingState {
        self.lock_state().clone()
    }

    pub fn metrics(&self) -> NodeMetrics {
        let local_key_count = self.lock_state().store.len() as u64;
        let mut metrics = self.lock_metrics().clone();
        metrics.local_key_count = local_key_count;
        metrics
    }

    pub(crate) fn is_self(&self, node: &NodeInfo) -> bool {
        node.id == self.info.id
    }

    /// Sends one request to a peer. A timeout, a transport failure and an
    /// `Error` reply all mean the peer cannot be relied on.
    pub(crate) async fn call_peer(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, NodeError> {
        let unreachable = |reason: String| NodeError::PeerUnreachable {
            address: address.to_string(),
            reason,
        };

        match tokio::time::timeout(
            self.rpc_timeout,
            self.network_client.call_node(address, message),
        )
        .await
        {
            Ok(Ok(DhtMessage::Error { message })) => Err(unreachable(message)),
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!(
                "no response within {:?}",
                self.rpc_timeout
            ))),
        }
    }

    /// Liveness probe; any failure to answer counts as dead.
    pub(crate) async fn ping(&self, peer: &NodeInfo) -> bool {
        if self.is_self(peer) {
            return self.is_alive();
        }
        match self.call_peer(&peer.address, DhtMessage::Ping).await {
            Ok(DhtMessage::Pong { alive }) => alive,
            Ok(other) => {
                debug!(
                    "[{}] Ping: unexpected reply from {}: {:?}",
                    self.info.address, peer.address, other
                );
                false
            }
            Err(e) => {
                debug!("[{}] Ping: {}", self.info.address, e);
                false
            }
        }
    }

    pub(crate) async fn fetch_predecessor(
        &self,
        peer: &NodeInfo,
    ) -> Result<Option<NodeInfo>, NodeError> {
        if self.is_self(peer) {
            return Ok(self.predecessor());
        }
        match self
            .call_peer(&peer.address, DhtMessage::GetPredecessor)
            .await?
        {
            DhtMessage::Predecessor { node } => Ok(node),
            other => Err(NodeError::unexpected(&peer.address, other)),
        }
    }

    pub(crate) async fn fetch_successor(&self, peer: &NodeInfo) -> Result<NodeInfo, NodeError> {
        if self.is_self(peer) {
            return Ok(self.successor());
        }
        match self.call_peer(&peer.address, DhtMessage::GetSuccessor).await? {
            DhtMessage::Successor { node } => Ok(node),
            other => Err(NodeError::unexpected(&peer.address, other)),
        }
    }

    /// Follows successor pointers around the ring starting from this node.
    /// Stops on returning to the start, on an unreachable member, or after
    /// `limit` members.
    pub async fn walk_ring(&self, limit: usize) -> Vec<NodeInfo> {
        let mut members = vec![self.info.clone()];
        let mut current = self.successor();

        while members.len() < limit && !self.is_self(&current) {
            members.push(current.clone());
            match self.fetch_successor(&current).await {
                Ok(next) => current = next,
                Err(e) => {
                    log_warn!(self.info.address, "Ring walk stopped: {}", e);
                    break;
                }
            }
        }
        members
    }

    /// Serves one inbound request. This is the whole RPC surface a transport
    /// has to deliver.
    pub async fn handle_message(&self, message: DhtMessage) -> DhtMessage {
        if !self.is_alive() && !matches!(message, DhtMessage::Ping) {
            return DhtMessage::Error {
                message: format!("node {} has left the ring", self.info.address),
            };
        }

        match message {
            DhtMessage::FindSuccessor { id } => {
                let lookup = self.lookup(id).await;
                DhtMessage::FoundSuccessor {
                    node: lookup.node,
                    hops: lookup.hops,
                }
            }
            DhtMessage::GetSuccessor => DhtMessage::Successor {
                node: self.successor(),
            },
            DhtMessage::GetPredecessor => DhtMessage::Predecessor {
                node: self.predecessor(),
            },
            DhtMessage::Notify { candidate } => {
                self.notify(candidate).await;
                DhtMessage::Ack
            }
            DhtMessage::Ping => DhtMessage::Pong {
                alive: self.is_alive(),
            },
            request @ (DhtMessage::Get { .. }
            | DhtMessage::Put { .. }
            | DhtMessage::Delete { .. }) => self.serve_key_request(request),
            DhtMessage::TransferRange {
                low_exclusive,
                high_inclusive,
            } => DhtMessage::Entries {
                entries: self.transfer_range(&low_exclusive, &high_inclusive),
            },
            DhtMessage::ReleaseEntries { entries } => {
                self.release_entries(&entries);
                DhtMessage::Ack
            }
            DhtMessage::Handoff {
                from,
                leaving,
                predecessor,
                entries,
            } => {
                self.absorb_handoff(from, leaving, predecessor, entries);
                DhtMessage::Ack
            }
            DhtMessage::SpliceSuccessor { leaving, successor } => {
                self.splice_successor(leaving, successor);
                DhtMessage::Ack
            }
            other => {
                log_error!(
                    self.info.address,
                    "Unsupported message received: {:?}",
                    other
                );
                DhtMessage::Error {
                    message: "Unsupported message type".to_string(),
                }
            }
        }
    }

    pub fn debug_ring_state(&self) {
        let state = self.state_snapshot();
        debug!(
            "[{}] Ring state: self={}, pred={}, succ={}, keys={}",
            self.info.address,
            display_id(&self.info.id),
            state
                .predecessor
                .as_ref()
                .map(|p| display_id(&p.id))
                .unwrap_or_else(|| "None".to_string()),
            display_id(&state.successor.id),
            state.store.len()
        );
    }
}
