use async_trait::async_trait;
use chordkv_lib::dht_messages::DhtMessage;
use chordkv_node::NetworkClient;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

/// Request ID for correlating requests in logs
pub type RequestId = u64;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes DHT messages between in-process nodes without TCP connections
#[derive(Clone)]
pub struct NetworkSimulator {
    /// Maps node addresses to their inbound request channels
    nodes: Arc<RwLock<HashMap<String, mpsc::UnboundedSender<SimulatorMessage>>>>,
    /// Controls message delivery timing and failures
    delivery_controller: Arc<RwLock<DeliveryController>>,
    next_request_id: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

/// A request as seen by the receiving node
#[derive(Debug)]
pub struct SimulatorMessage {
    pub from: String,
    pub message: DhtMessage,
    pub request_id: RequestId,
    pub response_sender: oneshot::Sender<DhtMessage>,
}

#[derive(Default)]
struct DeliveryController {
    /// Addresses that should fail message delivery
    failed_nodes: HashSet<String>,
    /// Simulated one-way latency in milliseconds
    latency_ms: u64,
    /// Drop rate for messages (0.0 to 1.0)
    drop_rate: f64,
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            delivery_controller: Arc::new(RwLock::new(DeliveryController::default())),
            next_request_id: Arc::new(AtomicU64::new(1)),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a node with the simulator
    pub async fn register_node(
        &self,
        address: String,
        sender: mpsc::UnboundedSender<SimulatorMessage>,
    ) {
        self.nodes.write().await.insert(address, sender);
    }

    /// Remove a node from the simulator entirely
    pub async fn unregister_node(&self, address: &str) {
        self.nodes.write().await.remove(address);
    }

    /// Mark a node as failed (messages to it will not be delivered)
    pub async fn mark_node_failed(&self, address: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_nodes
            .insert(address.to_string());
    }

    pub async fn mark_node_recovered(&self, address: &str) {
        self.delivery_controller
            .write()
            .await
            .failed_nodes
            .remove(address);
    }

    pub async fn is_node_failed(&self, address: &str) -> bool {
        self.delivery_controller
            .read()
            .await
            .failed_nodes
            .contains(address)
    }

    pub async fn set_latency(&self, latency_ms: u64) {
        self.delivery_controller.write().await.latency_ms = latency_ms;
    }

    /// Set message drop rate (0.0 = no drops, 1.0 = drop all)
    pub async fn set_drop_rate(&self, drop_rate: f64) {
        self.delivery_controller.write().await.drop_rate = drop_rate.clamp(0.0, 1.0);
    }

    /// Number of requests that reached their target so far
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Create a NetworkClient for a specific node
    pub fn create_client(&self, from_address: String) -> SimulatedNetworkClient {
        SimulatedNetworkClient {
            simulator: self.clone(),
            from_address,
        }
    }
}

/// NetworkClient implementation that uses the simulator for message delivery
#[derive(Clone)]
pub struct SimulatedNetworkClient {
    simulator: NetworkSimulator,
    from_address: String,
}

#[async_trait]
impl NetworkClient for SimulatedNetworkClient {
    async fn call_node(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, Box<dyn std::error::Error + Send + Sync>> {
        let (failed, latency_ms, drop_rate) = {
            let controller = self.simulator.delivery_controller.read().await;
            (
                controller.failed_nodes.contains(address)
                    || controller.failed_nodes.contains(&self.from_address),
                controller.latency_ms,
                controller.drop_rate,
            )
        };

        if failed {
            return Err(format!("Node {} is marked as failed", address).into());
        }
        if drop_rate > 0.0 && rand::random::<f64>() < drop_rate {
            return Err("Message dropped by simulator".into());
        }
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }

        let sender = self
            .simulator
            .nodes
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| format!("Node {} not registered", address))?;

        let request_id = self
            .simulator
            .next_request_id
            .fetch_add(1, Ordering::SeqCst);
        let (response_tx, response_rx) = oneshot::channel();

        sender
            .send(SimulatorMessage {
                from: self.from_address.clone(),
                message,
                request_id,
                response_sender: response_tx,
            })
            .map_err(|_| format!("Node {} stopped receiving", address))?;
        self.simulator.delivered.fetch_add(1, Ordering::SeqCst);

        match tokio::time::timeout(DELIVERY_TIMEOUT, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(format!("Request {} dropped by {}", request_id, address).into()),
            Err(_) => Err(format!("Request {} to {} timed out", request_id, address).into()),
        }
    }
}
