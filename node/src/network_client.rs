use async_trait::async_trait;
use chordkv_lib::dht_messages::DhtMessage;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

/// The only way a node talks to another node. Implementations deliver one
/// request and return the peer's reply.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkClient: Send + Sync + 'static {
    async fn call_node(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, TransportError>;
}

pub fn encode_message(message: &DhtMessage) -> Result<Vec<u8>, TransportError> {
    Ok(bincode::serialize(message)?)
}

pub fn decode_message(buffer: &[u8]) -> Result<DhtMessage, TransportError> {
    Ok(bincode::deserialize(buffer)?)
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_CONNECTIONS_PER_HOST: usize = 5;

/// Caps concurrent outbound connections per peer address.
#[derive(Default)]
struct ConnectionLimiter {
    active: HashMap<String, usize>,
}

impl ConnectionLimiter {
    fn try_acquire(&mut self, address: &str, limit: usize) -> bool {
        let count = self.active.entry(address.to_string()).or_insert(0);
        if *count >= limit {
            return false;
        }
        *count += 1;
        true
    }

    fn release(&mut self, address: &str) {
        if let Some(count) = self.active.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.active.remove(address);
            }
        }
    }
}

/// Where a failed call stopped. Once the request has been written the
/// peer may already have acted on it.
enum CallFailure {
    BeforeSend(TransportError),
    AfterSend(TransportError),
}

struct ConnectionPermit {
    address: String,
    limiter: Arc<Mutex<ConnectionLimiter>>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(&self.address);
    }
}

/// TCP transport: one bincode-encoded request per connection, the reply is
/// read until the peer closes its side.
pub struct RealNetworkClient {
    limiter: Arc<Mutex<ConnectionLimiter>>,
    io_timeout: Duration,
}

impl Default for RealNetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RealNetworkClient {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(io_timeout: Duration) -> Self {
        Self {
            limiter: Arc::new(Mutex::new(ConnectionLimiter::default())),
            io_timeout,
        }
    }

    fn acquire_permit(&self, address: &str) -> Result<ConnectionPermit, TransportError> {
        let acquired = self
            .limiter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(address, MAX_CONNECTIONS_PER_HOST);
        if !acquired {
            warn!("Connection limit reached for {}, rejecting request", address);
            return Err(format!("Connection limit exceeded for {}", address).into());
        }
        Ok(ConnectionPermit {
            address: address.to_string(),
            limiter: Arc::clone(&self.limiter),
        })
    }

    /// Retries failed connects. A request that reached the peer is only
    /// resent when repeating it cannot change the outcome.
    async fn call_node_with_retry(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, TransportError> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut last_error: Option<TransportError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                debug!(
                    "Retrying {} (attempt {}/{})",
                    address,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }

            match self.call_once(address, &message).await {
                Ok(response) => return Ok(response),
                Err(CallFailure::BeforeSend(e)) => {
                    debug!("Call to {} failed: {}", address, e);
                    last_error = Some(e);
                }
                Err(CallFailure::AfterSend(e)) if message.is_idempotent() => {
                    debug!("Call to {} failed: {}", address, e);
                    last_error = Some(e);
                }
                Err(CallFailure::AfterSend(e)) => {
                    debug!("Call to {} failed after sending, not retrying: {}", address, e);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "no attempts made".into()))
    }

    async fn call_once(
        &self,
        address: &str,
        message: &DhtMessage,
    ) -> Result<DhtMessage, CallFailure> {
        let (_permit, stream) = self.connect(address).await.map_err(CallFailure::BeforeSend)?;
        self.exchange(address, stream, message)
            .await
            .map_err(CallFailure::AfterSend)
    }

    async fn connect(&self, address: &str) -> Result<(ConnectionPermit, TcpStream), TransportError> {
        let permit = self.acquire_permit(address)?;
        let stream = timeout(self.io_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| format!("connect to {} timed out", address))??;
        Ok((permit, stream))
    }

    async fn exchange(
        &self,
        address: &str,
        mut stream: TcpStream,
        message: &DhtMessage,
    ) -> Result<DhtMessage, TransportError> {
        let encoded = encode_message(message)?;
        timeout(self.io_timeout, stream.write_all(&encoded))
            .await
            .map_err(|_| format!("write to {} timed out", address))??;

        // Half-close so the server sees EOF; failure here is not fatal
        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown error towards {} (non-critical): {}", address, e);
        }

        let mut buffer = Vec::new();
        timeout(self.io_timeout, stream.read_to_end(&mut buffer))
            .await
            .map_err(|_| format!("read from {} timed out", address))??;

        decode_message(&buffer)
    }
}

#[async_trait]
impl NetworkClient for RealNetworkClient {
    async fn call_node(
        &self,
        address: &str,
        message: DhtMessage,
    ) -> Result<DhtMessage, TransportError> {
        self.call_node_with_retry(address, message).await
    }
}
