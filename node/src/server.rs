use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::NodeError;
use crate::network_client::{decode_message, encode_message, NetworkClient};
use crate::node::{log_error, log_info, ChordNode};

/// Binds the peer-to-peer listener. Kept apart from `serve` so a node can be
/// reachable before it joins.
pub async fn bind(address: &str) -> Result<TcpListener, NodeError> {
    Ok(TcpListener::bind(address).await?)
}

/// Accepts peer connections forever. Each connection carries
/// exactly one request and gets one reply.
pub async fn serve<T: NetworkClient>(node: ChordNode<T>, listener: TcpListener) {
    log_info!(
        node.info.address,
        "Listening for peers on {}",
        listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown address".to_string())
    );

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let node = node.clone();
                tokio::spawn(async move {
                    handle_connection(&node, socket, peer).await;
                });
            }
            Err(e) => {
                log_error!(node.info.address, "Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection<T: NetworkClient>(
    node: &ChordNode<T>,
    mut socket: TcpStream,
    peer: SocketAddr,
) {
    let mut buffer = Vec::new();
    if let Err(e) = socket.read_to_end(&mut buffer).await {
        log_error!(node.info.address, "Failed to read from {}: {}", peer, e);
        return;
    }

    let message = match decode_message(&buffer) {
        Ok(message) => message,
        Err(e) => {
            log_error!(
                node.info.address,
                "Failed to decode message from {}: {}",
                peer,
                e
            );
            return;
        }
    };
    log::debug!("[{}] Received from {}: {:?}", node.info.address, peer, message);

    let response = node.handle_message(message).await;
    let encoded = match encode_message(&response) {
        Ok(encoded) => encoded,
        Err(e) => {
            log_error!(node.info.address, "Failed to encode response: {}", e);
            return;
        }
    };
    if let Err(e) = socket.write_all(&encoded).await {
        log_error!(
            node.info.address,
            "Failed to write response to {}: {}",
            peer,
            e
        );
    }
}
