use std::sync::Arc;

use chordkv_node::{api, server, ChordNode, Config, RealNetworkClient};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = Config::from_env()?;
    let network_client = Arc::new(RealNetworkClient::with_timeout(config.rpc_timeout));
    let node = ChordNode::new(&config, network_client)?;
    info!(
        "Chord node {} starting at {} (api {})",
        chordkv_lib::display_id(&node.id()),
        config.p2p_address,
        config.api_address
    );

    // Peers may call back during the join, so listen first
    let listener = server::bind(&config.p2p_address).await?;
    tokio::spawn(server::serve(node.clone(), listener));

    node.join(config.bootstrap_address.as_deref()).await?;
    node.spawn_stabilizer();

    let api_node = node.clone();
    let api_address = config.api_address.clone();
    let api_bootstrap = config.bootstrap_address.clone();
    tokio::spawn(async move {
        if let Err(e) = api::run(api_node, &api_address, api_bootstrap).await {
            error!("API server stopped: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, leaving the ring");
    if let Err(e) = node.leave().await {
        error!("Graceful leave failed: {}", e);
    }
    Ok(())
}
