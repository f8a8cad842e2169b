use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;

use agentmesh_node::{
    api::{self, ApiState},
    config::Config,
    identity::NodeIdentity,
    network::{self, SwarmTransport},
    node::MeshNode,
};
use agentmesh_resolver::{AggregatorResolver, IdentityResolver, NoopResolver, SatiRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agentmesh_node=info,libp2p=warn")),
        )
        .init();

    let config = Config::parse();
    let node_config = config.node_config()?;
    let identity = NodeIdentity::load_or_generate(&config.keypair_path)?;

    let resolver: Arc<dyn IdentityResolver> = match &config.aggregator_url {
        Some(url) => {
            let sati = config.rpc_url.as_deref().map(SatiRegistry::new);
            Arc::new(AggregatorResolver::new(url, sati)?)
        }
        None => {
            tracing::info!("No aggregator configured; chain reputation disabled");
            Arc::new(NoopResolver)
        }
    };

    let swarm = network::build_swarm(
        identity.libp2p_keypair.clone(),
        config.listen_addr.clone(),
        &config.bootstrap,
    )?;

    // Full multiaddr so operators can hand it out as a bootstrap address.
    tracing::info!(
        peer_id = %swarm.local_peer_id(),
        listen  = %config.listen_addr,
        "agentmesh bootstrap multiaddr: {}/p2p/{}",
        config.listen_addr,
        swarm.local_peer_id(),
    );

    let cancel = CancellationToken::new();
    let (node, handle) = MeshNode::new(node_config, &identity, resolver, cancel.clone());

    if let Some(addr) = &config.api_addr {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid api_addr {addr}: {e}"))?;
        let state = ApiState { node: handle.clone() };
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, addr).await {
                tracing::error!("{e}");
            }
        });
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!("Ctrl-C handler unavailable: {e}"),
        }
    });

    node.run(SwarmTransport::new(swarm)).await
}
