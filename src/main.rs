use jsonrpsee::server::Server;
use std::env;
use std::sync::Arc;
use tessera::client::NodeClient;
use tessera::config::NodeConfig;
use tessera::consensus::ConsensusEngine;
use tessera::crypto::{PublicKey, generate_keypair_from_id};
use tessera::network::P2pNetwork;
use tessera::node::Node;
use tessera::rpc::{NodeRpcImpl, NodeRpcServer};
use tessera::storage::{MemStorage, Persistence, RedbStorage};
use tessera::tx_pool::TxPool;
use tessera::types::DebugAction;
use tessera::utility::LedgerUtility;
use tessera::validators::ValidatorSet;
use tokio::sync::mpsc;

const USAGE: &str = "Usage:\n  tessera node [config.json]\n  tessera debug <rpc-url> <action> [--all]\n\nDebug actions: reset, state, next, toggle, latest";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("node") => run_node(args.get(2)).await,
        Some("debug") => {
            let (Some(url), Some(action)) = (args.get(2), args.get(3)) else {
                return Err(USAGE.into());
            };
            let broadcast = args.iter().any(|a| a == "--all");
            run_debug(url, action, broadcast).await
        }
        _ => Err(USAGE.into()),
    }
}

async fn run_debug(
    url: &str,
    action: &str,
    broadcast: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let action: DebugAction = action.parse()?;
    let client = NodeClient::new(url)?;
    client.debug(action, broadcast).await?;
    let state = client.node_state().await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn run_node(config_path: Option<&String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    config.validate()?;

    // 1. Keys and validator set
    let (my_pub, my_key) = generate_keypair_from_id(config.node_id);
    let address = my_pub.address();
    let committee: Vec<PublicKey> = (0..config.validator_count)
        .map(|i| generate_keypair_from_id(i).0)
        .collect();
    let validators = ValidatorSet::new(committee)?;

    // 2. Persistence
    let persistence: Arc<dyn Persistence> = match &config.db_path {
        Some(path) => Arc::new(RedbStorage::new(path)?),
        None => Arc::new(MemStorage::new()),
    };

    // 3. Utility
    let tx_pool = TxPool::default();
    let utility = Arc::new(LedgerUtility::new(tx_pool.clone()));

    // 4. Network
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let network = P2pNetwork::new(address, config.listen_port, inbound_tx).await?;
    for bootnode in &config.bootnodes {
        log::info!("Dialing bootnode {}", bootnode);
        network.dial(bootnode).await?;
    }

    // 5. Consensus
    let engine = ConsensusEngine::new(
        my_key,
        validators,
        persistence.clone(),
        utility,
        config.consensus(),
    )?;
    log::info!(
        "Starting node {} ({}) at height {}",
        config.node_id,
        address,
        engine.height()
    );
    let node = Node::new(
        engine,
        Arc::new(network),
        tx_pool.clone(),
        inbound_rx,
        config.node_options(),
    );

    // 6. RPC
    let rpc_addr = format!("127.0.0.1:{}", config.rpc_port);
    let server = Server::builder().build(rpc_addr).await?;
    let rpc_impl = NodeRpcImpl::new(node.state(), persistence, tx_pool, node.events());
    let rpc_handle = server.start(rpc_impl.into_rpc());
    log::info!("RPC Server started on port {}", config.rpc_port);

    let node_handle = node.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
        _ = node_handle.closed() => {
            log::error!("Consensus loop exited");
        }
    }

    let _ = rpc_handle.stop();
    rpc_handle.stopped().await;
    node_handle.stop().await?;
    Ok(())
}
