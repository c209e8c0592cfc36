use crate::crypto::Hash;
use crate::node::NodeEvent;
use crate::storage::Persistence;
use crate::tx_pool::TxPool;
use crate::types::{Block, ConsensusNodeState, DebugAction, Height};
use jsonrpsee::core::{RpcResult, async_trait};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[rpc(server)]
pub trait NodeRpc {
    #[method(name = "node_state")]
    fn node_state(&self) -> RpcResult<ConsensusNodeState>;

    #[method(name = "latest_block")]
    fn latest_block(&self) -> RpcResult<Option<Block>>;

    #[method(name = "block_by_height")]
    fn block_by_height(&self, height: Height) -> RpcResult<Option<Block>>;

    /// Hex-encoded opaque transaction.
    #[method(name = "submit_transaction")]
    fn submit_transaction(&self, tx: String) -> RpcResult<Hash>;

    /// `broadcast` sends the action to every validator, not just this one.
    #[method(name = "debug")]
    fn debug(&self, action: String, broadcast: Option<bool>) -> RpcResult<()>;
}

fn rpc_error(msg: String) -> ErrorObjectOwned {
    jsonrpsee::types::ErrorObject::owned(-32000, msg, None::<()>)
}

pub struct NodeRpcImpl {
    state: watch::Receiver<ConsensusNodeState>,
    persistence: Arc<dyn Persistence>,
    tx_pool: TxPool,
    events: mpsc::Sender<NodeEvent>,
}

impl NodeRpcImpl {
    pub fn new(
        state: watch::Receiver<ConsensusNodeState>,
        persistence: Arc<dyn Persistence>,
        tx_pool: TxPool,
        events: mpsc::Sender<NodeEvent>,
    ) -> Self {
        Self {
            state,
            persistence,
            tx_pool,
            events,
        }
    }

    fn forward(&self, event: NodeEvent) -> RpcResult<()> {
        self.events
            .try_send(event)
            .map_err(|e| rpc_error(format!("Node is not accepting events: {}", e)))
    }
}

#[async_trait]
impl NodeRpcServer for NodeRpcImpl {
    fn node_state(&self) -> RpcResult<ConsensusNodeState> {
        Ok(*self.state.borrow())
    }

    fn latest_block(&self) -> RpcResult<Option<Block>> {
        self.persistence
            .latest_block()
            .map_err(|e| rpc_error(format!("Storage error: {:?}", e)))
    }

    fn block_by_height(&self, height: Height) -> RpcResult<Option<Block>> {
        self.persistence
            .read(height)
            .map_err(|e| rpc_error(format!("Storage error: {:?}", e)))
    }

    fn submit_transaction(&self, tx: String) -> RpcResult<Hash> {
        let bytes = hex::decode(tx.trim_start_matches("0x"))
            .map_err(|e| rpc_error(format!("Invalid hex: {}", e)))?;
        let hash = self
            .tx_pool
            .add_transaction(bytes.clone())
            .map_err(|e| rpc_error(format!("Pool error: {}", e)))?;
        log::info!("Transaction {} accepted via RPC", hash);
        self.forward(NodeEvent::Transaction(bytes))?;
        Ok(hash)
    }

    fn debug(&self, action: String, broadcast: Option<bool>) -> RpcResult<()> {
        let action: DebugAction = action.parse().map_err(rpc_error)?;
        if broadcast.unwrap_or(false) {
            self.forward(NodeEvent::BroadcastDebug(action))
        } else {
            self.forward(NodeEvent::Debug(action))
        }
    }
}
