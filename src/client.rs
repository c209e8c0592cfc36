use crate::crypto::Hash;
use crate::types::{Block, ConsensusNodeState, DebugAction, Height};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;

pub struct NodeClient {
    client: HttpClient,
}

impl NodeClient {
    pub fn new(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let client = HttpClientBuilder::default().build(url)?;
        Ok(Self { client })
    }

    pub async fn node_state(&self) -> Result<ConsensusNodeState, Box<dyn std::error::Error>> {
        let state: ConsensusNodeState = self.client.request("node_state", rpc_params![]).await?;
        Ok(state)
    }

    pub async fn latest_block(&self) -> Result<Option<Block>, Box<dyn std::error::Error>> {
        let block: Option<Block> = self.client.request("latest_block", rpc_params![]).await?;
        Ok(block)
    }

    pub async fn block_by_height(
        &self,
        height: Height,
    ) -> Result<Option<Block>, Box<dyn std::error::Error>> {
        let params = rpc_params![height];
        let block: Option<Block> = self.client.request("block_by_height", params).await?;
        Ok(block)
    }

    pub async fn submit_transaction(&self, tx: &[u8]) -> Result<Hash, Box<dyn std::error::Error>> {
        let params = rpc_params![hex::encode(tx)];
        let hash: Hash = self.client.request("submit_transaction", params).await?;
        Ok(hash)
    }

    pub async fn debug(
        &self,
        action: DebugAction,
        broadcast: bool,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let name = serde_json::to_value(action)?;
        let params = rpc_params![name, Some(broadcast)];
        let _: () = self.client.request("debug", params).await?;
        Ok(())
    }
}
