pub mod client;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod network;
pub mod node;
pub mod pacemaker;
pub mod quorum;
pub mod rpc;
pub mod state_sync;
pub mod storage;
pub mod tx_pool;
pub mod types;
pub mod utility;
pub mod validators;
