//! Karlsen node RPC collaborator
//!
//! The bridge only talks to the node through [`NodeRpc`]; [`NodeConnector`]
//! creates fresh sessions when the current one fails.

pub mod http;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use http::{HttpNodeConnector, HttpNodeSession};

/// Node status as returned by `getInfo`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Peer id of the node
    #[serde(default)]
    pub p2p_id: String,
    /// Number of transactions in the mempool
    #[serde(default)]
    pub mempool_size: u64,
    /// Node software version
    #[serde(default)]
    pub server_version: String,
    /// Whether the UTXO index is enabled
    #[serde(default)]
    pub is_utxo_indexed: bool,
    /// Whether the node has caught up with the network
    pub is_synced: bool,
}

/// DAG summary as returned by `getBlockDagInfo`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockDagInfo {
    #[serde(default)]
    pub network_name: String,
    pub block_count: u64,
    #[serde(default)]
    pub header_count: u64,
    #[serde(default)]
    pub tip_hashes: Vec<String>,
    pub difficulty: f64,
    #[serde(default)]
    pub past_median_time: i64,
    #[serde(default)]
    pub virtual_parent_hashes: Vec<String>,
    #[serde(default)]
    pub pruning_point_hash: String,
    #[serde(default)]
    pub virtual_daa_score: u64,
}

/// Parents of a block at one level of the DAG
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockLevelParents {
    pub parent_hashes: Vec<String>,
}

/// Block header with hashes as hex strings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub version: u16,
    pub parents: Vec<BlockLevelParents>,
    pub hash_merkle_root: String,
    pub accepted_id_merkle_root: String,
    pub utxo_commitment: String,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    pub bits: u32,
    pub nonce: u64,
    pub daa_score: u64,
    /// Big-endian hex of the accumulated blue work
    pub blue_work: String,
    pub blue_score: u64,
    pub pruning_point: String,
}

/// Candidate block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: BlockHeader,
    #[serde(default)]
    pub transactions: Vec<Value>,
}

/// Response to `getBlockTemplate`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTemplate {
    pub block: Block,
    #[serde(default)]
    pub is_synced: bool,
}

/// RPC session with a karlsend node
///
/// Every call is network bound and fallible; errors come back as
/// [`crate::Error::UpstreamUnavailable`] or [`crate::Error::Http`].
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Fetch node status
    async fn get_info(&self) -> Result<NodeInfo>;

    /// Fetch the DAG summary
    async fn get_block_dag_info(&self) -> Result<BlockDagInfo>;

    /// Estimate network hashrate over `window_size` blocks ending at `start_hash`
    async fn estimate_network_hashes_per_second(
        &self,
        start_hash: &str,
        window_size: u32,
    ) -> Result<u64>;

    /// Request a template paying `pay_address`, tagged with `extra_data`
    async fn get_block_template(&self, pay_address: &str, extra_data: &str)
        -> Result<BlockTemplate>;

    /// Deliver a signal on `notify` whenever the node has a new template
    ///
    /// Signals are dropped when the channel is full, so a capacity of one
    /// coalesces bursts into a single pending signal.
    async fn register_for_new_block_template_notifications(
        &self,
        notify: mpsc::Sender<()>,
    ) -> Result<()>;
}

/// Creates node sessions
#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Open a new session against `address`
    async fn connect(&self, address: &str) -> Result<Arc<dyn NodeRpc>>;
}
