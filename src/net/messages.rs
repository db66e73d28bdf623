//! Wire protocol messages.
//!
//! One tagged enum per connection; `MsgCode` is the dispatch key. Requests
//! carry explicit fetch limits enforced on the serving side, and every
//! frame is capped at `MAX_MSG_SIZE` before decode.

use crate::types::{Block, BlockBody, Hash32, Header, Receipt, Tx};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 2;
/// Versions this node can speak, newest first.
pub const SUPPORTED_VERSIONS: &[u32] = &[2, 1];

/// Hard cap on a single framed message.
pub const MAX_MSG_SIZE: usize = 10 * 1024 * 1024;
/// Soft cap on the encoded size of one response.
pub const SOFT_RESPONSE_LIMIT: usize = 2 * 1024 * 1024;

pub const MAX_HEADERS_FETCH: usize = 192;
pub const MAX_BODIES_FETCH: usize = 128;
pub const MAX_RECEIPTS_FETCH: usize = 256;
pub const MAX_NODE_DATA_FETCH: usize = 384;

/// Connection-level role a peer announces at handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// Consensus node: participates in block production.
    Consensus,
    /// Ranger node: follows the chain, serves data.
    Ranger,
    /// Bridge node: relays between networks.
    Bridge,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    pub protocol_version: u32,
    pub network_id: u64,
    /// Total difficulty at our head.
    pub td: u128,
    pub head: Hash32,
    pub genesis: Hash32,
    pub node_id: String,
    pub role: PeerRole,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashOrNumber {
    Hash(Hash32),
    Number(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockHeadersData {
    pub origin: HashOrNumber,
    pub amount: u64,
    pub skip: u64,
    pub reverse: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHashNumber {
    pub hash: Hash32,
    pub number: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    Status(StatusData),
    GetBlockHeaders(GetBlockHeadersData),
    BlockHeaders(Vec<Header>),
    GetBlockBodies(Vec<Hash32>),
    BlockBodies(Vec<BlockBody>),
    GetNodeData(Vec<Hash32>),
    NodeData(Vec<Vec<u8>>),
    GetReceipts(Vec<Hash32>),
    Receipts(Vec<Vec<Receipt>>),
    NewBlockHashes(Vec<BlockHashNumber>),
    NewBlock { block: Block, td: u128 },
    Transactions(Vec<Tx>),
    /// Opaque consensus sub-protocol payload riding the same connection.
    Consensus(Vec<u8>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MsgCode {
    Status,
    GetBlockHeaders,
    BlockHeaders,
    GetBlockBodies,
    BlockBodies,
    GetNodeData,
    NodeData,
    GetReceipts,
    Receipts,
    NewBlockHashes,
    NewBlock,
    Transactions,
    Consensus,
}

impl Msg {
    pub fn code(&self) -> MsgCode {
        match self {
            Msg::Status(_) => MsgCode::Status,
            Msg::GetBlockHeaders(_) => MsgCode::GetBlockHeaders,
            Msg::BlockHeaders(_) => MsgCode::BlockHeaders,
            Msg::GetBlockBodies(_) => MsgCode::GetBlockBodies,
            Msg::BlockBodies(_) => MsgCode::BlockBodies,
            Msg::GetNodeData(_) => MsgCode::GetNodeData,
            Msg::NodeData(_) => MsgCode::NodeData,
            Msg::GetReceipts(_) => MsgCode::GetReceipts,
            Msg::Receipts(_) => MsgCode::Receipts,
            Msg::NewBlockHashes(_) => MsgCode::NewBlockHashes,
            Msg::NewBlock { .. } => MsgCode::NewBlock,
            Msg::Transactions(_) => MsgCode::Transactions,
            Msg::Consensus(_) => MsgCode::Consensus,
        }
    }
}
