//! Consensus engine capability interface.
//!
//! The core never looks inside an engine: the assembler calls `prepare`,
//! `finalize`, and `seal`; block import calls `verify_header`; the protocol
//! manager offers every inbound wire message to the engine's optional
//! handler first (consensus sub-protocols ride the same connection).

use crate::state::StateDb;
use crate::types::{receipts_root, tx_root, Block, BlockNumber, Hash32, Header, Receipt, Tx};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown parent: {0}")]
    UnknownParent(Hash32),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("invalid seal")]
    InvalidSeal,
    #[error("finalize failed: {0}")]
    Finalize(String),
    #[error("consensus message rejected: {0}")]
    Message(String),
}

/// Read-only chain access handed to the engine.
pub trait ChainReader: Send + Sync {
    fn current_header(&self) -> Header;
    fn header_by_number(&self, number: BlockNumber) -> Option<Header>;
    fn header_by_hash(&self, hash: &Hash32) -> Option<Header>;
    fn total_difficulty(&self) -> u128;
    fn genesis_hash(&self) -> Hash32;
}

/// Outbound side the consensus handler uses to reach its peers. Implemented
/// by the protocol manager.
pub trait Broadcaster: Send + Sync {
    /// Send an opaque consensus payload to the named peer.
    fn send_consensus(&self, peer_id: &str, payload: Vec<u8>);
    /// Fan the payload out to every consensus-role peer.
    fn broadcast_consensus(&self, payload: Vec<u8>);
}

/// Consensus sub-protocol handler: gets first refusal on every inbound wire
/// message. Returning `true` means the message was consumed and the
/// protocol manager must not process it further.
pub trait ConsensusHandler: Send + Sync {
    fn set_broadcaster(&self, broadcaster: Arc<dyn Broadcaster>);
    fn handle_msg(&self, from_peer: &str, msg: &crate::net::messages::Msg) -> Result<bool, EngineError>;
}

pub trait Engine: Send + Sync {
    /// Fill consensus fields of a candidate header (difficulty, extra).
    fn prepare(&self, chain: &dyn ChainReader, header: &mut Header) -> Result<(), EngineError>;

    /// Close the block: compute roots, apply consensus-level state changes,
    /// and assemble the final block. Errors abort the whole assembly cycle.
    fn finalize(
        &self,
        chain: &dyn ChainReader,
        header: Header,
        state: &mut StateDb,
        txs: Vec<Tx>,
        receipts: Vec<Receipt>,
    ) -> Result<Block, EngineError>;

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, seal: bool) -> Result<(), EngineError>;

    /// Produce the sealed block (PoW nonce search, BFT commit seal, ...).
    fn seal(&self, block: Block) -> Result<Block, EngineError>;

    /// Consensus sub-protocol handler, if this engine speaks one.
    fn handler(&self) -> Option<Arc<dyn ConsensusHandler>> {
        None
    }
}

// ── Development engine ────────────────────────────────────────────────────

/// Trivial engine for tests and dev networks: fixed difficulty, no seal
/// verification beyond parent linkage and the monotonic timestamp rule.
pub struct DevEngine {
    pub difficulty: u64,
}

impl DevEngine {
    pub fn new() -> Self {
        Self { difficulty: 1 }
    }
}

impl Default for DevEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for DevEngine {
    fn prepare(&self, _chain: &dyn ChainReader, header: &mut Header) -> Result<(), EngineError> {
        header.difficulty = self.difficulty;
        Ok(())
    }

    fn finalize(
        &self,
        _chain: &dyn ChainReader,
        mut header: Header,
        state: &mut StateDb,
        txs: Vec<Tx>,
        receipts: Vec<Receipt>,
    ) -> Result<Block, EngineError> {
        header.tx_root = tx_root(&txs);
        header.receipts_root = receipts_root(&receipts);
        header.state_root = state.root();
        Ok(Block { header, txs, uncles: Vec::new() })
    }

    fn verify_header(&self, chain: &dyn ChainReader, header: &Header, _seal: bool) -> Result<(), EngineError> {
        let parent = chain
            .header_by_hash(&header.parent_hash)
            .ok_or(EngineError::UnknownParent(header.parent_hash))?;
        if header.number != parent.number + 1 {
            return Err(EngineError::InvalidHeader(format!(
                "number {} does not follow parent {}",
                header.number, parent.number
            )));
        }
        if header.time <= parent.time {
            return Err(EngineError::InvalidHeader("timestamp not after parent".into()));
        }
        Ok(())
    }

    fn seal(&self, block: Block) -> Result<Block, EngineError> {
        Ok(block)
    }
}
