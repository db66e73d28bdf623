//! Event feeds connecting the pool, the assembler, and the backend.
//!
//! Feeds are tokio broadcast channels: slow subscribers lag and drop, they
//! never block the publisher.

use crate::types::{Block, Hash32, Header, Tx};

/// Emitted by the pool after every successful admission batch.
#[derive(Clone, Debug)]
pub struct NewTxsEvent {
    pub txs: Vec<Tx>,
}

/// Emitted when the canonical head advances.
#[derive(Clone, Debug)]
pub struct ChainHeadEvent {
    pub header: Header,
    pub hash: Hash32,
}

/// Emitted by the assembler once a block has been sealed.
#[derive(Clone, Debug)]
pub struct NewMinedBlockEvent {
    pub block: Block,
}

pub const EVENT_CHANNEL_CAPACITY: usize = 256;
