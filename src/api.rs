//! Backend contract exposed to the RPC layer.
//!
//! The RPC surface itself lives outside this crate and is a pure
//! translator over this trait: read-only chain and state accessors, pool
//! accessors, and event subscription factories. No business logic belongs
//! behind an RPC method that is not reachable through here.

use crate::events::{ChainHeadEvent, NewMinedBlockEvent, NewTxsEvent};
use crate::execution::ExecutionError;
use crate::state::StateDb;
use crate::txpool::PoolError;
use crate::types::{Address, Block, BlockNumber, Hash32, Header, Receipt, Tx};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

pub trait Backend: Send + Sync {
    // Chain and state, read-only.
    fn header_by_number(&self, number: BlockNumber) -> Option<Header>;
    fn block_by_number(&self, number: BlockNumber) -> Option<Block>;
    fn state_and_header_by_number(&self, number: BlockNumber) -> Option<(StateDb, Header)>;
    fn get_receipts(&self, block_hash: &Hash32) -> Option<Vec<Receipt>>;

    /// Simulate a call against the given block's state; returns return data
    /// and gas used. The mapped VM error (if any) rides the receipt-status
    /// taxonomy.
    fn call(&self, number: BlockNumber, from: Address, to: Address, data: Vec<u8>, gas: u64)
        -> Result<(Vec<u8>, u64), ExecutionError>;

    /// Bounded binary search; fails with the explicit estimation error when
    /// even the maximum allowance cannot execute the call.
    fn estimate_gas(&self, number: BlockNumber, from: Address, to: Address, data: Vec<u8>)
        -> Result<u64, ExecutionError>;

    // Pool.
    fn send_tx(&self, tx: Tx) -> Result<(), PoolError>;
    fn get_pool_transactions(&self) -> Vec<Tx>;
    fn get_pool_transaction(&self, hash: &Hash32) -> Option<Tx>;
    /// (pending transactions, distinct senders)
    fn pool_stats(&self) -> (usize, usize);
    fn pool_content(&self) -> BTreeMap<Address, Vec<Tx>>;

    // Subscriptions.
    fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent>;
    fn subscribe_chain_head(&self) -> broadcast::Receiver<ChainHeadEvent>;
    fn subscribe_mined(&self) -> broadcast::Receiver<NewMinedBlockEvent>;
}
