//! Per-sender nonce-sorted transaction list.

use crate::types::Tx;
use std::collections::BTreeMap;

/// Nonce-ordered transactions of a single sender. A `put` at an occupied
/// nonce replaces the previous entry (last write wins); iteration order is
/// always ascending nonce.
#[derive(Debug, Default)]
pub struct TxList {
    items: BTreeMap<u64, Tx>,
}

impl TxList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning the replaced transaction when the nonce was taken.
    pub fn put(&mut self, tx: Tx) -> Option<Tx> {
        self.items.insert(tx.nonce, tx)
    }

    pub fn get(&self, nonce: u64) -> Option<&Tx> {
        self.items.get(&nonce)
    }

    pub fn remove(&mut self, nonce: u64) -> Option<Tx> {
        self.items.remove(&nonce)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Lowest-nonce entry.
    pub fn head(&self) -> Option<&Tx> {
        self.items.values().next()
    }

    /// All transactions in ascending nonce order.
    pub fn flatten(&self) -> Vec<Tx> {
        self.items.values().cloned().collect()
    }

    /// Drop every entry with nonce strictly below `threshold` (confirmed
    /// on-chain); returns the dropped transactions.
    pub fn forward(&mut self, threshold: u64) -> Vec<Tx> {
        let keep = self.items.split_off(&threshold);
        let dropped = std::mem::replace(&mut self.items, keep);
        dropped.into_values().collect()
    }
}
