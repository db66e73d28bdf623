//! Price-then-nonce ordered stream over the pool's pending view.
//!
//! One heap entry per sender (its lowest-nonce tx); price decides across
//! senders, nonce order inside a sender is preserved by construction. The
//! commit loop drives the cursor: `shift` advances within the current
//! sender, `pop` abandons the sender entirely. Cross-sender order beyond
//! the price key is unspecified.

use crate::types::{Address, Tx};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

struct PriceEntry {
    price: u64,
    sender: Address,
    tx: Tx,
}

impl PartialEq for PriceEntry {
    fn eq(&self, o: &Self) -> bool {
        self.price == o.price
    }
}
impl Eq for PriceEntry {}
impl PartialOrd for PriceEntry {
    fn partial_cmp(&self, o: &Self) -> Option<Ordering> {
        Some(self.cmp(o))
    }
}
impl Ord for PriceEntry {
    fn cmp(&self, o: &Self) -> Ordering {
        self.price.cmp(&o.price)
    }
}

pub struct TxsByPriceAndNonce {
    heads: BinaryHeap<PriceEntry>,
    tails: BTreeMap<Address, VecDeque<Tx>>,
}

impl TxsByPriceAndNonce {
    /// `pending` must already be nonce-sorted per sender (the pool's
    /// `pending()` guarantees it).
    pub fn new(pending: BTreeMap<Address, Vec<Tx>>) -> Self {
        let mut heads = BinaryHeap::with_capacity(pending.len());
        let mut tails = BTreeMap::new();
        for (sender, txs) in pending {
            let mut q: VecDeque<Tx> = txs.into();
            if let Some(head) = q.pop_front() {
                heads.push(PriceEntry { price: head.gas_price, sender, tx: head });
                tails.insert(sender, q);
            }
        }
        Self { heads, tails }
    }

    /// Best-priced head across all senders, without advancing.
    pub fn peek(&self) -> Option<&Tx> {
        self.heads.peek().map(|e| &e.tx)
    }

    /// Advance within the current best sender: its next nonce (if any)
    /// replaces the consumed head.
    pub fn shift(&mut self) {
        if let Some(entry) = self.heads.pop() {
            if let Some(q) = self.tails.get_mut(&entry.sender) {
                if let Some(next) = q.pop_front() {
                    self.heads.push(PriceEntry {
                        price: next.gas_price,
                        sender: entry.sender,
                        tx: next,
                    });
                    return;
                }
            }
            self.tails.remove(&entry.sender);
        }
    }

    /// Abandon the current best sender entirely (its remaining nonces would
    /// be unexecutable anyway).
    pub fn pop(&mut self) {
        if let Some(entry) = self.heads.pop() {
            self.tails.remove(&entry.sender);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}
