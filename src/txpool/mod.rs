//! Transaction pool.
//!
//! Admits, deduplicates, orders, and evicts pending transactions. Two
//! indices are kept consistent under one pool-wide RwLock: per-sender
//! nonce-sorted queues and a global hash index. Local submissions are
//! journaled to disk and replayed after a restart; idle remote senders are
//! evicted by a background maintenance loop.

pub mod journal;
pub mod list;
pub mod ordering;

use crate::crypto::tx::recover_sender;
use crate::events::{NewTxsEvent, EVENT_CHANNEL_CAPACITY};
use crate::metrics::Metrics;
use crate::types::{Address, Hash32, Tx};
use journal::{JournalError, TxJournal};
use list::TxList;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("known transaction: {0}")]
    KnownTransaction(Hash32),
    #[error("txpool is full")]
    PoolFull,
    #[error("unknown transaction: {0}")]
    UnknownTransaction(Hash32),
    #[error("invalid sender: {0}")]
    InvalidSender(String),
}

#[derive(Clone, Debug)]
pub struct TxPoolConfig {
    /// Global transaction cap across all senders.
    pub capacity: usize,
    /// Idle time after which a non-local sender's queue is dropped.
    pub account_lifetime: Duration,
    pub evict_interval: Duration,
    /// Journal file for local transactions; `None` disables journaling.
    pub journal_path: Option<PathBuf>,
    pub journal_rotate_interval: Duration,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 16_384,
            account_lifetime: Duration::from_secs(3 * 3600),
            evict_interval: Duration::from_secs(60),
            journal_path: None,
            journal_rotate_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct TxLookup {
    sender: Address,
    nonce: u64,
}

#[derive(Default)]
struct PoolInner {
    queues: HashMap<Address, TxList>,
    all: HashMap<Hash32, TxLookup>,
    locals: HashSet<Address>,
    last_seen: HashMap<Address, Instant>,
    journal: Option<TxJournal>,
}

impl PoolInner {
    /// Delete from both indices; drops the sender entry when its queue
    /// empties so memory is bounded by active senders.
    fn remove_tx(&mut self, hash: &Hash32) -> Option<Tx> {
        let lookup = self.all.remove(hash)?;
        let queue = self.queues.get_mut(&lookup.sender)?;
        let tx = queue.remove(lookup.nonce);
        if queue.is_empty() {
            self.queues.remove(&lookup.sender);
            self.last_seen.remove(&lookup.sender);
        }
        tx
    }
}

pub struct TxPool {
    cfg: TxPoolConfig,
    inner: RwLock<PoolInner>,
    new_txs: broadcast::Sender<NewTxsEvent>,
    metrics: Arc<Metrics>,
}

impl TxPool {
    pub fn new(cfg: TxPoolConfig, metrics: Arc<Metrics>) -> Self {
        let (new_txs, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { cfg, inner: RwLock::new(PoolInner::default()), new_txs, metrics }
    }

    /// Replay the journal into the pool (senders become local), then rotate
    /// it down to the live set. Call once before serving traffic.
    pub fn load_journal(&self) -> Result<(), JournalError> {
        let Some(path) = self.cfg.journal_path.clone() else { return Ok(()) };
        let mut journal = TxJournal::new(path);
        let mut replayed = Vec::new();
        journal.load(|tx| replayed.push(tx))?;
        self.inner.write().journal = Some(journal);
        for tx in replayed {
            match self.add_inner(tx, true, false) {
                Ok(_) | Err(PoolError::KnownTransaction(_)) => {}
                Err(e) => debug!("journal replay dropped tx: {e}"),
            }
        }
        self.rotate_journal()
    }

    /// Compact the journal to the currently-pooled local transactions.
    pub fn rotate_journal(&self) -> Result<(), JournalError> {
        let mut inner = self.inner.write();
        let locals: Vec<Tx> = inner
            .locals
            .iter()
            .filter_map(|addr| inner.queues.get(addr))
            .flat_map(|q| q.flatten())
            .collect();
        match inner.journal.as_mut() {
            Some(j) => j.rotate(&locals),
            None => Ok(()),
        }
    }

    /// Admit a transaction received from the network.
    pub fn add(&self, tx: Tx) -> Result<(), PoolError> {
        self.add_inner(tx, false, true)
    }

    /// Admit a locally-submitted transaction: the sender becomes exempt
    /// from idle eviction and the tx is journaled.
    pub fn add_local(&self, tx: Tx) -> Result<(), PoolError> {
        self.add_inner(tx, true, true)
    }

    /// Batch admission used by the protocol manager; per-tx results.
    pub fn add_remotes(&self, txs: Vec<Tx>) -> Vec<Result<(), PoolError>> {
        txs.into_iter().map(|tx| self.add(tx)).collect()
    }

    fn add_inner(&self, tx: Tx, local: bool, journal: bool) -> Result<(), PoolError> {
        let hash = tx.hash();
        if let Err(e) = recover_sender(&tx) {
            self.metrics.pool_rejected.inc();
            return Err(PoolError::InvalidSender(e.to_string()));
        }

        let mut inner = self.inner.write();
        if inner.all.contains_key(&hash) {
            self.metrics.pool_rejected.inc();
            return Err(PoolError::KnownTransaction(hash));
        }
        // A same-nonce replacement does not grow the pool, so it is exempt
        // from the capacity gate.
        let replaces = inner
            .queues
            .get(&tx.from)
            .and_then(|q| q.get(tx.nonce))
            .map(|old| old.hash());
        if replaces.is_none() && inner.all.len() >= self.cfg.capacity {
            self.metrics.pool_rejected.inc();
            return Err(PoolError::PoolFull);
        }

        let sender = tx.from;
        let queue = inner.queues.entry(sender).or_insert_with(TxList::new);
        if let Some(old) = queue.put(tx.clone()) {
            // Last write wins; the old entry must not dangle in the index.
            let old_hash = old.hash();
            inner.all.remove(&old_hash);
            debug!(%old_hash, %hash, "replaced pooled transaction at same nonce");
        }
        inner.all.insert(hash, TxLookup { sender, nonce: tx.nonce });
        inner.last_seen.insert(sender, Instant::now());
        if local {
            inner.locals.insert(sender);
            if journal {
                if let Some(j) = inner.journal.as_mut() {
                    if let Err(e) = j.insert(&tx) {
                        warn!("journal append failed: {e}");
                    }
                }
            }
        }
        self.metrics.pool_admitted.inc();
        self.metrics.pool_size.set(inner.all.len() as i64);
        drop(inner);

        let _ = self.new_txs.send(NewTxsEvent { txs: vec![tx] });
        Ok(())
    }

    pub fn get(&self, hash: &Hash32) -> Option<Tx> {
        let inner = self.inner.read();
        let lookup = inner.all.get(hash)?;
        inner.queues.get(&lookup.sender)?.get(lookup.nonce).cloned()
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.inner.read().all.contains_key(hash)
    }

    pub fn remove(&self, hash: &Hash32) -> Result<Tx, PoolError> {
        let mut inner = self.inner.write();
        let tx = inner.remove_tx(hash).ok_or(PoolError::UnknownTransaction(*hash))?;
        self.metrics.pool_size.set(inner.all.len() as i64);
        Ok(tx)
    }

    /// Drop transactions confirmed at or below `nonce` for `sender`
    /// (called after a block import).
    pub fn remove_confirmed(&self, sender: &Address, next_nonce: u64) {
        let mut inner = self.inner.write();
        if let Some(queue) = inner.queues.get_mut(sender) {
            for tx in queue.forward(next_nonce) {
                let h = tx.hash();
                inner.all.remove(&h);
            }
            if inner.queues.get(sender).is_some_and(|q| q.is_empty()) {
                inner.queues.remove(sender);
                inner.last_seen.remove(sender);
            }
        }
        self.metrics.pool_size.set(inner.all.len() as i64);
    }

    /// Pending view grouped by sender, ascending nonce per sender.
    pub fn pending(&self) -> BTreeMap<Address, Vec<Tx>> {
        let inner = self.inner.read();
        inner
            .queues
            .iter()
            .map(|(sender, q)| (*sender, q.flatten()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (transactions, distinct senders)
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.all.len(), inner.queues.len())
    }

    pub fn is_local(&self, sender: &Address) -> bool {
        self.inner.read().locals.contains(sender)
    }

    pub fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent> {
        self.new_txs.subscribe()
    }

    /// Drop queues of non-local senders idle beyond the configured
    /// lifetime. Returns the number of evicted transactions.
    pub fn evict_idle(&self) -> usize {
        let mut inner = self.inner.write();
        let deadline = self.cfg.account_lifetime;
        let idle: Vec<Address> = inner
            .last_seen
            .iter()
            .filter(|(addr, seen)| !inner.locals.contains(*addr) && seen.elapsed() > deadline)
            .map(|(addr, _)| *addr)
            .collect();
        let mut evicted = 0usize;
        for addr in idle {
            if let Some(queue) = inner.queues.remove(&addr) {
                for tx in queue.flatten() {
                    let h = tx.hash();
                    inner.all.remove(&h);
                    evicted += 1;
                }
            }
            inner.last_seen.remove(&addr);
        }
        if evicted > 0 {
            info!(evicted, "evicted idle sender transactions");
            self.metrics.pool_evicted.inc_by(evicted as u64);
            self.metrics.pool_size.set(inner.all.len() as i64);
        }
        evicted
    }
}

/// Background maintenance: idle-sender eviction and periodic journal
/// rotation. Runs until `shutdown` resolves.
pub async fn run_maintenance(pool: Arc<TxPool>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
    let mut evict = tokio::time::interval(pool.cfg.evict_interval);
    let mut rotate = tokio::time::interval(pool.cfg.journal_rotate_interval);
    // The first tick of a tokio interval fires immediately; skip it.
    evict.tick().await;
    rotate.tick().await;
    loop {
        tokio::select! {
            _ = evict.tick() => {
                pool.evict_idle();
            }
            _ = rotate.tick() => {
                if let Err(e) = pool.rotate_journal() {
                    warn!("journal rotation failed: {e}");
                }
            }
            _ = &mut shutdown => {
                info!("txpool maintenance stopped");
                return;
            }
        }
    }
}
