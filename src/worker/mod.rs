//! Block assembler.
//!
//! One assembly cycle owns one `Task` by value: header preparation, the
//! commit loop over a price/nonce-ordered stream, then `finalize` and
//! `seal` through the consensus engine. A wall-clock watchdog thread is the
//! sole holder of the VM cancel handle; it is handed the handle through a
//! single-slot channel and joined before the commit loop returns, so no
//! timer outlives its cycle.

use crate::consensus::{ChainReader, Engine, EngineError};
use crate::events::{NewMinedBlockEvent, EVENT_CHANNEL_CAPACITY};
use crate::execution::vm::{KvVm, VirtualMachine, VmCancelHandle};
use crate::execution::{apply, ExecutionError, Message};
use crate::metrics::Metrics;
use crate::state::{GasPool, StateDb};
use crate::txpool::ordering::TxsByPriceAndNonce;
use crate::txpool::TxPool;
use crate::types::{header_hash, Address, Block, Hash32, Header, Receipt, Tx};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const GAS_LIMIT_BOUND_DIVISOR: u64 = 1024;
/// How many generations back an uncle's parent may sit.
pub const UNCLE_GENERATION_LIMIT: u64 = 7;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("header timestamp too far ahead of wall clock")]
    TimestampTooFarAhead,
    #[error("uncle already committed: {0}")]
    UncleKnown(Hash32),
    #[error("uncle is an ancestor: {0}")]
    UncleIsAncestor(Hash32),
    #[error("uncle's parent is not a known ancestor: {0}")]
    UncleUnrelated(Hash32),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub coinbase: Address,
    /// Coinbase is only stamped into headers while actively mining.
    pub mining: bool,
    pub gas_floor: u64,
    pub gas_ceil: u64,
    /// Total wall-clock execution budget per block.
    pub execution_time_budget: Duration,
    /// Longest the assembler will sleep for a future timestamp before
    /// giving up on the cycle.
    pub max_timestamp_wait: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coinbase: Address::zero(),
            mining: true,
            gas_floor: 5_000_000,
            gas_ceil: 40_000_000,
            execution_time_budget: Duration::from_millis(250),
            max_timestamp_wait: Duration::from_secs(1),
        }
    }
}

/// Elastic gas limit: move from the parent's limit toward 3/2 of the
/// parent's usage, at most 1/1024 of the limit per block, clamped to the
/// configured floor and ceiling.
pub fn calc_gas_limit(parent: &Header, floor: u64, ceil: u64) -> u64 {
    let decay = parent.gas_limit / GAS_LIMIT_BOUND_DIVISOR;
    let contrib = (parent.gas_used + parent.gas_used / 2) / GAS_LIMIT_BOUND_DIVISOR;
    let mut limit = parent.gas_limit.saturating_sub(decay).saturating_add(contrib);
    let max_step_up = parent.gas_limit.saturating_add(decay);
    if limit > max_step_up {
        limit = max_step_up;
    }
    limit.clamp(floor, ceil)
}

/// Per-transaction outcome of the commit loop. Drives the pool-stream
/// cursor instead of sentinel-error matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxCommitOutcome {
    Included,
    /// Skip this transaction, keep the sender's later nonces.
    SkipTx,
    /// Abandon the sender's whole queue for this block.
    SkipSender,
    /// Hard stop: no further transactions enter this block.
    AbortBlock,
}

/// Work in progress for one block. Created fresh per cycle, consumed by
/// `finalize`, then discarded.
pub struct Task {
    pub header: Header,
    pub state: StateDb,
    pub gas_pool: GasPool,
    pub txs: Vec<Tx>,
    pub receipts: Vec<Receipt>,
    /// Uncle-validity bookkeeping over the recent lineage.
    ancestors: HashSet<Hash32>,
    family: HashSet<Hash32>,
    uncles: Vec<Header>,
}

impl Task {
    fn new(header: Header, state: StateDb) -> Self {
        let gas_pool = GasPool::new(header.gas_limit);
        Self {
            header,
            state,
            gas_pool,
            txs: Vec::new(),
            receipts: Vec::new(),
            ancestors: HashSet::new(),
            family: HashSet::new(),
            uncles: Vec::new(),
        }
    }

    /// Walk the chain back from `parent` to seed the ancestor and family
    /// sets used by `commit_uncle`.
    fn collect_lineage(&mut self, chain: &dyn ChainReader, parent: &Header) {
        let mut cursor = parent.clone();
        for _ in 0..UNCLE_GENERATION_LIMIT {
            let hash = header_hash(&cursor);
            self.ancestors.insert(hash);
            self.family.insert(hash);
            match chain.header_by_hash(&cursor.parent_hash) {
                Some(h) => cursor = h,
                None => break,
            }
        }
    }

    /// Record a candidate uncle. Rejects duplicates, ancestors themselves,
    /// and headers whose parent is outside the known lineage.
    pub fn commit_uncle(&mut self, uncle: Header) -> Result<(), WorkerError> {
        let hash = header_hash(&uncle);
        if self.ancestors.contains(&hash) {
            return Err(WorkerError::UncleIsAncestor(hash));
        }
        if self.family.contains(&hash) {
            return Err(WorkerError::UncleKnown(hash));
        }
        if !self.ancestors.contains(&uncle.parent_hash) {
            return Err(WorkerError::UncleUnrelated(hash));
        }
        self.family.insert(hash);
        self.uncles.push(uncle);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CommitSummary {
    pub included: usize,
    pub skipped_txs: usize,
    pub skipped_senders: usize,
    pub aborted: bool,
}

pub struct Worker {
    cfg: WorkerConfig,
    engine: Arc<dyn Engine>,
    metrics: Arc<Metrics>,
    /// Serializes cycles: exactly one task is current at any time.
    cycle_mu: Mutex<()>,
    /// Advisory pending-state view for RPC readers, republished after every
    /// included transaction. Readers clone, writers replace.
    pending: Arc<RwLock<Option<StateDb>>>,
    mined: broadcast::Sender<NewMinedBlockEvent>,
}

impl Worker {
    pub fn new(engine: Arc<dyn Engine>, cfg: WorkerConfig, metrics: Arc<Metrics>) -> Self {
        let (mined, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cfg,
            engine,
            metrics,
            cycle_mu: Mutex::new(()),
            pending: Arc::new(RwLock::new(None)),
            mined,
        }
    }

    pub fn subscribe_mined(&self) -> broadcast::Receiver<NewMinedBlockEvent> {
        self.mined.subscribe()
    }

    /// Latest advisory pending state, if a cycle has published one.
    /// Eventually consistent by design.
    pub fn pending_state(&self) -> Option<StateDb> {
        self.pending.read().clone()
    }

    /// Run one full assembly cycle against `parent` and its post-state.
    /// Invalid uncle candidates are skipped, not fatal.
    pub fn assemble(
        &self,
        chain: &dyn ChainReader,
        parent: &Header,
        state: StateDb,
        stream: TxsByPriceAndNonce,
        uncle_candidates: &[Header],
    ) -> Result<(Block, Vec<Receipt>, CommitSummary), WorkerError> {
        let _cycle = self.cycle_mu.lock();
        let started = Instant::now();

        let header = self.prepare_header(chain, parent)?;
        let mut task = Task::new(header, state);
        task.collect_lineage(chain, parent);
        for uncle in uncle_candidates {
            if let Err(e) = task.commit_uncle(uncle.clone()) {
                debug!("skipping uncle: {e}");
            }
        }
        let summary = self.commit_transactions(&mut task, stream);

        let Task { header, mut state, txs, receipts, uncles, .. } = task;
        let mut block = self.engine.finalize(chain, header, &mut state, txs, receipts.clone())?;
        block.uncles = uncles;
        let sealed = self.engine.seal(block)?;

        self.metrics.blocks_assembled.inc();
        self.metrics
            .block_assembly_ms
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        info!(
            number = sealed.header.number,
            txs = sealed.txs.len(),
            gas_used = sealed.header.gas_used,
            included = summary.included,
            aborted = summary.aborted,
            "block assembled"
        );
        let _ = self.mined.send(NewMinedBlockEvent { block: sealed.clone() });
        Ok((sealed, receipts, summary))
    }

    /// Header for the next block: monotonic timestamp (with a bounded sleep
    /// when ahead of wall clock), elastic gas limit, coinbase when mining.
    fn prepare_header(&self, chain: &dyn ChainReader, parent: &Header) -> Result<Header, WorkerError> {
        let now = unix_now();
        let time = parent.time.saturating_add(1).max(now);
        if time > now {
            let ahead = Duration::from_secs(time - now);
            if ahead > self.cfg.max_timestamp_wait {
                return Err(WorkerError::TimestampTooFarAhead);
            }
            debug!(wait_ms = ahead.as_millis() as u64, "waiting for header timestamp to become valid");
            std::thread::sleep(ahead);
        }

        let mut header = Header {
            number: parent.number + 1,
            parent_hash: header_hash(parent),
            coinbase: if self.cfg.mining { self.cfg.coinbase } else { Address::zero() },
            tx_root: Hash32::zero(),
            receipts_root: Hash32::zero(),
            state_root: Hash32::zero(),
            gas_limit: calc_gas_limit(parent, self.cfg.gas_floor, self.cfg.gas_ceil),
            gas_used: 0,
            time,
            difficulty: 0,
            extra: Vec::new(),
        };
        self.engine.prepare(chain, &mut header)?;
        Ok(header)
    }

    /// Drain the stream into the task under the block gas budget and the
    /// wall-clock execution budget.
    fn commit_transactions(&self, task: &mut Task, mut stream: TxsByPriceAndNonce) -> CommitSummary {
        let mut vm = KvVm::new();
        let cancel = vm.cancel_handle();

        // Watchdog: owns the only cancellation path into in-flight
        // execution. Handle arrives over a single-slot channel; the
        // completion channel joins it before this function returns.
        let (handoff_tx, handoff_rx) = std::sync::mpsc::sync_channel::<VmCancelHandle>(1);
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let budget = self.cfg.execution_time_budget;
        let watchdog = std::thread::spawn(move || {
            let Ok(handle) = handoff_rx.recv() else { return };
            match done_rx.recv_timeout(budget) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
                Err(RecvTimeoutError::Timeout) => handle.cancel(),
            }
        });
        let _ = handoff_tx.send(cancel.clone());

        let mut summary = CommitSummary::default();
        while let Some(tx) = stream.peek().cloned() {
            if cancel.cancelled() {
                summary.aborted = true;
                self.metrics.commit_time_limit_aborts.inc();
                warn!("commit loop aborted by execution time budget");
                break;
            }
            match self.commit_transaction(task, &mut vm, &tx) {
                TxCommitOutcome::Included => {
                    stream.shift();
                    summary.included += 1;
                    self.metrics.commit_included.inc();
                    *self.pending.write() = Some(task.state.snapshot());
                }
                TxCommitOutcome::SkipTx => {
                    stream.shift();
                    summary.skipped_txs += 1;
                }
                TxCommitOutcome::SkipSender => {
                    stream.pop();
                    summary.skipped_senders += 1;
                }
                TxCommitOutcome::AbortBlock => {
                    summary.aborted = true;
                    self.metrics.commit_time_limit_aborts.inc();
                    warn!("commit loop aborted by execution time budget");
                    break;
                }
            }
        }

        let _ = done_tx.send(());
        let _ = watchdog.join();
        summary
    }

    fn commit_transaction(
        &self,
        task: &mut Task,
        vm: &mut KvVm,
        tx: &Tx,
    ) -> TxCommitOutcome {
        // Snapshot, attempt, roll back on failure.
        let state_snapshot = task.state.snapshot();
        let pool_snapshot = task.gas_pool;
        let msg = Message::from_tx(tx);
        match apply(&mut task.state, vm, &msg, &mut task.gas_pool, &task.header.coinbase) {
            Ok(res) => {
                task.header.gas_used = task.header.gas_used.saturating_add(res.gas_used);
                task.receipts.push(Receipt {
                    tx_hash: tx.hash(),
                    status: res.status,
                    gas_used: res.gas_used,
                    logs: Vec::new(),
                });
                task.txs.push(tx.clone());
                TxCommitOutcome::Included
            }
            Err(err) => {
                task.state = state_snapshot;
                task.gas_pool = pool_snapshot;
                match err {
                    // Block gas budget exhausted by this sender's head tx:
                    // drop it and move on to cheaper senders.
                    ExecutionError::BlockGasLimitReached => TxCommitOutcome::SkipSender,
                    ExecutionError::NonceTooLow { .. } => TxCommitOutcome::SkipTx,
                    // A gap means every later nonce of this sender is
                    // unexecutable here too.
                    ExecutionError::NonceTooHigh { .. } => TxCommitOutcome::SkipSender,
                    ExecutionError::TotalTimeLimitReached => TxCommitOutcome::AbortBlock,
                    other => {
                        debug!(tx = %tx.hash(), "skipping transaction: {other}");
                        TxCommitOutcome::SkipTx
                    }
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Drive assembly from the pool's new-transaction feed: each admission
/// batch triggers a cycle over the current pending set.
pub async fn run_assembly_loop<F>(
    worker: Arc<Worker>,
    pool: Arc<TxPool>,
    chain: Arc<dyn ChainReader>,
    head_state: F,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) where
    F: Fn() -> StateDb + Send + 'static,
{
    let mut new_txs = pool.subscribe_new_txs();
    loop {
        tokio::select! {
            res = new_txs.recv() => match res {
                Ok(_) => {
                    let parent = chain.current_header();
                    let stream = TxsByPriceAndNonce::new(pool.pending());
                    let state = head_state();
                    // Sealed blocks go out on the mined feed; pool cleanup
                    // is the importer's job once the block lands on-chain.
                    if let Err(e) = worker.assemble(chain.as_ref(), &parent, state, stream, &[]) {
                        warn!("assembly cycle failed: {e}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(missed = n, "assembly loop lagged behind tx feed");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = &mut shutdown => {
                info!("assembly loop stopped");
                return;
            }
        }
    }
}
