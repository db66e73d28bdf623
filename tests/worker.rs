//! Block assembler tests: header preparation, the commit-outcome table,
//! the execution-time watchdog, and a full assemble cycle through the dev
//! engine.
//!
//! Run with: cargo test --test worker

use kestrel::consensus::{ChainReader, DevEngine};
use kestrel::crypto::ed25519::Ed25519Keypair;
use kestrel::crypto::tx::{derive_address, sign_tx};
use kestrel::crypto::{PublicKeyBytes, Signer};
use kestrel::metrics::Metrics;
use kestrel::state::StateDb;
use kestrel::txpool::ordering::TxsByPriceAndNonce;
use kestrel::txpool::{TxPool, TxPoolConfig};
use kestrel::types::{header_hash, tx_root, Address, BlockNumber, Hash32, Header, Tx, TxType};
use kestrel::worker::{calc_gas_limit, run_assembly_loop, Worker, WorkerConfig, WorkerError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ── Helpers ───────────────────────────────────────────────────────────────

fn addr(b: u8) -> Address {
    Address([b; 20])
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Unsigned tx straight into the assembler; signature checks live at the
/// pool boundary, not in execution.
fn raw_tx(from: Address, nonce: u64, gas_price: u64, gas_limit: u64, payload: &[u8]) -> Tx {
    Tx {
        pubkey: PublicKeyBytes(Vec::new()),
        from,
        to: Some(addr(0xEE)),
        nonce,
        value: 0,
        gas_limit,
        gas_price,
        payload: payload.to_vec(),
        tx_type: TxType::ValueTransfer,
        signature: Vec::new(),
        chain_id: 1,
    }
}

struct TestChain {
    genesis: Header,
}

impl TestChain {
    fn new(gas_limit: u64) -> Self {
        Self {
            genesis: Header {
                number: 0,
                parent_hash: Hash32::zero(),
                coinbase: Address::zero(),
                tx_root: Hash32::zero(),
                receipts_root: Hash32::zero(),
                state_root: Hash32::zero(),
                gas_limit,
                gas_used: 0,
                time: unix_now().saturating_sub(10),
                difficulty: 1,
                extra: Vec::new(),
            },
        }
    }
}

impl ChainReader for TestChain {
    fn current_header(&self) -> Header {
        self.genesis.clone()
    }
    fn header_by_number(&self, number: BlockNumber) -> Option<Header> {
        (number == 0).then(|| self.genesis.clone())
    }
    fn header_by_hash(&self, hash: &Hash32) -> Option<Header> {
        (*hash == header_hash(&self.genesis)).then(|| self.genesis.clone())
    }
    fn total_difficulty(&self) -> u128 {
        1
    }
    fn genesis_hash(&self) -> Hash32 {
        header_hash(&self.genesis)
    }
}

fn make_worker(cfg: WorkerConfig) -> (Worker, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::unregistered().unwrap());
    (Worker::new(Arc::new(DevEngine::new()), cfg, metrics.clone()), metrics)
}

fn stream_of(groups: Vec<(Address, Vec<Tx>)>) -> TxsByPriceAndNonce {
    let map: BTreeMap<Address, Vec<Tx>> = groups.into_iter().collect();
    TxsByPriceAndNonce::new(map)
}

// ── Gas limit formula ─────────────────────────────────────────────────────

/// Full parents push the limit up, empty parents pull it down, and the
/// floor/ceiling clamp always wins.
#[test]
fn test_calc_gas_limit_elastic() {
    let mut parent = TestChain::new(10_000_000).genesis;

    parent.gas_used = parent.gas_limit; // saturated block
    let up = calc_gas_limit(&parent, 5_000_000, 40_000_000);
    assert!(up > parent.gas_limit, "full parent raises the limit");

    parent.gas_used = 0; // empty block
    let down = calc_gas_limit(&parent, 5_000_000, 40_000_000);
    assert!(down < parent.gas_limit, "empty parent lowers the limit");

    assert_eq!(calc_gas_limit(&parent, 11_000_000, 40_000_000), 11_000_000, "floor clamps");
    parent.gas_used = parent.gas_limit;
    assert_eq!(calc_gas_limit(&parent, 1_000, 9_000_000), 9_000_000, "ceiling clamps");
}

// ── Commit-outcome table ──────────────────────────────────────────────────

/// One pass over a mixed stream: nonce gap pops the sender, stale nonce
/// shifts past one tx, an unpayable reservation pops, a valid tx lands.
#[test]
fn test_commit_outcome_table() {
    let chain = TestChain::new(1_000_000);
    let (worker, _metrics) = make_worker(WorkerConfig {
        gas_floor: 1_000_000,
        gas_ceil: 1_000_000,
        ..Default::default()
    });

    let gap_sender = addr(1); // state nonce 0, tx nonce 7 → pop
    let stale_sender = addr(2); // state nonce 1, txs nonce 0 (stale) then 1 (lands)
    let hungry_sender = addr(3); // gas limit above the block budget → pop

    let mut state = StateDb::with_alloc(&[
        (gap_sender, 1 << 80),
        (stale_sender, 1 << 80),
        (hungry_sender, 1 << 80),
    ]);
    state.increment_nonce(stale_sender);

    let stream = stream_of(vec![
        (gap_sender, vec![raw_tx(gap_sender, 7, 30, 21_000, b"")]),
        (stale_sender, vec![
            raw_tx(stale_sender, 0, 20, 21_000, b""),
            raw_tx(stale_sender, 1, 20, 21_000, b""),
        ]),
        (hungry_sender, vec![raw_tx(hungry_sender, 0, 10, 2_000_000, b"")]),
    ]);

    let (block, receipts, summary) =
        worker.assemble(&chain, &chain.genesis, state, stream, &[]).expect("cycle completes");

    assert_eq!(summary.included, 1);
    assert_eq!(summary.skipped_txs, 1, "stale nonce shifted");
    assert_eq!(summary.skipped_senders, 2, "nonce gap and block-gas overdraft popped");
    assert!(!summary.aborted);
    assert_eq!(block.txs.len(), 1);
    assert_eq!(block.txs[0].from, stale_sender);
    assert_eq!(block.txs[0].nonce, 1);
    assert_eq!(receipts.len(), 1);
    assert_eq!(block.header.gas_used, receipts[0].gas_used);
}

// ── End-to-end assembly ───────────────────────────────────────────────────

/// Two valid transactions from one sender: nonce order holds, roots are
/// filled by finalize, the pending snapshot reflects the committed state.
#[test]
fn test_assemble_end_to_end() {
    let chain = TestChain::new(10_000_000);
    let (worker, metrics) = make_worker(WorkerConfig {
        coinbase: addr(9),
        ..Default::default()
    });

    let sender = addr(1);
    let state = StateDb::with_alloc(&[(sender, 1 << 80)]);
    let stream = stream_of(vec![(
        sender,
        vec![
            raw_tx(sender, 0, 10, 30_000, b""),
            raw_tx(sender, 1, 10, 30_000, b""),
        ],
    )]);

    let (block, receipts, summary) =
        worker.assemble(&chain, &chain.genesis, state, stream, &[]).expect("cycle completes");

    assert_eq!(summary.included, 2);
    assert_eq!(block.header.number, 1);
    assert_eq!(block.header.parent_hash, header_hash(&chain.genesis));
    assert_eq!(block.header.coinbase, addr(9));
    assert_eq!(block.header.tx_root, tx_root(&block.txs));
    assert_eq!(block.txs.iter().map(|t| t.nonce).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(receipts.len(), 2);
    assert!(block.header.time > chain.genesis.time);
    assert_eq!(metrics.commit_included.get(), 2);

    let pending = worker.pending_state().expect("snapshot published");
    assert_eq!(pending.nonce(&sender), 2);
}

/// Cross-sender ordering is price-primary; no total order is guaranteed
/// beyond that, but the higher-priced sender commits first here.
#[test]
fn test_assemble_price_priority() {
    let chain = TestChain::new(10_000_000);
    let (worker, _metrics) = make_worker(WorkerConfig::default());

    let cheap = addr(1);
    let rich = addr(2);
    let state = StateDb::with_alloc(&[(cheap, 1 << 80), (rich, 1 << 80)]);
    let stream = stream_of(vec![
        (cheap, vec![raw_tx(cheap, 0, 10, 30_000, b"")]),
        (rich, vec![raw_tx(rich, 0, 500, 30_000, b"")]),
    ]);

    let (block, _, _) = worker.assemble(&chain, &chain.genesis, state, stream, &[]).expect("cycle");
    assert_eq!(block.txs[0].from, rich, "price decides across senders");
    assert_eq!(block.txs[1].from, cheap);
}

// ── Execution time budget ─────────────────────────────────────────────────

/// A zero budget trips the watchdog: the loop aborts instead of finishing
/// the stream, and the abort counter records it.
#[test]
fn test_time_budget_aborts_commit_loop() {
    let chain = TestChain::new(500_000_000);
    let (worker, metrics) = make_worker(WorkerConfig {
        gas_floor: 500_000_000,
        gas_ceil: 500_000_000,
        execution_time_budget: Duration::ZERO,
        ..Default::default()
    });

    let sender = addr(1);
    let state = StateDb::with_alloc(&[(sender, u128::MAX / 2)]);
    let txs: Vec<Tx> = (0..5_000)
        .map(|n| raw_tx(sender, n, 10, 30_000, b"set k v"))
        .collect();
    let stream = stream_of(vec![(sender, txs)]);

    let (block, _, summary) =
        worker.assemble(&chain, &chain.genesis, state, stream, &[]).expect("aborted cycle still finalizes");

    assert!(summary.aborted, "watchdog must abort the loop");
    assert!(summary.included < 5_000, "the stream must not run dry");
    assert!(metrics.commit_time_limit_aborts.get() >= 1);
    assert_eq!(block.txs.len(), summary.included);
}

// ── Uncle bookkeeping ─────────────────────────────────────────────────────

/// Valid sibling headers are committed once; ancestors, duplicates, and
/// dangling candidates are skipped without failing the cycle.
#[test]
fn test_uncle_commitment_rules() {
    let chain = TestChain::new(10_000_000);
    let (worker, _metrics) = make_worker(WorkerConfig::default());

    // A sibling: different coinbase, same parent as the block under
    // assembly.
    let sibling = Header { coinbase: addr(7), number: 1, parent_hash: header_hash(&chain.genesis), ..chain.genesis.clone() };
    // Dangling: parent nobody has heard of.
    let dangling = Header { parent_hash: Hash32([0x55; 32]), ..sibling.clone() };

    let candidates = vec![
        sibling.clone(),
        sibling.clone(),        // duplicate → skipped
        chain.genesis.clone(),  // ancestor → skipped
        dangling,               // unrelated → skipped
    ];

    let (block, _, _) = worker
        .assemble(&chain, &chain.genesis, StateDb::new(), stream_of(vec![]), &candidates)
        .expect("cycle completes");
    assert_eq!(block.uncles.len(), 1);
    assert_eq!(header_hash(&block.uncles[0]), header_hash(&sibling));
}

// ── Pool-driven assembly loop ─────────────────────────────────────────────

/// Admitting a transaction wakes the assembly loop; the sealed block comes
/// out on the mined feed.
#[tokio::test]
async fn test_assembly_loop_driven_by_pool() {
    let chain = Arc::new(TestChain::new(10_000_000));
    let (worker, _metrics) = make_worker(WorkerConfig::default());
    let worker = Arc::new(worker);
    let pool = Arc::new(TxPool::new(
        TxPoolConfig::default(),
        Arc::new(Metrics::unregistered().unwrap()),
    ));

    let kp = Ed25519Keypair::from_seed([3u8; 32]);
    let sender = derive_address(&kp.public_key());
    let state = StateDb::with_alloc(&[(sender, 1 << 80)]);

    let mut mined = worker.subscribe_mined();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(run_assembly_loop(
        worker.clone(),
        pool.clone(),
        chain.clone() as Arc<dyn ChainReader>,
        move || state.clone(),
        shutdown_rx,
    ));

    // Give the loop a beat to subscribe before the first admission.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let tx = sign_tx(
        Tx {
            pubkey: PublicKeyBytes(Vec::new()),
            from: Address::zero(),
            to: Some(addr(0xEE)),
            nonce: 0,
            value: 1,
            gas_limit: 30_000,
            gas_price: 10,
            payload: Vec::new(),
            tx_type: TxType::ValueTransfer,
            signature: Vec::new(),
            chain_id: 1,
        },
        &kp,
    );
    pool.add_local(tx).expect("admitted");

    let event = tokio::time::timeout(Duration::from_secs(5), mined.recv())
        .await
        .expect("block mined in time")
        .expect("mined feed open");
    assert_eq!(event.block.txs.len(), 1);
    assert_eq!(event.block.header.number, 1);

    shutdown_tx.send(()).expect("signal shutdown");
    task.await.expect("loop exits");
}

// ── Header timestamp ──────────────────────────────────────────────────────

/// A parent timestamp far in the future exceeds the bounded wait and fails
/// the cycle instead of stalling the worker.
#[test]
fn test_timestamp_too_far_ahead() {
    let mut chain = TestChain::new(10_000_000);
    chain.genesis.time = unix_now() + 3600;
    let (worker, _metrics) = make_worker(WorkerConfig::default());

    let state = StateDb::new();
    let stream = stream_of(vec![]);
    match worker.assemble(&chain, &chain.genesis, state, stream, &[]) {
        Err(WorkerError::TimestampTooFarAhead) => {}
        other => panic!("expected TimestampTooFarAhead, got {:?}", other.map(|_| ())),
    }
}
