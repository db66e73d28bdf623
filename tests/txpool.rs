//! Transaction pool tests: admission, indices consistency, capacity,
//! eviction policy, journal recovery, and the price/nonce stream.
//!
//! Run with: cargo test --test txpool

use kestrel::crypto::ed25519::Ed25519Keypair;
use kestrel::crypto::tx::sign_tx;
use kestrel::crypto::PublicKeyBytes;
use kestrel::metrics::Metrics;
use kestrel::txpool::ordering::TxsByPriceAndNonce;
use kestrel::txpool::{run_maintenance, PoolError, TxPool, TxPoolConfig};
use kestrel::types::{Address, Tx, TxType};
use std::sync::Arc;
use std::time::Duration;

// ── Helpers ───────────────────────────────────────────────────────────────

fn keypair(seed: u8) -> Ed25519Keypair {
    let mut s = [0u8; 32];
    s[0] = seed;
    Ed25519Keypair::from_seed(s)
}

fn signed_tx(kp: &Ed25519Keypair, nonce: u64, gas_price: u64, payload: &[u8]) -> Tx {
    let tx = Tx {
        pubkey: PublicKeyBytes(Vec::new()),
        from: Address::zero(),
        to: Some(Address([0xAA; 20])),
        nonce,
        value: 1,
        gas_limit: 21_000,
        gas_price,
        payload: payload.to_vec(),
        tx_type: TxType::ValueTransfer,
        signature: Vec::new(),
        chain_id: 1,
    };
    sign_tx(tx, kp)
}

fn pool_with(capacity: usize) -> TxPool {
    let cfg = TxPoolConfig { capacity, ..Default::default() };
    TxPool::new(cfg, Arc::new(Metrics::unregistered().unwrap()))
}

// ── Admission ─────────────────────────────────────────────────────────────

/// Submitting the same transaction twice stores exactly one copy; the
/// second call reports it as known.
#[test]
fn test_duplicate_admission() {
    let pool = pool_with(100);
    let kp = keypair(1);
    let tx = signed_tx(&kp, 0, 10, b"");
    let hash = tx.hash();

    pool.add(tx.clone()).expect("first admission");
    match pool.add(tx) {
        Err(PoolError::KnownTransaction(h)) => assert_eq!(h, hash),
        other => panic!("expected KnownTransaction, got {other:?}"),
    }
    assert_eq!(pool.len(), 1);
}

/// A forged sender is refused at the door.
#[test]
fn test_invalid_signature_rejected() {
    let pool = pool_with(100);
    let kp = keypair(1);
    let mut tx = signed_tx(&kp, 0, 10, b"");
    tx.from = Address([0x99; 20]);
    match pool.add(tx) {
        Err(PoolError::InvalidSender(_)) => {}
        other => panic!("expected InvalidSender, got {other:?}"),
    }
    assert!(pool.is_empty());
}

/// Once the global cap is hit further admissions fail and the pool never
/// exceeds the cap.
#[test]
fn test_capacity_enforced() {
    let pool = pool_with(3);
    for i in 0..3u8 {
        pool.add(signed_tx(&keypair(i + 1), 0, 10, b"")).expect("under cap");
    }
    match pool.add(signed_tx(&keypair(10), 0, 10, b"")) {
        Err(PoolError::PoolFull) => {}
        other => panic!("expected PoolFull, got {other:?}"),
    }
    assert_eq!(pool.len(), 3);

    // A same-nonce replacement does not grow the pool and is allowed at cap.
    pool.add(signed_tx(&keypair(1), 0, 20, b"replacement")).expect("replacement at cap");
    assert_eq!(pool.len(), 3);
}

// ── Per-sender ordering and replacement ───────────────────────────────────

/// pending() is nonce-ascending per sender no matter the insertion order.
#[test]
fn test_pending_nonce_order() {
    let pool = pool_with(100);
    let kp = keypair(1);
    for nonce in [4u64, 0, 2, 1, 3] {
        pool.add(signed_tx(&kp, nonce, 10, b"")).expect("admitted");
    }
    let pending = pool.pending();
    assert_eq!(pending.len(), 1);
    let (_, txs) = pending.iter().next().expect("one sender");
    let nonces: Vec<u64> = txs.iter().map(|t| t.nonce).collect();
    assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
}

/// A put at an occupied nonce fully replaces the previous entry: the old
/// hash disappears from the index, the new one resolves.
#[test]
fn test_same_nonce_replacement_no_dangling_index() {
    let pool = pool_with(100);
    let kp = keypair(1);
    let old = signed_tx(&kp, 0, 10, b"old");
    let new = signed_tx(&kp, 0, 20, b"new");
    let (old_hash, new_hash) = (old.hash(), new.hash());
    assert_ne!(old_hash, new_hash);

    pool.add(old).expect("old admitted");
    pool.add(new).expect("replacement admitted");

    assert_eq!(pool.len(), 1);
    assert!(pool.get(&old_hash).is_none(), "old entry must not dangle");
    assert_eq!(pool.get(&new_hash).expect("new entry").gas_price, 20);
}

// ── Removal ───────────────────────────────────────────────────────────────

/// remove deletes from both indices; an unknown hash errors; an emptied
/// sender entry is dropped entirely.
#[test]
fn test_remove() {
    let pool = pool_with(100);
    let kp = keypair(1);
    let tx = signed_tx(&kp, 0, 10, b"");
    let hash = tx.hash();
    pool.add(tx).expect("admitted");

    pool.remove(&hash).expect("removes");
    assert!(pool.get(&hash).is_none());
    assert_eq!(pool.stats(), (0, 0), "empty sender entry dropped");

    match pool.remove(&hash) {
        Err(PoolError::UnknownTransaction(_)) => {}
        other => panic!("expected UnknownTransaction, got {other:?}"),
    }
}

// ── Eviction ──────────────────────────────────────────────────────────────

/// Idle non-local senders are evicted; local senders are exempt however
/// stale they are.
#[test]
fn test_eviction_exempts_locals() {
    let cfg = TxPoolConfig {
        capacity: 100,
        account_lifetime: Duration::ZERO,
        ..Default::default()
    };
    let pool = TxPool::new(cfg, Arc::new(Metrics::unregistered().unwrap()));

    let remote = keypair(1);
    let local = keypair(2);
    pool.add(signed_tx(&remote, 0, 10, b"")).expect("remote admitted");
    pool.add_local(signed_tx(&local, 0, 10, b"")).expect("local admitted");
    std::thread::sleep(Duration::from_millis(5));

    let evicted = pool.evict_idle();
    assert_eq!(evicted, 1);
    assert_eq!(pool.len(), 1, "only the local tx survives");
    let survivor = pool.pending();
    let (sender, _) = survivor.iter().next().expect("one sender");
    assert!(pool.is_local(sender));
}

// ── Journal ───────────────────────────────────────────────────────────────

/// Local transactions survive a restart through the journal; remote ones do
/// not. The journal is rotated (compacted) at startup.
#[test]
fn test_journal_restart_recovery() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal_path = dir.path().join("transactions.jsonl");
    let cfg = TxPoolConfig {
        capacity: 100,
        journal_path: Some(journal_path.clone()),
        ..Default::default()
    };

    let local_kp = keypair(1);
    let remote_kp = keypair(2);
    let local_hashes: Vec<_> = {
        let pool = TxPool::new(cfg.clone(), Arc::new(Metrics::unregistered().unwrap()));
        pool.load_journal().expect("journal opens");
        let a = signed_tx(&local_kp, 0, 10, b"a");
        let b = signed_tx(&local_kp, 1, 10, b"b");
        let hashes = vec![a.hash(), b.hash()];
        pool.add_local(a).expect("local a");
        pool.add_local(b).expect("local b");
        pool.add(signed_tx(&remote_kp, 0, 10, b"c")).expect("remote c");
        hashes
    };

    let pool = TxPool::new(cfg, Arc::new(Metrics::unregistered().unwrap()));
    pool.load_journal().expect("journal replays");
    assert_eq!(pool.len(), 2, "only local txs recovered");
    for h in &local_hashes {
        assert!(pool.get(h).is_some(), "journaled tx recovered");
    }
}

/// Corrupt journal lines are skipped, valid ones still load.
#[test]
fn test_journal_tolerates_corruption() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal_path = dir.path().join("transactions.jsonl");
    let cfg = TxPoolConfig {
        capacity: 100,
        journal_path: Some(journal_path.clone()),
        ..Default::default()
    };

    {
        let pool = TxPool::new(cfg.clone(), Arc::new(Metrics::unregistered().unwrap()));
        pool.load_journal().expect("journal opens");
        pool.add_local(signed_tx(&keypair(1), 0, 10, b"")).expect("local");
    }
    // Smash a garbage line into the middle of the file.
    let mut contents = std::fs::read_to_string(&journal_path).expect("journal readable");
    contents.insert_str(0, "{not json at all\n");
    std::fs::write(&journal_path, contents).expect("rewrite");

    let pool = TxPool::new(cfg, Arc::new(Metrics::unregistered().unwrap()));
    pool.load_journal().expect("replay survives corruption");
    assert_eq!(pool.len(), 1);
}

/// The background maintenance loop evicts on its ticker and stops cleanly
/// on shutdown.
#[tokio::test]
async fn test_maintenance_loop_evicts() {
    let cfg = TxPoolConfig {
        capacity: 100,
        account_lifetime: Duration::ZERO,
        evict_interval: Duration::from_millis(20),
        journal_rotate_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let pool = Arc::new(TxPool::new(cfg, Arc::new(Metrics::unregistered().unwrap())));
    pool.add(signed_tx(&keypair(1), 0, 10, b"")).expect("remote admitted");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(run_maintenance(pool.clone(), shutdown_rx));

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !pool.is_empty() {
        assert!(std::time::Instant::now() < deadline, "eviction tick never fired");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(()).expect("signal shutdown");
    task.await.expect("maintenance loop exits");
}

// ── Price/nonce ordered stream ────────────────────────────────────────────

/// Price decides across senders, nonce order holds within one; shift walks
/// a sender, pop abandons it.
#[test]
fn test_price_and_nonce_stream() {
    let pool = pool_with(100);
    let cheap = keypair(1);
    let rich = keypair(2);
    pool.add(signed_tx(&cheap, 0, 100, b"")).expect("cheap 0");
    pool.add(signed_tx(&cheap, 1, 100, b"")).expect("cheap 1");
    pool.add(signed_tx(&rich, 0, 200, b"")).expect("rich 0");

    let mut stream = TxsByPriceAndNonce::new(pool.pending());
    assert_eq!(stream.peek().expect("head").gas_price, 200);
    stream.shift();

    // Only the cheap sender remains; nonces must come out in order.
    assert_eq!(stream.peek().expect("head").nonce, 0);
    stream.shift();
    assert_eq!(stream.peek().expect("head").nonce, 1);
    stream.shift();
    assert!(stream.is_empty());
}

/// pop drops the sender's entire remaining queue.
#[test]
fn test_stream_pop_abandons_sender() {
    let pool = pool_with(100);
    let kp = keypair(1);
    pool.add(signed_tx(&kp, 0, 100, b"")).expect("0");
    pool.add(signed_tx(&kp, 1, 100, b"")).expect("1");

    let mut stream = TxsByPriceAndNonce::new(pool.pending());
    assert!(stream.peek().is_some());
    stream.pop();
    assert!(stream.is_empty(), "later nonces go with the sender");
}
