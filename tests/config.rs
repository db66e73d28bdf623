//! Configuration and persistence-boundary tests.
//!
//! Run with: cargo test --test config

use kestrel::config::Config;
use kestrel::metrics::{render, Metrics};
use kestrel::net::messages::PeerRole;
use kestrel::state::StateDb;
use kestrel::storage::{Database, MemDb};
use kestrel::types::{AccountKey, Address};
use prometheus::Registry;

/// A missing config file means defaults across every section.
#[test]
fn test_config_defaults_when_absent() {
    let cfg = Config::load("/definitely/not/here.toml").expect("defaults");
    assert_eq!(cfg.network.network_id, 2019);
    assert_eq!(cfg.network.peer_role(), PeerRole::Ranger);
    assert_eq!(cfg.txpool.capacity, 16_384);
    assert!(cfg.worker.mining);
}

/// The documented example parses and converts into component configs.
#[test]
fn test_example_toml_round_trip() {
    let cfg: Config = toml::from_str(Config::example_toml()).expect("example parses");
    let pool_cfg = cfg.txpool.pool_config();
    assert_eq!(pool_cfg.capacity, 16_384);
    assert!(pool_cfg.journal_path.is_some());
    let worker_cfg = cfg.worker.worker_config().expect("worker section converts");
    assert_eq!(worker_cfg.gas_ceil, 40_000_000);
    assert_eq!(worker_cfg.coinbase, Address::zero());
}

/// Partial files only override what they mention.
#[test]
fn test_partial_config_overrides() {
    let cfg: Config = toml::from_str(
        r#"
[network]
role = "consensus"

[worker]
coinbase = "0101010101010101010101010101010101010101"
"#,
    )
    .expect("partial parses");
    assert_eq!(cfg.network.peer_role(), PeerRole::Consensus);
    assert_eq!(cfg.txpool.capacity, 16_384, "untouched section keeps defaults");
    let worker_cfg = cfg.worker.worker_config().expect("converts");
    assert_eq!(worker_cfg.coinbase, Address([1u8; 20]));
}

/// World state survives a trip through the key-value boundary.
#[test]
fn test_state_commit_open_round_trip() {
    let a = Address([1u8; 20]);
    let b = Address([2u8; 20]);
    let mut state = StateDb::with_alloc(&[(a, 1000), (b, 5)]);
    state.increment_nonce(a);
    state.create_externally_owned(Address([3u8; 20]), AccountKey::Nil, true);
    state.storage_set(b, b"slot".to_vec(), b"value".to_vec());

    let db = MemDb::new();
    state.commit(&db).expect("commit");
    assert!(db.has(b"acct-index").expect("index present"));

    let reopened = StateDb::open(&db).expect("open");
    assert_eq!(reopened.root(), state.root(), "roots must agree after reload");
    assert_eq!(reopened.balance(&a), 1000);
    assert_eq!(reopened.nonce(&a), 1);
    assert_eq!(reopened.storage_get(&b, b"slot"), Some(b"value".as_slice()));
}

/// Metrics register against an injected registry and render as text.
#[test]
fn test_metrics_registry_injection() {
    let registry = Registry::new();
    let metrics = Metrics::new(&registry).expect("register");
    metrics.pool_admitted.inc();
    metrics.pool_admitted.inc();
    let text = render(&registry);
    assert!(text.contains("kestrel_pool_admitted_total 2"), "rendered: {text}");

    // A second isolated instance starts from zero.
    let other = Registry::new();
    let m2 = Metrics::new(&other).expect("register again");
    assert_eq!(m2.pool_admitted.get(), 0);
}
