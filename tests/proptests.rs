//! Property tests: pool ordering invariants and the gas partition law.
//!
//! Run with: cargo test --test proptests

use kestrel::crypto::ed25519::Ed25519Keypair;
use kestrel::crypto::tx::sign_tx;
use kestrel::crypto::PublicKeyBytes;
use kestrel::execution::vm::KvVm;
use kestrel::execution::{apply, Message};
use kestrel::metrics::Metrics;
use kestrel::state::{GasPool, StateDb};
use kestrel::txpool::{TxPool, TxPoolConfig};
use kestrel::types::{Address, Tx, TxType};
use proptest::prelude::*;
use std::sync::Arc;

fn keypair(seed: u8) -> Ed25519Keypair {
    let mut s = [0u8; 32];
    s[0] = seed;
    s[1] = 0xC5;
    Ed25519Keypair::from_seed(s)
}

fn signed_tx(kp: &Ed25519Keypair, nonce: u64, payload: Vec<u8>) -> Tx {
    let tx = Tx {
        pubkey: PublicKeyBytes(Vec::new()),
        from: Address::zero(),
        to: Some(Address([0xAA; 20])),
        nonce,
        value: 0,
        gas_limit: 21_000,
        gas_price: 10,
        payload,
        tx_type: TxType::ValueTransfer,
        signature: Vec::new(),
        chain_id: 1,
    };
    sign_tx(tx, kp)
}

proptest! {
    /// Whatever order transactions arrive in (duplicates, replacements,
    /// interleaved senders), pending() is strictly nonce-ascending per
    /// sender and the hash index agrees with the queues.
    #[test]
    fn prop_pending_nonce_sorted(ops in proptest::collection::vec((0u8..4, 0u64..16), 1..48)) {
        let pool = TxPool::new(
            TxPoolConfig { capacity: 1024, ..Default::default() },
            Arc::new(Metrics::unregistered().unwrap()),
        );
        for (i, (sender, nonce)) in ops.iter().enumerate() {
            let kp = keypair(*sender + 1);
            // Payload varies per op so replacements are distinct txs.
            let tx = signed_tx(&kp, *nonce, vec![i as u8]);
            let _ = pool.add(tx);
        }

        let pending = pool.pending();
        let mut total = 0usize;
        for (_, txs) in &pending {
            total += txs.len();
            for pair in txs.windows(2) {
                prop_assert!(pair[0].nonce < pair[1].nonce, "nonces must strictly ascend");
            }
            for tx in txs {
                prop_assert!(pool.get(&tx.hash()).is_some(), "queued tx must resolve by hash");
            }
        }
        prop_assert_eq!(total, pool.len(), "indices must agree on size");
    }

    /// For every successful apply, the reserved gas partitions exactly into
    /// used + refunded + returned, and the coinbase earns used × price.
    #[test]
    fn prop_gas_partition(
        gas_limit in 21_000u64..200_000,
        gas_price in 1u64..1_000,
        sets in 0usize..4,
        delete in proptest::bool::ANY,
    ) {
        let sender = Address([1u8; 20]);
        let contract = Address([2u8; 20]);
        let coinbase = Address([9u8; 20]);
        let mut state = StateDb::with_alloc(&[(sender, 1 << 100)]);
        let mut vm = KvVm::new();
        let initial = 10_000_000u64;
        let mut pool = GasPool::new(initial);

        let mut payload = String::new();
        for i in 0..sets {
            payload.push_str(&format!("set k{i} v{i}\n"));
        }
        if delete && sets > 0 {
            payload.push_str("del k0\n");
        }

        let msg = Message {
            from: sender,
            to: Some(contract),
            nonce: 0,
            gas_limit,
            gas_price,
            value: 0,
            data: payload.into_bytes(),
            tx_type: TxType::Legacy,
            check_nonce: true,
        };

        if let Ok(res) = apply(&mut state, &mut vm, &msg, &mut pool, &coinbase) {
            prop_assert_eq!(
                res.gas_used + res.gas_refunded + res.gas_returned_to_pool,
                gas_limit
            );
            prop_assert_eq!(state.balance(&coinbase), res.gas_used as u128 * gas_price as u128);
            prop_assert_eq!(pool.gas(), initial - gas_limit + res.gas_returned_to_pool);
            prop_assert_eq!(state.nonce(&sender), 1);
        }
    }
}
