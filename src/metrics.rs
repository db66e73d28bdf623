//! Prometheus metrics for the node core.
//!
//! Handles are constructed against an injected `Registry`; there is no
//! process-global registry, so tests and embedders can run any number of
//! isolated instances. `Metrics::unregistered()` builds working handles
//! without registering them anywhere (the no-op flavor for tests).

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    // Transaction pool
    pub pool_admitted: IntCounter,
    pub pool_rejected: IntCounter,
    pub pool_evicted: IntCounter,
    pub pool_size: IntGauge,

    // Block assembly
    pub blocks_assembled: IntCounter,
    pub commit_included: IntCounter,
    pub commit_time_limit_aborts: IntCounter,
    pub block_assembly_ms: Histogram,

    // Network
    pub p2p_peers: IntGauge,
    pub msgs_received: IntCounter,
    pub txs_broadcast: IntCounter,
    pub blocks_propagated: IntCounter,
    pub blocks_announced: IntCounter,
    pub peer_disconnects: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        Self::build(Some(registry))
    }

    /// Working handles that report nowhere.
    pub fn unregistered() -> anyhow::Result<Self> {
        Self::build(None)
    }

    fn build(registry: Option<&Registry>) -> anyhow::Result<Self> {
        macro_rules! int_counter {
            ($name:expr, $help:expr) => {{
                let c = IntCounter::with_opts(Opts::new($name, $help))?;
                if let Some(r) = registry {
                    r.register(Box::new(c.clone()))?;
                }
                c
            }};
        }
        macro_rules! int_gauge {
            ($name:expr, $help:expr) => {{
                let g = IntGauge::with_opts(Opts::new($name, $help))?;
                if let Some(r) = registry {
                    r.register(Box::new(g.clone()))?;
                }
                g
            }};
        }
        macro_rules! histogram {
            ($name:expr, $help:expr, $buckets:expr) => {{
                let h = Histogram::with_opts(HistogramOpts::new($name, $help).buckets($buckets))?;
                if let Some(r) = registry {
                    r.register(Box::new(h.clone()))?;
                }
                h
            }};
        }

        Ok(Self {
            pool_admitted: int_counter!("kestrel_pool_admitted_total", "Transactions admitted to the pool"),
            pool_rejected: int_counter!("kestrel_pool_rejected_total", "Transactions rejected (duplicate/full/invalid)"),
            pool_evicted: int_counter!("kestrel_pool_evicted_total", "Transactions evicted from idle senders"),
            pool_size: int_gauge!("kestrel_pool_size", "Current pooled transaction count"),

            blocks_assembled: int_counter!("kestrel_blocks_assembled_total", "Blocks assembled and finalized"),
            commit_included: int_counter!("kestrel_commit_included_total", "Transactions committed into candidate blocks"),
            commit_time_limit_aborts: int_counter!(
                "kestrel_commit_time_limit_aborts_total",
                "Commit loops aborted by the execution time budget"
            ),
            block_assembly_ms: histogram!(
                "kestrel_block_assembly_ms",
                "Wall time of one block assembly cycle (ms)",
                vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
            ),

            p2p_peers: int_gauge!("kestrel_p2p_peers", "Connected peers"),
            msgs_received: int_counter!("kestrel_msgs_received_total", "Wire messages dispatched to handlers"),
            txs_broadcast: int_counter!("kestrel_txs_broadcast_total", "Transactions pushed to peer queues"),
            blocks_propagated: int_counter!("kestrel_blocks_propagated_total", "Full-block propagations enqueued"),
            blocks_announced: int_counter!("kestrel_blocks_announced_total", "Hash announcements enqueued"),
            peer_disconnects: int_counter!("kestrel_peer_disconnects_total", "Peers dropped for protocol faults"),
        })
    }
}

/// Render a registry in Prometheus text format.
pub fn render(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut out = Vec::new();
    encoder.encode(&families, &mut out).unwrap_or_default();
    String::from_utf8(out).unwrap_or_default()
}
