//! TOML configuration.
//!
//! Per-section structs with serde defaults; a missing file means "all
//! defaults". Section values convert into the component configs they
//! describe.

use crate::net::messages::PeerRole;
use crate::txpool::TxPoolConfig;
use crate::types::Address;
use crate::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub txpool: TxPoolSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub network_id: u64,
    pub node_id: String,
    /// consensus | ranger | bridge | unknown
    pub role: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            network_id: 2019,
            node_id: "node-1".into(),
            role: "ranger".into(),
        }
    }
}

impl NetworkSection {
    pub fn peer_role(&self) -> PeerRole {
        match self.role.trim().to_lowercase().as_str() {
            "consensus" => PeerRole::Consensus,
            "ranger" => PeerRole::Ranger,
            "bridge" => PeerRole::Bridge,
            _ => PeerRole::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxPoolSection {
    pub capacity: usize,
    pub account_lifetime_secs: u64,
    pub evict_interval_secs: u64,
    /// Empty string disables the journal.
    pub journal: String,
    pub journal_rotate_secs: u64,
}

impl Default for TxPoolSection {
    fn default() -> Self {
        Self {
            capacity: 16_384,
            account_lifetime_secs: 3 * 3600,
            evict_interval_secs: 60,
            journal: "transactions.jsonl".into(),
            journal_rotate_secs: 3600,
        }
    }
}

impl TxPoolSection {
    pub fn pool_config(&self) -> TxPoolConfig {
        TxPoolConfig {
            capacity: self.capacity,
            account_lifetime: Duration::from_secs(self.account_lifetime_secs),
            evict_interval: Duration::from_secs(self.evict_interval_secs.max(1)),
            journal_path: if self.journal.is_empty() { None } else { Some(self.journal.clone().into()) },
            journal_rotate_interval: Duration::from_secs(self.journal_rotate_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Hex-encoded coinbase address (40 hex chars).
    pub coinbase: String,
    pub mining: bool,
    pub gas_floor: u64,
    pub gas_ceil: u64,
    pub execution_time_budget_ms: u64,
    pub max_timestamp_wait_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            coinbase: String::new(),
            mining: true,
            gas_floor: 5_000_000,
            gas_ceil: 40_000_000,
            execution_time_budget_ms: 250,
            max_timestamp_wait_ms: 1000,
        }
    }
}

impl WorkerSection {
    pub fn worker_config(&self) -> anyhow::Result<WorkerConfig> {
        let coinbase = if self.coinbase.is_empty() {
            Address::zero()
        } else {
            let raw = hex::decode(self.coinbase.trim_start_matches("0x"))?;
            let bytes: [u8; 20] = raw
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("coinbase must be 20 bytes"))?;
            Address(bytes)
        };
        Ok(WorkerConfig {
            coinbase,
            mining: self.mining,
            gas_floor: self.gas_floor,
            gas_ceil: self.gas_ceil,
            execution_time_budget: Duration::from_millis(self.execution_time_budget_ms.max(1)),
            max_timestamp_wait: Duration::from_millis(self.max_timestamp_wait_ms),
        })
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }

    pub fn example_toml() -> &'static str {
        r#"# kestrel node core configuration
# All values shown are defaults.

[network]
network_id = 2019
node_id    = "node-1"
role       = "ranger"        # consensus | ranger | bridge | unknown

[txpool]
capacity              = 16384
account_lifetime_secs = 10800   # idle remote senders evicted after 3h
evict_interval_secs   = 60
journal               = "transactions.jsonl"
journal_rotate_secs   = 3600

[worker]
coinbase                 = ""   # hex address; empty = zero address
mining                   = true
gas_floor                = 5000000
gas_ceil                 = 40000000
execution_time_budget_ms = 250
max_timestamp_wait_ms    = 1000
"#
    }
}
