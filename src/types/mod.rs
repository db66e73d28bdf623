use crate::crypto::PublicKeyBytes;
use serde::{Deserialize, Serialize};

pub mod account;

pub use account::Account;

pub type BlockNumber = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn zero() -> Self { Self([0u8; 32]) }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// 20-byte account address, derived from the signing public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn zero() -> Self { Self([0u8; 20]) }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Key material bound to a non-legacy account.
///
/// `Nil` means "derive from the transaction signature as usual"; an explicit
/// public key decouples the account address from the key that operates it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountKey {
    Nil,
    Public(PublicKeyBytes),
}

/// Transaction kind. Non-legacy kinds carry their own payload variant so the
/// execution engine can dispatch without re-parsing opaque bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxType {
    Legacy,
    ValueTransfer,
    AccountCreation {
        key: AccountKey,
        human_readable: bool,
    },
    ChainDataAnchoring {
        anchored_data: Vec<u8>,
    },
}

impl TxType {
    /// Numeric tag used in content hashes and wire logs.
    pub fn tag(&self) -> u8 {
        match self {
            TxType::Legacy => 0,
            TxType::ValueTransfer => 1,
            TxType::AccountCreation { .. } => 2,
            TxType::ChainDataAnchoring { .. } => 3,
        }
    }

    pub fn account_key(&self) -> Option<&AccountKey> {
        match self {
            TxType::AccountCreation { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// A signed transaction. Immutable once signed; identity is `tx_hash`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub pubkey: PublicKeyBytes,
    pub from: Address,
    /// `None` = contract creation.
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: u128,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub payload: Vec<u8>,
    pub tx_type: TxType,
    pub signature: Vec<u8>,
    pub chain_id: u64,
}

impl Tx {
    pub fn hash(&self) -> Hash32 {
        tx_hash(self)
    }

    /// Upper bound on what this tx can cost the sender.
    pub fn cost(&self) -> u128 {
        self.value.saturating_add((self.gas_limit as u128).saturating_mul(self.gas_price as u128))
    }
}

/// Outcome of one transaction's execution, persisted alongside the block.
///
/// `status` is one of the `execution::receipt` codes; the mapping to and
/// from VM errors is total in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Hash32,
    pub status: u32,
    pub gas_used: u64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<Hash32>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub number: BlockNumber,
    pub parent_hash: Hash32,
    pub coinbase: Address,
    pub tx_root: Hash32,
    pub receipts_root: Hash32,
    pub state_root: Hash32,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Unix seconds; strictly greater than the parent's.
    pub time: u64,
    pub difficulty: u64,
    /// Opaque consensus seal (PoW nonce, BFT commit seal, ...).
    #[serde(default)]
    pub extra: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Tx>,
    /// Non-canonical sibling headers credited by this block. Empty under
    /// BFT engines; retained for PoW compatibility.
    #[serde(default)]
    pub uncles: Vec<Header>,
}

impl Block {
    /// Deterministic block ID; identical to the header hash.
    pub fn id(&self) -> Hash32 {
        header_hash(&self.header)
    }
}

/// Deterministic header hash over a fixed binary layout.
/// Stable across serde versions and field reordering.
pub fn header_hash(h: &Header) -> Hash32 {
    let mut buf = Vec::with_capacity(8 + 8 + 32 + 20 + 32 * 3 + 8 * 4 + h.extra.len());
    buf.extend_from_slice(b"KSTRL_BLK");
    buf.extend_from_slice(&h.number.to_le_bytes());
    buf.extend_from_slice(&h.parent_hash.0);
    buf.extend_from_slice(&h.coinbase.0);
    buf.extend_from_slice(&h.tx_root.0);
    buf.extend_from_slice(&h.receipts_root.0);
    buf.extend_from_slice(&h.state_root.0);
    buf.extend_from_slice(&h.gas_limit.to_le_bytes());
    buf.extend_from_slice(&h.gas_used.to_le_bytes());
    buf.extend_from_slice(&h.time.to_le_bytes());
    buf.extend_from_slice(&h.difficulty.to_le_bytes());
    buf.extend_from_slice(&(h.extra.len() as u32).to_le_bytes());
    buf.extend_from_slice(&h.extra);
    hash_bytes(&buf)
}

/// Block contents without the header, served for `GetBlockBodies`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockBody {
    pub txs: Vec<Tx>,
    #[serde(default)]
    pub uncles: Vec<Header>,
}

pub fn hash_bytes(b: &[u8]) -> Hash32 {
    let h = blake3::hash(b);
    let mut out = [0u8; 32];
    out.copy_from_slice(h.as_bytes());
    Hash32(out)
}

/// Canonical content preimage of a transaction, shared by hashing and
/// signing. The signature is excluded: the hash covers what was signed.
pub fn tx_preimage(tx: &Tx) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + tx.payload.len());
    buf.extend_from_slice(b"KSTRL_TX");
    buf.extend_from_slice(&(tx.pubkey.0.len() as u16).to_le_bytes());
    buf.extend_from_slice(&tx.pubkey.0);
    buf.extend_from_slice(&tx.from.0);
    match &tx.to {
        Some(a) => {
            buf.push(1);
            buf.extend_from_slice(&a.0);
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&tx.nonce.to_le_bytes());
    buf.extend_from_slice(&tx.value.to_le_bytes());
    buf.extend_from_slice(&tx.gas_limit.to_le_bytes());
    buf.extend_from_slice(&tx.gas_price.to_le_bytes());
    buf.extend_from_slice(&tx.chain_id.to_le_bytes());
    buf.push(tx.tx_type.tag());
    match &tx.tx_type {
        TxType::AccountCreation { key, human_readable } => {
            match key {
                AccountKey::Nil => buf.push(0),
                AccountKey::Public(pk) => {
                    buf.push(1);
                    buf.extend_from_slice(&(pk.0.len() as u16).to_le_bytes());
                    buf.extend_from_slice(&pk.0);
                }
            }
            buf.push(*human_readable as u8);
        }
        TxType::ChainDataAnchoring { anchored_data } => {
            buf.extend_from_slice(&(anchored_data.len() as u32).to_le_bytes());
            buf.extend_from_slice(anchored_data);
        }
        TxType::Legacy | TxType::ValueTransfer => {}
    }
    buf.extend_from_slice(&(tx.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&tx.payload);
    buf
}

pub fn tx_hash(tx: &Tx) -> Hash32 {
    hash_bytes(&tx_preimage(tx))
}

/// tx_root: blake3 over concatenated tx hashes.
pub fn tx_root(txs: &[Tx]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"KSTRL_TXROOT");
    hasher.update(&(txs.len() as u32).to_le_bytes());
    for t in txs {
        hasher.update(&tx_hash(t).0);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_bytes());
    Hash32(out)
}

/// receipts_root: hash over a fixed binary receipt layout.
pub fn receipts_root(receipts: &[Receipt]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"KSTRL_RCPROOT");
    hasher.update(&(receipts.len() as u32).to_le_bytes());
    for r in receipts {
        hasher.update(&r.tx_hash.0);
        hasher.update(&r.status.to_le_bytes());
        hasher.update(&r.gas_used.to_le_bytes());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(hasher.finalize().as_bytes());
    Hash32(out)
}
