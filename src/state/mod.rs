//! World-state view used by the state-transition engine.
//!
//! `StateDb` keeps the touched account set in a deterministic map; a
//! snapshot is a plain clone, so the commit loop can roll back a failed
//! transaction by swapping the snapshot back in. `commit`/`open` move the
//! whole view across the key-value `Database` boundary.

use crate::storage::{Database, DbError};
use crate::types::{hash_bytes, Account, AccountKey, Address, Hash32};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

const ACCOUNT_KEY_PREFIX: &[u8] = b"acct:";
const ACCOUNT_INDEX_KEY: &[u8] = b"acct-index";
const STORAGE_KEY: &[u8] = b"acct-storage";
const CODE_KEY: &[u8] = b"acct-code";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("db: {0}")]
    Db(#[from] DbError),
    #[error("corrupt account record for {0}")]
    Corrupt(Address),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StateDb {
    accounts: BTreeMap<Address, Account>,
    /// Contract storage slots, keyed by (account, slot).
    storage: BTreeMap<(Address, Vec<u8>), Vec<u8>>,
    /// Deployed program bytes.
    code: BTreeMap<Address, Vec<u8>>,
}

impl StateDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Genesis allocation: seed funded legacy accounts.
    pub fn with_alloc(alloc: &[(Address, u128)]) -> Self {
        let mut s = Self::new();
        for (addr, balance) in alloc {
            s.accounts.insert(*addr, Account::Legacy { nonce: 0, balance: *balance });
        }
        s
    }

    pub fn exists(&self, addr: &Address) -> bool {
        self.accounts.contains_key(addr)
    }

    pub fn account(&self, addr: &Address) -> Option<&Account> {
        self.accounts.get(addr)
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map(|a| a.nonce()).unwrap_or(0)
    }

    pub fn balance(&self, addr: &Address) -> u128 {
        self.accounts.get(addr).map(|a| a.balance()).unwrap_or(0)
    }

    /// Accounts are created on first touch as legacy accounts.
    fn entry(&mut self, addr: Address) -> &mut Account {
        self.accounts.entry(addr).or_insert_with(Account::new_legacy)
    }

    pub fn add_balance(&mut self, addr: Address, amount: u128) {
        self.entry(addr).credit(amount);
    }

    /// Checked: leaves the account untouched when the balance is short.
    pub fn sub_balance(&mut self, addr: Address, amount: u128) -> Result<(), ()> {
        match self.accounts.get_mut(&addr) {
            Some(a) => a.debit(amount),
            None if amount == 0 => Ok(()),
            None => Err(()),
        }
    }

    pub fn increment_nonce(&mut self, addr: Address) {
        self.entry(addr).increment_nonce();
    }

    /// Explicit creation of an externally owned account (account-creation
    /// transaction type). The caller has already checked non-existence.
    pub fn create_externally_owned(&mut self, addr: Address, key: AccountKey, human_readable: bool) {
        self.accounts.insert(addr, Account::new_externally_owned(key, human_readable));
    }

    pub fn create_contract(&mut self, addr: Address, code: Vec<u8>) {
        let code_hash = hash_bytes(&code);
        self.accounts.insert(addr, Account::new_contract(code_hash));
        self.code.insert(addr, code);
    }

    pub fn code(&self, addr: &Address) -> Option<&[u8]> {
        self.code.get(addr).map(|c| c.as_slice())
    }

    pub fn storage_get(&self, addr: &Address, slot: &[u8]) -> Option<&[u8]> {
        self.storage.get(&(*addr, slot.to_vec())).map(|v| v.as_slice())
    }

    pub fn storage_set(&mut self, addr: Address, slot: Vec<u8>, value: Vec<u8>) {
        self.storage.insert((addr, slot), value);
    }

    /// Returns true when the slot existed.
    pub fn storage_delete(&mut self, addr: &Address, slot: &[u8]) -> bool {
        self.storage.remove(&(*addr, slot.to_vec())).is_some()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Cheap copy used for per-transaction rollback and the published
    /// pending view.
    pub fn snapshot(&self) -> StateDb {
        self.clone()
    }

    /// Deterministic state root over every account's canonical encoding.
    pub fn root(&self) -> Hash32 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"KSTRL_STATE");
        hasher.update(&(self.accounts.len() as u64).to_le_bytes());
        for (addr, acct) in &self.accounts {
            hasher.update(&addr.0);
            let enc = bincode::serialize(acct).unwrap_or_default();
            hasher.update(&(enc.len() as u32).to_le_bytes());
            hasher.update(&enc);
        }
        hasher.update(&(self.storage.len() as u64).to_le_bytes());
        for ((addr, slot), value) in &self.storage {
            hasher.update(&addr.0);
            hasher.update(&(slot.len() as u32).to_le_bytes());
            hasher.update(slot);
            hasher.update(&(value.len() as u32).to_le_bytes());
            hasher.update(value);
        }
        hasher.update(&(self.code.len() as u64).to_le_bytes());
        for (addr, code) in &self.code {
            hasher.update(&addr.0);
            hasher.update(&hash_bytes(code).0);
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(hasher.finalize().as_bytes());
        Hash32(out)
    }

    /// Persist every account through the database batch interface.
    pub fn commit(&self, db: &dyn Database) -> Result<(), StateError> {
        let mut batch = db.new_batch();
        let mut index: Vec<Address> = Vec::with_capacity(self.accounts.len());
        for (addr, acct) in &self.accounts {
            let mut key = ACCOUNT_KEY_PREFIX.to_vec();
            key.extend_from_slice(&addr.0);
            let enc = bincode::serialize(acct)
                .map_err(|e| StateError::Db(DbError::Io(e.to_string())))?;
            batch.put(&key, &enc);
            index.push(*addr);
        }
        let idx = bincode::serialize(&index)
            .map_err(|e| StateError::Db(DbError::Io(e.to_string())))?;
        batch.put(ACCOUNT_INDEX_KEY, &idx);
        let slots = bincode::serialize(&self.storage)
            .map_err(|e| StateError::Db(DbError::Io(e.to_string())))?;
        batch.put(STORAGE_KEY, &slots);
        let code = bincode::serialize(&self.code)
            .map_err(|e| StateError::Db(DbError::Io(e.to_string())))?;
        batch.put(CODE_KEY, &code);
        batch.write()?;
        Ok(())
    }

    pub fn open(db: &dyn Database) -> Result<Self, StateError> {
        let mut s = Self::new();
        let index = match db.get(ACCOUNT_INDEX_KEY)? {
            Some(raw) => bincode::deserialize::<Vec<Address>>(&raw)
                .map_err(|e| StateError::Db(DbError::Io(e.to_string())))?,
            None => return Ok(s),
        };
        for addr in index {
            let mut key = ACCOUNT_KEY_PREFIX.to_vec();
            key.extend_from_slice(&addr.0);
            let raw = db.get(&key)?.ok_or(StateError::Corrupt(addr))?;
            let acct: Account =
                bincode::deserialize(&raw).map_err(|_| StateError::Corrupt(addr))?;
            s.accounts.insert(addr, acct);
        }
        if let Some(raw) = db.get(STORAGE_KEY)? {
            s.storage = bincode::deserialize(&raw)
                .map_err(|e| StateError::Db(DbError::Io(e.to_string())))?;
        }
        if let Some(raw) = db.get(CODE_KEY)? {
            s.code = bincode::deserialize(&raw)
                .map_err(|e| StateError::Db(DbError::Io(e.to_string())))?;
        }
        Ok(s)
    }
}

/// Digest of an address used as a synthetic contract address.
pub fn contract_address(creator: &Address, nonce: u64) -> Address {
    let mut buf = Vec::with_capacity(28);
    buf.extend_from_slice(&creator.0);
    buf.extend_from_slice(&nonce.to_le_bytes());
    let h = hash_bytes(&buf);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h.0[..20]);
    Address(out)
}

// ── Gas pool ──────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GasPoolError {
    #[error("gas limit reached")]
    Exhausted,
}

/// Remaining gas of the block under assembly or validation. Owned by exactly
/// one task at a time; `sub_gas` refuses to go negative.
#[derive(Clone, Copy, Debug)]
pub struct GasPool(u64);

impl GasPool {
    pub fn new(gas: u64) -> Self {
        Self(gas)
    }

    pub fn gas(&self) -> u64 {
        self.0
    }

    pub fn add_gas(&mut self, amount: u64) {
        self.0 = self.0.saturating_add(amount);
    }

    pub fn sub_gas(&mut self, amount: u64) -> Result<(), GasPoolError> {
        match self.0.checked_sub(amount) {
            Some(rest) => {
                self.0 = rest;
                Ok(())
            }
            None => Err(GasPoolError::Exhausted),
        }
    }
}
