//! Account variants and their common accessors.
//!
//! Accounts form a closed set: a plain legacy account, an externally owned
//! account carrying its own key material, or a program account with storage
//! and code hashes. Balances are unsigned and every debit is checked, so a
//! balance can never go negative; nonces only move forward.

use super::{AccountKey, Hash32};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Account {
    Legacy {
        nonce: u64,
        balance: u128,
    },
    ExternallyOwned {
        nonce: u64,
        balance: u128,
        human_readable: bool,
        key: AccountKey,
    },
    SmartContract {
        nonce: u64,
        balance: u128,
        human_readable: bool,
        storage_root: Hash32,
        code_hash: Hash32,
    },
}

impl Account {
    pub fn new_legacy() -> Self {
        Account::Legacy { nonce: 0, balance: 0 }
    }

    pub fn new_externally_owned(key: AccountKey, human_readable: bool) -> Self {
        Account::ExternallyOwned { nonce: 0, balance: 0, human_readable, key }
    }

    pub fn new_contract(code_hash: Hash32) -> Self {
        Account::SmartContract {
            nonce: 1,
            balance: 0,
            human_readable: false,
            storage_root: Hash32::zero(),
            code_hash,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            Account::Legacy { nonce, .. }
            | Account::ExternallyOwned { nonce, .. }
            | Account::SmartContract { nonce, .. } => *nonce,
        }
    }

    pub fn balance(&self) -> u128 {
        match self {
            Account::Legacy { balance, .. }
            | Account::ExternallyOwned { balance, .. }
            | Account::SmartContract { balance, .. } => *balance,
        }
    }

    pub fn human_readable(&self) -> bool {
        match self {
            Account::Legacy { .. } => false,
            Account::ExternallyOwned { human_readable, .. }
            | Account::SmartContract { human_readable, .. } => *human_readable,
        }
    }

    pub fn is_program(&self) -> bool {
        matches!(self, Account::SmartContract { .. })
    }

    /// Nonce only increases.
    pub fn increment_nonce(&mut self) {
        match self {
            Account::Legacy { nonce, .. }
            | Account::ExternallyOwned { nonce, .. }
            | Account::SmartContract { nonce, .. } => *nonce = nonce.saturating_add(1),
        }
    }

    pub fn credit(&mut self, amount: u128) {
        match self {
            Account::Legacy { balance, .. }
            | Account::ExternallyOwned { balance, .. }
            | Account::SmartContract { balance, .. } => *balance = balance.saturating_add(amount),
        }
    }

    /// Checked debit: fails without mutating when the balance is short.
    pub fn debit(&mut self, amount: u128) -> Result<(), ()> {
        match self {
            Account::Legacy { balance, .. }
            | Account::ExternallyOwned { balance, .. }
            | Account::SmartContract { balance, .. } => match balance.checked_sub(amount) {
                Some(b) => {
                    *balance = b;
                    Ok(())
                }
                None => Err(()),
            },
        }
    }
}
