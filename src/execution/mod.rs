//! State-transition engine.
//!
//! `apply` runs one message against the world state and a block gas pool,
//! walking the fixed gate order: nonce, gas purchase, intrinsic gas,
//! account-creation handling, VM dispatch, refund, fee settlement. Failed
//! executions that are not consensus-fatal land in the receipt status; the
//! caller decides inclusion from the typed error alone.

pub mod vm;

use crate::state::{GasPool, StateDb};
use crate::types::{Address, Tx, TxType};
use thiserror::Error;
use vm::{VirtualMachine, VmError, VmOutcome};

pub const TX_GAS: u64 = 21_000;
pub const TX_GAS_CONTRACT_CREATION: u64 = 53_000;
/// Surcharge for the account-creation transaction type.
pub const TX_GAS_ACCOUNT_CREATION: u64 = 20_000;
/// Flat per-payload-byte charge.
pub const TX_DATA_GAS: u64 = 10;
/// Anchored chain-data is cheaper than executable payload.
pub const TX_ANCHORING_DATA_GAS: u64 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("nonce too low: expected {expected}, got {got}")]
    NonceTooLow { expected: u64, got: u64 },
    #[error("nonce too high: expected {expected}, got {got}")]
    NonceTooHigh { expected: u64, got: u64 },
    #[error("insufficient balance to pay for gas")]
    InsufficientBalanceForGas,
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    #[error("gas limit {limit} below intrinsic gas {need}")]
    IntrinsicGas { limit: u64, need: u64 },
    #[error("block gas limit reached")]
    BlockGasLimitReached,
    #[error("account already exists")]
    AccountAlreadyExists,
    #[error("account creation requires a target address")]
    MissingCreationTarget,
    #[error("total execution time limit reached")]
    TotalTimeLimitReached,
    #[error("invalid receipt status: {0}")]
    InvalidReceiptStatus(u32),
    #[error("gas required exceeds allowance or always failing transaction")]
    GasEstimationFailed,
}

/// Execution view over a transaction or a synthetic call. Decouples the
/// engine from the wire shape of `Tx`.
#[derive(Clone, Debug)]
pub struct Message {
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price: u64,
    pub value: u128,
    pub data: Vec<u8>,
    pub tx_type: TxType,
    /// Synthetic calls (RPC simulation, gas estimation) skip the nonce gate.
    pub check_nonce: bool,
}

impl Message {
    pub fn from_tx(tx: &Tx) -> Self {
        Self {
            from: tx.from,
            to: tx.to,
            nonce: tx.nonce,
            gas_limit: tx.gas_limit,
            gas_price: tx.gas_price,
            value: tx.value,
            data: tx.payload.clone(),
            tx_type: tx.tx_type.clone(),
            check_nonce: true,
        }
    }

    /// Synthetic call message.
    pub fn call(from: Address, to: Address, data: Vec<u8>, gas_limit: u64, gas_price: u64, value: u128) -> Self {
        Self {
            from,
            to: Some(to),
            nonce: 0,
            gas_limit,
            gas_price,
            value,
            data,
            tx_type: TxType::Legacy,
            check_nonce: false,
        }
    }

    pub fn human_readable(&self) -> bool {
        matches!(self.tx_type, TxType::AccountCreation { human_readable: true, .. })
    }

    /// Minimum charge derived from payload size and transaction type.
    pub fn intrinsic_gas(&self) -> u64 {
        let mut gas = if self.to.is_none() { TX_GAS_CONTRACT_CREATION } else { TX_GAS };
        match &self.tx_type {
            TxType::AccountCreation { .. } => gas = gas.saturating_add(TX_GAS_ACCOUNT_CREATION),
            TxType::ChainDataAnchoring { anchored_data } => {
                gas = gas.saturating_add((anchored_data.len() as u64).saturating_mul(TX_ANCHORING_DATA_GAS));
            }
            TxType::Legacy | TxType::ValueTransfer => {}
        }
        gas.saturating_add((self.data.len() as u64).saturating_mul(TX_DATA_GAS))
    }
}

/// Outcome of a successful `apply`. The three gas fields partition the
/// reserved gas exactly: `gas_used + gas_refunded + gas_returned_to_pool`
/// equals the message gas limit.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub return_data: Vec<u8>,
    pub gas_used: u64,
    pub gas_refunded: u64,
    pub gas_returned_to_pool: u64,
    pub status: u32,
    pub vm_err: Option<VmError>,
    pub created: Option<Address>,
}

/// Apply one message. On `Err` neither `state` nor `gas_pool` has been
/// touched; on `Ok` both reflect the execution, including failed-but-
/// included outcomes recorded in `status`.
pub fn apply(
    state: &mut StateDb,
    vm: &mut dyn VirtualMachine,
    msg: &Message,
    gas_pool: &mut GasPool,
    coinbase: &Address,
) -> Result<ExecutionResult, ExecutionError> {
    // 1. Nonce gate.
    if msg.check_nonce {
        let expected = state.nonce(&msg.from);
        if msg.nonce > expected {
            return Err(ExecutionError::NonceTooHigh { expected, got: msg.nonce });
        }
        if msg.nonce < expected {
            return Err(ExecutionError::NonceTooLow { expected, got: msg.nonce });
        }
    }

    let mut working = state.snapshot();
    let mut pool = *gas_pool;

    // 2. Gas purchase: debit the fee payer, reserve from the block pool.
    let gas_cost = (msg.gas_limit as u128).saturating_mul(msg.gas_price as u128);
    if working.balance(&msg.from) < gas_cost {
        return Err(ExecutionError::InsufficientBalanceForGas);
    }
    pool.sub_gas(msg.gas_limit).map_err(|_| ExecutionError::BlockGasLimitReached)?;
    working
        .sub_balance(msg.from, gas_cost)
        .map_err(|_| ExecutionError::InsufficientBalanceForGas)?;

    // 3. Intrinsic gas.
    let igas = msg.intrinsic_gas();
    let mut gas_left = msg
        .gas_limit
        .checked_sub(igas)
        .ok_or(ExecutionError::IntrinsicGas { limit: msg.gas_limit, need: igas })?;

    // 4. Account-creation transaction type.
    if let TxType::AccountCreation { key, human_readable } = &msg.tx_type {
        let target = msg.to.ok_or(ExecutionError::MissingCreationTarget)?;
        if working.exists(&target) {
            return Err(ExecutionError::AccountAlreadyExists);
        }
        working.create_externally_owned(target, key.clone(), *human_readable);
    }

    // 5. Dispatch. Fee and nonce survive a failed execution; transfer and
    //    storage effects roll back to this point.
    let pre_exec = working.snapshot();
    let outcome: VmOutcome;
    match msg.to {
        None => {
            if working.balance(&msg.from) < msg.value {
                return Err(ExecutionError::InsufficientBalance);
            }
            outcome = vm.create(&mut working, msg.from, &msg.data, gas_left);
            working.increment_nonce(msg.from);
            if outcome.err.is_none() {
                if let Some(addr) = outcome.created {
                    working
                        .sub_balance(msg.from, msg.value)
                        .map_err(|_| ExecutionError::InsufficientBalance)?;
                    working.add_balance(addr, msg.value);
                }
            }
        }
        Some(to) => {
            working.increment_nonce(msg.from);
            if working.balance(&msg.from) < msg.value {
                return Err(ExecutionError::InsufficientBalance);
            }
            working
                .sub_balance(msg.from, msg.value)
                .map_err(|_| ExecutionError::InsufficientBalance)?;
            working.add_balance(to, msg.value);
            outcome = vm.call(&mut working, msg.from, to, &msg.data, gas_left);
        }
    }

    if let Some(err) = &outcome.err {
        match err {
            VmError::InsufficientBalance => return Err(ExecutionError::InsufficientBalance),
            VmError::TotalTimeLimitReached => return Err(ExecutionError::TotalTimeLimitReached),
            _ => {
                // Recorded in the receipt status; fee and nonce stand.
                working = pre_exec;
                working.increment_nonce(msg.from);
            }
        }
    }
    gas_left = outcome.gas_left;

    // 6. Refund: half of gas used, capped by the VM's refund counter, plus
    //    all unused gas, back to the fee payer at the original price.
    let used_before_refund = msg.gas_limit.saturating_sub(gas_left);
    let refund = (used_before_refund / 2).min(outcome.refund);
    working.add_balance(
        msg.from,
        ((gas_left.saturating_add(refund)) as u128).saturating_mul(msg.gas_price as u128),
    );
    pool.add_gas(gas_left);
    let gas_used = msg.gas_limit - gas_left - refund;

    // 7. Fee settlement.
    working.add_balance(*coinbase, (gas_used as u128).saturating_mul(msg.gas_price as u128));

    let status = receipt_status_from_vm_err(outcome.err.as_ref());
    *state = working;
    *gas_pool = pool;
    Ok(ExecutionResult {
        return_data: outcome.return_data,
        gas_used,
        gas_refunded: refund,
        gas_returned_to_pool: gas_left,
        status,
        vm_err: outcome.err,
        created: outcome.created,
    })
}

// ── Receipt status mapping ────────────────────────────────────────────────

pub const RECEIPT_STATUS_FAILED: u32 = 0;
pub const RECEIPT_STATUS_SUCCESSFUL: u32 = 1;
pub const RECEIPT_STATUS_ERR_OUT_OF_GAS: u32 = 2;
pub const RECEIPT_STATUS_ERR_DEPTH_EXCEEDED: u32 = 3;
pub const RECEIPT_STATUS_ERR_ADDRESS_COLLISION: u32 = 4;
pub const RECEIPT_STATUS_ERR_CODE_SIZE_EXCEEDED: u32 = 5;
pub const RECEIPT_STATUS_ERR_WRITE_PROTECTION: u32 = 6;
pub const RECEIPT_STATUS_ERR_EXECUTION_REVERTED: u32 = 7;
pub const RECEIPT_STATUS_ERR_OPCODE_COUNT_EXCEEDED: u32 = 8;

/// Total in the forward direction: any VM error not named here records the
/// generic failed status instead of panicking.
pub fn receipt_status_from_vm_err(err: Option<&VmError>) -> u32 {
    match err {
        None => RECEIPT_STATUS_SUCCESSFUL,
        Some(VmError::OutOfGas) => RECEIPT_STATUS_ERR_OUT_OF_GAS,
        Some(VmError::DepthExceeded) => RECEIPT_STATUS_ERR_DEPTH_EXCEEDED,
        Some(VmError::AddressCollision) => RECEIPT_STATUS_ERR_ADDRESS_COLLISION,
        Some(VmError::CodeTooLarge) => RECEIPT_STATUS_ERR_CODE_SIZE_EXCEEDED,
        Some(VmError::WriteProtection) => RECEIPT_STATUS_ERR_WRITE_PROTECTION,
        Some(VmError::Reverted) => RECEIPT_STATUS_ERR_EXECUTION_REVERTED,
        Some(VmError::OpcodeCountExceeded) => RECEIPT_STATUS_ERR_OPCODE_COUNT_EXCEEDED,
        Some(_) => RECEIPT_STATUS_FAILED,
    }
}

/// Reverse lookup. Unknown statuses are a distinct loud error; an
/// undefined code must never read as success.
pub fn vm_err_from_receipt_status(status: u32) -> Result<Option<VmError>, ExecutionError> {
    match status {
        RECEIPT_STATUS_SUCCESSFUL => Ok(None),
        RECEIPT_STATUS_FAILED => Ok(Some(VmError::Failed)),
        RECEIPT_STATUS_ERR_OUT_OF_GAS => Ok(Some(VmError::OutOfGas)),
        RECEIPT_STATUS_ERR_DEPTH_EXCEEDED => Ok(Some(VmError::DepthExceeded)),
        RECEIPT_STATUS_ERR_ADDRESS_COLLISION => Ok(Some(VmError::AddressCollision)),
        RECEIPT_STATUS_ERR_CODE_SIZE_EXCEEDED => Ok(Some(VmError::CodeTooLarge)),
        RECEIPT_STATUS_ERR_WRITE_PROTECTION => Ok(Some(VmError::WriteProtection)),
        RECEIPT_STATUS_ERR_EXECUTION_REVERTED => Ok(Some(VmError::Reverted)),
        RECEIPT_STATUS_ERR_OPCODE_COUNT_EXCEEDED => Ok(Some(VmError::OpcodeCountExceeded)),
        other => Err(ExecutionError::InvalidReceiptStatus(other)),
    }
}

// ── Gas estimation ────────────────────────────────────────────────────────

/// Bounded binary search for the smallest gas limit under which `msg`
/// executes without a VM error. `cap` is the caller's allowance (usually
/// the block gas limit).
pub fn estimate_gas(
    state: &StateDb,
    vm: &mut dyn VirtualMachine,
    msg: &Message,
    cap: u64,
) -> Result<u64, ExecutionError> {
    let mut succeeds = |gas: u64| -> bool {
        let mut probe = state.snapshot();
        let mut pool = GasPool::new(gas);
        let mut m = msg.clone();
        m.gas_limit = gas;
        m.check_nonce = false;
        match apply(&mut probe, vm, &m, &mut pool, &Address::zero()) {
            Ok(res) => res.vm_err.is_none(),
            Err(_) => false,
        }
    };

    let mut lo = TX_GAS.saturating_sub(1);
    let mut hi = cap;
    if !succeeds(hi) {
        return Err(ExecutionError::GasEstimationFailed);
    }
    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if succeeds(mid) {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Ok(hi)
}
