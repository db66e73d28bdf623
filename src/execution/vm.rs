//! Contract invocation dispatch.
//!
//! The state-transition engine only sees the `VirtualMachine` trait; the
//! built-in `KvVm` interprets a small text payload language against the
//! callee's storage namespace. Execution is metered, opcode-counted, and
//! abortable through `VmCancelHandle`; the block assembler's watchdog is
//! the only holder of that handle.

use crate::state::{contract_address, StateDb};
use crate::types::Address;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const MAX_CODE_SIZE: usize = 24_576;
/// Opcode budget per invocation, independent of gas.
pub const MAX_OPS_PER_CALL: usize = 2_048;

const G_OP: u64 = 300;
const G_STORE_BYTE: u64 = 20;
const G_CREATE: u64 = 32_000;
const G_CODE_BYTE: u64 = 200;
/// Refund credited when a `del` removes an existing slot.
const R_DELETE: u64 = 1_500;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VmError {
    #[error("out of gas")]
    OutOfGas,
    #[error("max call depth exceeded")]
    DepthExceeded,
    #[error("contract address collision")]
    AddressCollision,
    #[error("code too large (max {MAX_CODE_SIZE} bytes)")]
    CodeTooLarge,
    #[error("write protection")]
    WriteProtection,
    #[error("execution reverted")]
    Reverted,
    #[error("opcode count limit exceeded")]
    OpcodeCountExceeded,
    #[error("total execution time limit reached")]
    TotalTimeLimitReached,
    #[error("insufficient balance for transfer")]
    InsufficientBalance,
    #[error("invalid opcode: {0}")]
    InvalidOpcode(String),
    #[error("execution failed")]
    Failed,
}

/// Result of one VM invocation. `gas_left` is what remains of the gas handed
/// in; `refund` is the VM-tracked refund counter, capped later by the engine.
#[derive(Debug, Clone)]
pub struct VmOutcome {
    pub return_data: Vec<u8>,
    pub gas_left: u64,
    pub refund: u64,
    pub err: Option<VmError>,
    /// Set on successful `create`.
    pub created: Option<Address>,
}

impl VmOutcome {
    fn failed(err: VmError, gas_left: u64) -> Self {
        Self { return_data: Vec::new(), gas_left, refund: 0, err: Some(err), created: None }
    }
}

pub trait VirtualMachine: Send {
    fn create(&mut self, state: &mut StateDb, from: Address, code: &[u8], gas: u64) -> VmOutcome;
    fn call(&mut self, state: &mut StateDb, from: Address, to: Address, data: &[u8], gas: u64) -> VmOutcome;
    fn cancel_handle(&self) -> VmCancelHandle;
}

/// Handle that aborts the VM's current and future invocations. Cloneable so
/// the watchdog can own one while the commit loop keeps the VM itself.
#[derive(Clone, Debug)]
pub struct VmCancelHandle(Arc<AtomicBool>);

impl VmCancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Built-in payload interpreter ──────────────────────────────────────────

/// Interprets whitespace-separated commands (`set <k> <v>`, `del <k>`,
/// `revert`) against the callee's storage. An empty payload is a plain
/// value transfer and costs no execution gas.
pub struct KvVm {
    abort: Arc<AtomicBool>,
}

impl KvVm {
    pub fn new() -> Self {
        Self { abort: Arc::new(AtomicBool::new(false)) }
    }

    fn run(&self, state: &mut StateDb, target: Address, program: &[u8], gas: u64) -> VmOutcome {
        let mut gas_left = gas;
        let mut refund = 0u64;
        let text = match std::str::from_utf8(program) {
            Ok(t) => t,
            Err(_) => return VmOutcome::failed(VmError::InvalidOpcode("non-utf8".into()), gas_left),
        };

        let mut ops = 0usize;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            if self.abort.load(Ordering::SeqCst) {
                return VmOutcome::failed(VmError::TotalTimeLimitReached, gas_left);
            }
            ops += 1;
            if ops > MAX_OPS_PER_CALL {
                return VmOutcome::failed(VmError::OpcodeCountExceeded, gas_left);
            }

            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["set", key, rest @ ..] if !rest.is_empty() => {
                    let value = rest.join(" ");
                    let cost = G_OP + (value.len() as u64) * G_STORE_BYTE;
                    match gas_left.checked_sub(cost) {
                        Some(g) => gas_left = g,
                        None => return VmOutcome::failed(VmError::OutOfGas, 0),
                    }
                    state.storage_set(target, key.as_bytes().to_vec(), value.into_bytes());
                }
                ["del", key] => {
                    match gas_left.checked_sub(G_OP) {
                        Some(g) => gas_left = g,
                        None => return VmOutcome::failed(VmError::OutOfGas, 0),
                    }
                    if state.storage_delete(&target, key.as_bytes()) {
                        refund = refund.saturating_add(R_DELETE);
                    }
                }
                ["get", key] => {
                    match gas_left.checked_sub(G_OP) {
                        Some(g) => gas_left = g,
                        None => return VmOutcome::failed(VmError::OutOfGas, 0),
                    }
                    let data = state
                        .storage_get(&target, key.as_bytes())
                        .map(|v| v.to_vec())
                        .unwrap_or_default();
                    return VmOutcome { return_data: data, gas_left, refund, err: None, created: None };
                }
                ["revert"] => {
                    return VmOutcome::failed(VmError::Reverted, gas_left);
                }
                other => {
                    let op = other.first().copied().unwrap_or("").to_string();
                    return VmOutcome::failed(VmError::InvalidOpcode(op), gas_left);
                }
            }
        }

        VmOutcome { return_data: Vec::new(), gas_left, refund, err: None, created: None }
    }
}

impl Default for KvVm {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine for KvVm {
    fn create(&mut self, state: &mut StateDb, from: Address, code: &[u8], gas: u64) -> VmOutcome {
        if self.abort.load(Ordering::SeqCst) {
            return VmOutcome::failed(VmError::TotalTimeLimitReached, gas);
        }
        if code.len() > MAX_CODE_SIZE {
            return VmOutcome::failed(VmError::CodeTooLarge, gas);
        }
        let cost = G_CREATE + (code.len() as u64) * G_CODE_BYTE;
        let gas_left = match gas.checked_sub(cost) {
            Some(g) => g,
            None => return VmOutcome::failed(VmError::OutOfGas, 0),
        };
        let addr = contract_address(&from, state.nonce(&from));
        // Collision: any account already living at the derived address.
        if let Some(existing) = state.account(&addr) {
            if existing.nonce() != 0 || existing.balance() != 0 || existing.is_program() {
                return VmOutcome::failed(VmError::AddressCollision, gas_left);
            }
        }
        state.create_contract(addr, code.to_vec());
        VmOutcome {
            return_data: addr.0.to_vec(),
            gas_left,
            refund: 0,
            err: None,
            created: Some(addr),
        }
    }

    fn call(&mut self, state: &mut StateDb, _from: Address, to: Address, data: &[u8], gas: u64) -> VmOutcome {
        if data.is_empty() {
            return VmOutcome { return_data: Vec::new(), gas_left: gas, refund: 0, err: None, created: None };
        }
        self.run(state, to, data, gas)
    }

    fn cancel_handle(&self) -> VmCancelHandle {
        VmCancelHandle(self.abort.clone())
    }
}
