//! Transaction signing helpers.
//!
//! The sign bytes are the same canonical preimage used for the tx hash, so
//! what gets signed is exactly what gets content-addressed.

use super::ed25519::Ed25519Verifier;
use super::{PublicKeyBytes, SignatureBytes, Signer, Verifier};
use crate::types::{tx_preimage, Address, Tx};

/// Address = first 20 bytes of blake3(pubkey).
pub fn derive_address(pubkey: &PublicKeyBytes) -> Address {
    let h = blake3::hash(&pubkey.0);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h.as_bytes()[..20]);
    Address(out)
}

/// Fill in `pubkey`, `from`, and `signature` from the signer's key.
pub fn sign_tx<S: Signer>(mut tx: Tx, signer: &S) -> Tx {
    tx.pubkey = signer.public_key();
    tx.from = derive_address(&tx.pubkey);
    tx.signature = signer.sign(&tx_preimage(&tx)).0;
    tx
}

/// Verify the signature and the from/pubkey binding; returns the sender.
pub fn recover_sender(tx: &Tx) -> Result<Address, &'static str> {
    let addr = derive_address(&tx.pubkey);
    if tx.from != addr {
        return Err("from does not match signing key");
    }
    let sig = SignatureBytes(tx.signature.clone());
    Ed25519Verifier::verify(&tx.pubkey, &tx_preimage(tx), &sig)
        .map_err(|_| "bad signature")?;
    Ok(addr)
}
