use super::{CryptoError, PublicKeyBytes, SignatureBytes, Signer, Verifier};
use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier as DalekVerifier, VerifyingKey};
use rand::rngs::OsRng;

#[derive(Clone)]
pub struct Ed25519Keypair {
    sk: SigningKey,
}

impl Ed25519Keypair {
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self { sk: SigningKey::generate(&mut rng) }
    }

    pub fn from_seed(seed32: [u8; 32]) -> Self {
        Self { sk: SigningKey::from_bytes(&seed32) }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.sk.to_bytes()
    }
}

impl Signer for Ed25519Keypair {
    fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.sk.verifying_key().to_bytes().to_vec())
    }

    fn sign(&self, msg: &[u8]) -> SignatureBytes {
        let sig: Signature = self.sk.sign(msg);
        SignatureBytes(sig.to_bytes().to_vec())
    }
}

pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(pk: &PublicKeyBytes, msg: &[u8], sig: &SignatureBytes) -> Result<(), CryptoError> {
        let pk32: [u8; 32] = pk.0.as_slice().try_into()
            .map_err(|_| CryptoError::Key("public key must be 32 bytes".into()))?;
        let vk = VerifyingKey::from_bytes(&pk32)
            .map_err(|e| CryptoError::Key(e.to_string()))?;
        let sig64: [u8; 64] = sig.0.as_slice().try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig64);
        vk.verify(msg, &signature).map_err(|_| CryptoError::InvalidSignature)
    }
}
