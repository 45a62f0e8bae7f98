//! Ed25519 signing for validators and contract deployers.
//!
//! The ledger's data model carries signatures and public keys as hex
//! strings; this crate wraps `ed25519-dalek` behind that string-typed
//! surface so the rest of the engine never touches raw key material.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::{OsRng, RngCore};

pub const PUBLIC_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature verification failed")]
    VerificationFailed,
}

/// An Ed25519 key pair identifying one node or deployer.
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut rng = OsRng;
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self::from_seed(secret)
    }

    /// Deterministic key pair from a 32-byte seed. Used by tests and by
    /// nodes restoring an identity from configuration.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_BYTES] {
        self.verifying_key.to_bytes()
    }

    /// Public key as lowercase hex, the form embedded in ledger records.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Sign and return the hex form used in string-typed signature fields.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.sign(message))
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_BYTES]) -> Result<(), CryptoError> {
        let sig = Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

/// Verify a detached signature against a raw public key.
pub fn verify_detached(
    public_key: &[u8; PUBLIC_KEY_BYTES],
    message: &[u8],
    signature: &[u8; SIGNATURE_BYTES],
) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    key.verify(message, &sig).is_ok()
}

/// Verify a hex-encoded signature against a hex-encoded public key, the
/// shape votes and blocks carry on the wire. Fails closed on any decode
/// error.
pub fn verify_hex(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(key_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let key: [u8; PUBLIC_KEY_BYTES] = match key_bytes.try_into() {
        Ok(key) => key,
        Err(_) => return false,
    };
    let sig: [u8; SIGNATURE_BYTES] = match sig_bytes.try_into() {
        Ok(sig) => sig,
        Err(_) => return false,
    };
    verify_detached(&key, message, &sig)
}
