//! Ed25519 statement signatures.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey};
pub use ed25519_dalek::{Signature, VerifyingKey};

use crate::error::CryptoError;

/// Signing authority for statements (device key, PUK or PTK).
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
}

impl SigningKeyPair {
    /// Build a keypair from 32 secret bytes.
    ///
    /// In production the bytes MUST come from a cryptographically secure RNG
    /// or a key-derivation step over secret material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(&bytes) }
    }

    /// Public half, embedded in signed statements.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &hex::encode(self.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `message` under `signer`.
///
/// Uses strict verification (rejects malleable and small-order signatures).
pub fn verify(
    signer: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), CryptoError> {
    signer.verify_strict(message, signature).map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let keypair = SigningKeyPair::from_secret_bytes([1; 32]);
        let signature = keypair.sign(b"statement");

        assert!(verify(&keypair.verifying_key(), b"statement", &signature).is_ok());
    }

    #[test]
    fn wrong_signer_fails() {
        let keypair = SigningKeyPair::from_secret_bytes([1; 32]);
        let other = SigningKeyPair::from_secret_bytes([2; 32]);
        let signature = keypair.sign(b"statement");

        assert_eq!(
            verify(&other.verifying_key(), b"statement", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn modified_message_fails() {
        let keypair = SigningKeyPair::from_secret_bytes([1; 32]);
        let signature = keypair.sign(b"statement");

        assert_eq!(
            verify(&keypair.verifying_key(), b"statemenT", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }
}
